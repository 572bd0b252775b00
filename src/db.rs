pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    ChannelLink, InvitedUser, OAuthState, PostCorrespondence, SubscriptionKind,
    SubscriptionRecord, UserLinkage, WhitelistEntry,
};
pub use self::stores::{ChannelLinkStore, InviteStore, PostStore, SubscriptionStore, UserStore};

pub mod error;
pub mod manager;
pub mod models;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;

