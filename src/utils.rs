pub mod alert;
pub mod crypto;
pub mod error;
pub mod logging;

pub use self::alert::BotNotifier;
pub use self::crypto::TokenCipher;
pub use self::error::{ErrorKind, SyncError};
