use std::sync::Arc;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresChannelLinkStore, PostgresInviteStore, PostgresPostStore, PostgresSubscriptionStore,
    PostgresUserStore,
};
use crate::db::{
    ChannelLinkStore, DatabaseError, InviteStore, PostStore, SubscriptionStore, UserStore,
};
use crate::utils::TokenCipher;

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteChannelLinkStore, SqliteInviteStore, SqlitePostStore, SqliteSubscriptionStore,
    SqliteUserStore, establish_connection,
};

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    post_store: Arc<dyn PostStore>,
    link_store: Arc<dyn ChannelLinkStore>,
    subscription_store: Arc<dyn SubscriptionStore>,
    user_store: Arc<dyn UserStore>,
    invite_store: Arc<dyn InviteStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(
        config: &ConfigDatabaseConfig,
        cipher: Arc<TokenCipher>,
    ) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    post_store: Arc::new(PostgresPostStore::new(pool.clone())),
                    link_store: Arc::new(PostgresChannelLinkStore::new(pool.clone())),
                    subscription_store: Arc::new(PostgresSubscriptionStore::new(pool.clone())),
                    user_store: Arc::new(PostgresUserStore::new(pool.clone(), cipher)),
                    invite_store: Arc::new(PostgresInviteStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is missing".to_string())
                })?;
                Ok(Self::sqlite(path, cipher))
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    /// SQLite opens one connection per call, so `:memory:` does not persist
    /// between calls. Tests use a temporary file instead.
    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: String, cipher: Arc<TokenCipher>) -> Self {
        let path_arc = Arc::new(path.clone());

        Self {
            #[cfg(feature = "postgres")]
            postgres_pool: None,
            sqlite_path: Some(path),
            post_store: Arc::new(SqlitePostStore::new(path_arc.clone())),
            link_store: Arc::new(SqliteChannelLinkStore::new(path_arc.clone())),
            subscription_store: Arc::new(SqliteSubscriptionStore::new(path_arc.clone())),
            user_store: Arc::new(SqliteUserStore::new(path_arc.clone(), cipher)),
            invite_store: Arc::new(SqliteInviteStore::new(path_arc)),
            db_type: DbType::Sqlite,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS post_correspondence (
                    local_post_id TEXT PRIMARY KEY,
                    remote_message_id TEXT NOT NULL,
                    remote_context_id TEXT NOT NULL,
                    last_update_at BIGINT NOT NULL DEFAULT 0,
                    UNIQUE (remote_context_id, remote_message_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_link (
                    local_channel_id TEXT PRIMARY KEY,
                    local_team_id TEXT NOT NULL,
                    remote_team_id TEXT NOT NULL,
                    remote_channel_id TEXT NOT NULL,
                    creator_user_id TEXT NOT NULL,
                    UNIQUE (remote_team_id, remote_channel_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS subscription (
                    subscription_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    remote_team_id TEXT,
                    remote_channel_id TEXT,
                    secret TEXT NOT NULL,
                    expires_on TIMESTAMP WITH TIME ZONE NOT NULL,
                    last_activity_at TIMESTAMP WITH TIME ZONE
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_linkage (
                    local_user_id TEXT PRIMARY KEY,
                    remote_user_id TEXT NOT NULL UNIQUE,
                    token TEXT,
                    last_chat_received_at BIGINT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS invited_user (
                    local_user_id TEXT PRIMARY KEY,
                    invite_pending_since TIMESTAMP WITH TIME ZONE NOT NULL,
                    invite_last_sent_at TIMESTAMP WITH TIME ZONE NOT NULL
                )
                "#,
                "CREATE TABLE IF NOT EXISTS whitelist (local_user_id TEXT PRIMARY KEY)",
                r#"
                CREATE TABLE IF NOT EXISTS oauth_state (
                    nonce TEXT PRIMARY KEY,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscription_single_all_chats ON subscription(kind) WHERE kind = 'allChats'",
                "CREATE INDEX IF NOT EXISTS idx_subscription_channel ON subscription(remote_team_id, remote_channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_post_correspondence_remote_message ON post_correspondence(remote_message_id)",
                "CREATE INDEX IF NOT EXISTS idx_oauth_state_created_at ON oauth_state(created_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&path)?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS post_correspondence (
                    local_post_id TEXT PRIMARY KEY NOT NULL,
                    remote_message_id TEXT NOT NULL,
                    remote_context_id TEXT NOT NULL,
                    last_update_at BIGINT NOT NULL DEFAULT 0,
                    UNIQUE (remote_context_id, remote_message_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_link (
                    local_channel_id TEXT PRIMARY KEY NOT NULL,
                    local_team_id TEXT NOT NULL,
                    remote_team_id TEXT NOT NULL,
                    remote_channel_id TEXT NOT NULL,
                    creator_user_id TEXT NOT NULL,
                    UNIQUE (remote_team_id, remote_channel_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS subscription (
                    subscription_id TEXT PRIMARY KEY NOT NULL,
                    kind TEXT NOT NULL,
                    remote_team_id TEXT,
                    remote_channel_id TEXT,
                    secret TEXT NOT NULL,
                    expires_on TEXT NOT NULL,
                    last_activity_at TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_linkage (
                    local_user_id TEXT PRIMARY KEY NOT NULL,
                    remote_user_id TEXT NOT NULL UNIQUE,
                    token TEXT,
                    last_chat_received_at BIGINT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS invited_user (
                    local_user_id TEXT PRIMARY KEY NOT NULL,
                    invite_pending_since TEXT NOT NULL,
                    invite_last_sent_at TEXT NOT NULL
                )
                "#,
                "CREATE TABLE IF NOT EXISTS whitelist (local_user_id TEXT PRIMARY KEY NOT NULL)",
                r#"
                CREATE TABLE IF NOT EXISTS oauth_state (
                    nonce TEXT PRIMARY KEY NOT NULL,
                    created_at TEXT NOT NULL
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscription_single_all_chats ON subscription(kind) WHERE kind = 'allChats'",
                "CREATE INDEX IF NOT EXISTS idx_subscription_channel ON subscription(remote_team_id, remote_channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_post_correspondence_remote_message ON post_correspondence(remote_message_id)",
                "CREATE INDEX IF NOT EXISTS idx_oauth_state_created_at ON oauth_state(created_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn post_store(&self) -> Arc<dyn PostStore> {
        self.post_store.clone()
    }

    pub fn link_store(&self) -> Arc<dyn ChannelLinkStore> {
        self.link_store.clone()
    }

    pub fn subscription_store(&self) -> Arc<dyn SubscriptionStore> {
        self.subscription_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn invite_store(&self) -> Arc<dyn InviteStore> {
        self.invite_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
