use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::DuplexStream;

use crate::utils::ErrorKind;

pub mod graph;
pub mod models;
pub mod resource;

pub use self::graph::{GraphClient, GraphClientFactory};
pub use self::models::{
    Activity, ActivityBatch, ActivityIds, Attachment, Chat, ChatMember, ChatType, Mention,
    Message, Reaction, Subscription, User,
};
pub use self::resource::parse_resource;

/// Resource used by the tenant-wide chats subscription.
pub const ALL_CHATS_RESOURCE: &str = "chats/getAllMessages";

/// Single structured error returned by every remote call.
#[derive(Error, Debug, Clone)]
#[error("remote request failed status={} code={code}: {message}", status_label(.status))]
pub struct ClientError {
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
    pub retry_after: Option<Duration>,
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

impl ClientError {
    pub fn from_status(status: u16, code: &str, message: &str) -> Self {
        Self {
            status: Some(status),
            code: code.to_string(),
            message: message.to_string(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "network".to_string(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "invalid_request".to_string(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self.status {
            None if self.code == "invalid_request" => ErrorKind::InvalidInput,
            None => ErrorKind::TransientRemote,
            Some(401) => ErrorKind::Unauthorized,
            Some(403) => ErrorKind::PermissionDenied,
            Some(404) => ErrorKind::NotFound,
            Some(409) => ErrorKind::Conflict,
            Some(429) => ErrorKind::RateLimited,
            Some(status) if status >= 500 => ErrorKind::TransientRemote,
            Some(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Capability set for talking to the remote graph. One implementation acts
/// with application credentials, others act on behalf of a single user.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, ClientError>;
    async fn get_chat_message(&self, chat_id: &str, message_id: &str)
    -> Result<Message, ClientError>;
    async fn get_message(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError>;
    async fn get_reply(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
        reply_id: &str,
    ) -> Result<Message, ClientError>;

    /// Posts into a chat. A parent message is rendered as a quoted reference.
    async fn send_chat(
        &self,
        chat_id: &str,
        message: &str,
        parent: Option<&Message>,
    ) -> Result<Message, ClientError>;
    /// Posts into a channel, as a reply when `parent_id` is non-empty.
    async fn send_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message: &str,
    ) -> Result<Message, ClientError>;
    async fn update_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError>;
    async fn update_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError>;
    async fn delete_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
    ) -> Result<(), ClientError>;
    async fn delete_chat_message(&self, chat_id: &str, message_id: &str)
    -> Result<(), ClientError>;

    async fn set_reaction(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError>;
    async fn unset_reaction(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError>;
    async fn set_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError>;
    async fn unset_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError>;

    /// The secret is embedded as `clientState` and echoed back in webhooks.
    async fn subscribe_to_chats(
        &self,
        base_url: &str,
        webhook_secret: &str,
        pay: bool,
    ) -> Result<Subscription, ClientError>;
    async fn subscribe_to_channel(
        &self,
        team_id: &str,
        channel_id: &str,
        base_url: &str,
        webhook_secret: &str,
    ) -> Result<Subscription, ClientError>;
    async fn refresh_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<DateTime<Utc>, ClientError>;
    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ClientError>;
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ClientError>;

    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(i64, String), ClientError>;
    async fn get_file_content(&self, download_url: &str) -> Result<Vec<u8>, ClientError>;
    /// Copies the download into `writer`, which is shut down on every exit
    /// path. Dropping the paired reader aborts the transfer.
    async fn get_file_content_stream(
        &self,
        download_url: &str,
        writer: DuplexStream,
        buffer_size: usize,
    ) -> Result<(), ClientError>;
    async fn get_hosted_file_content(&self, ids: &ActivityIds) -> Result<Vec<u8>, ClientError>;
    async fn get_code_snippet(&self, url: &str) -> Result<String, ClientError>;

    async fn create_or_get_chat_for_users(&self, user_ids: &[String])
    -> Result<String, ClientError>;
    async fn get_user(&self, user_id: &str) -> Result<User, ClientError>;
    async fn get_user_avatar(&self, user_id: &str) -> Result<Vec<u8>, ClientError>;
    async fn get_my_id(&self) -> Result<String, ClientError>;
}

/// Resolves the app client and per-user clients built from stored tokens.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    fn app_client(&self) -> Arc<dyn RemoteClient>;
    async fn client_for_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, crate::utils::SyncError>;
    async fn client_for_teams_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, crate::utils::SyncError>;
}
