use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;

pub mod mutex;
pub mod rest;

pub use self::mutex::KeyedMutex;
pub use self::rest::RestHost;

/// Body of a streamed file upload.
pub type FileReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelType {
    #[default]
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "P")]
    Private,
    #[serde(rename = "D")]
    Direct,
    #[serde(rename = "G")]
    Group,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub roles: String,
    #[serde(default)]
    pub delete_at: i64,
    /// Non-empty for synthetic users created on behalf of a remote identity.
    #[serde(default)]
    pub remote_id: Option<String>,
}

impl User {
    pub fn is_guest(&self) -> bool {
        self.roles.split_whitespace().any(|role| role == "system_guest")
    }

    pub fn is_active(&self) -> bool {
        self.delete_at == 0
    }

    pub fn is_synthetic(&self) -> bool {
        self.remote_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

impl Channel {
    pub fn is_direct_or_group(&self) -> bool {
        matches!(self.channel_type, ChannelType::Direct | ChannelType::Group)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub notify_props: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMemberIdentifier {
    pub channel_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default, rename = "type")]
    pub post_type: String,
}

impl Post {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn add_prop(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.props.insert(key.into(), value.into());
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn is_system(&self) -> bool {
        self.post_type.starts_with("system_")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub post_id: String,
    pub emoji_name: String,
    #[serde(default)]
    pub create_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: String,
    pub category: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    pub max_file_size: i64,
    pub max_image_resolution: i64,
}

/// Everything the sync engine needs from the local chat server.
#[async_trait]
pub trait Host: Send + Sync {
    fn bot_user_id(&self) -> &str;
    fn limits(&self) -> HostLimits;

    async fn get_user(&self, user_id: &str) -> Result<User, HostError>;
    async fn update_user(&self, user: &User) -> Result<User, HostError>;

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, HostError>;
    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<ChannelMember>, HostError>;
    async fn get_channels_for_user(&self, user_id: &str) -> Result<Vec<Channel>, HostError>;
    /// Creates the direct channel when it does not exist yet.
    async fn get_direct_channel(&self, user_a: &str, user_b: &str) -> Result<Channel, HostError>;
    async fn get_group_channel(&self, user_ids: &[String]) -> Result<Channel, HostError>;

    async fn create_post(&self, post: &Post) -> Result<Post, HostError>;
    async fn update_post(&self, post: &Post) -> Result<Post, HostError>;
    async fn delete_post(&self, post_id: &str) -> Result<(), HostError>;
    async fn get_post(&self, post_id: &str) -> Result<Post, HostError>;
    async fn send_ephemeral_post(&self, user_id: &str, post: &Post) -> Result<(), HostError>;

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<Reaction>, HostError>;
    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), HostError>;
    async fn remove_reaction(&self, reaction: &Reaction) -> Result<(), HostError>;

    async fn upload_file(
        &self,
        data: Vec<u8>,
        channel_id: &str,
        filename: &str,
    ) -> Result<FileInfo, HostError>;
    /// Uploads from the read half of a pipe. Returning early drops the
    /// reader, which aborts the producer.
    async fn upload_file_stream(
        &self,
        reader: FileReader,
        channel_id: &str,
        filename: &str,
        size: i64,
    ) -> Result<FileInfo, HostError>;
    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, HostError>;

    /// Applies the same notify props to every listed membership in one call.
    async fn patch_channel_members_notifications(
        &self,
        members: &[ChannelMemberIdentifier],
        notify_props: &HashMap<String, String>,
    ) -> Result<(), HostError>;

    async fn get_preference(
        &self,
        user_id: &str,
        category: &str,
        name: &str,
    ) -> Result<Option<String>, HostError>;
    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: &[Preference],
    ) -> Result<(), HostError>;

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, HostError>;
    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<(), HostError>;

    /// Cluster-wide named mutex, held until the guard is dropped.
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()>;
}
