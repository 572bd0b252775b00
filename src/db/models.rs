use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pairs one local post with one remote message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCorrespondence {
    pub local_post_id: String,
    pub remote_message_id: String,
    /// `chat_id` for chat messages, `team_id || channel_id` for channel messages.
    pub remote_context_id: String,
    /// Remote last-modified time in microseconds since the epoch.
    pub last_update_at: i64,
}

impl PostCorrespondence {
    pub fn new(
        local_post_id: impl Into<String>,
        remote_message_id: impl Into<String>,
        remote_context_id: impl Into<String>,
        last_update_at: i64,
    ) -> Self {
        Self {
            local_post_id: local_post_id.into(),
            remote_message_id: remote_message_id.into(),
            remote_context_id: remote_context_id.into(),
            last_update_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub local_team_id: String,
    pub local_channel_id: String,
    pub remote_team_id: String,
    pub remote_channel_id: String,
    pub creator_user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    AllChats,
    Channel,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::AllChats => "allChats",
            SubscriptionKind::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allChats" => Some(SubscriptionKind::AllChats),
            "channel" => Some(SubscriptionKind::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub kind: SubscriptionKind,
    pub remote_team_id: Option<String>,
    pub remote_channel_id: Option<String>,
    pub secret: String,
    pub expires_on: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
    pub fn global(subscription_id: impl Into<String>, secret: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            kind: SubscriptionKind::AllChats,
            remote_team_id: None,
            remote_channel_id: None,
            secret: secret.into(),
            expires_on,
            last_activity_at: None,
        }
    }

    pub fn channel(
        subscription_id: impl Into<String>,
        remote_team_id: impl Into<String>,
        remote_channel_id: impl Into<String>,
        secret: impl Into<String>,
        expires_on: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            kind: SubscriptionKind::Channel,
            remote_team_id: Some(remote_team_id.into()),
            remote_channel_id: Some(remote_channel_id.into()),
            secret: secret.into(),
            expires_on,
            last_activity_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

/// A local user's connection to a remote identity. A missing token means
/// the user is disconnected but has connected before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLinkage {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub token: Option<String>,
    pub last_chat_received_at: Option<i64>,
}

impl UserLinkage {
    pub fn is_connected(&self) -> bool {
        self.token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitedUser {
    pub local_user_id: String,
    pub invite_pending_since: DateTime<Utc>,
    pub invite_last_sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub local_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}
