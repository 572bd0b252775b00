use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChatType {
    #[default]
    Unknown,
    OneOnOne,
    Group,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMember {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub members: Vec<ChatMember>,
    pub chat_type: ChatType,
    pub topic: String,
}

impl Chat {
    pub fn is_group(&self) -> bool {
        self.chat_type == ChatType::Group
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub id: i32,
    pub user_id: String,
    pub mentioned_text: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub content_type: String,
    pub content: String,
    pub name: String,
    pub content_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub reaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub user_display_name: String,
    pub text: String,
    pub subject: String,
    pub reply_to_id: String,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub mentions: Vec<Mention>,
    pub channel_id: String,
    pub team_id: String,
    pub chat_id: String,
    pub create_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl Default for Message {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: String::new(),
            user_id: String::new(),
            user_display_name: String::new(),
            text: String::new(),
            subject: String::new(),
            reply_to_id: String::new(),
            attachments: Vec::new(),
            reactions: Vec::new(),
            mentions: Vec::new(),
            channel_id: String::new(),
            team_id: String::new(),
            chat_id: String::new(),
            create_at: epoch,
            last_update_at: epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub kind: String,
    pub team_id: String,
    pub channel_id: String,
    pub resource: String,
    pub expires_on: DateTime<Utc>,
    pub notification_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub mail: String,
    pub user_type: String,
    pub is_account_enabled: bool,
}

/// One change notification delivered to the webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub client_state: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub lifecycle_event: String,
    /// Inline copy of the changed message, when the subscription asked for one.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl Activity {
    pub fn is_lifecycle_event(&self) -> bool {
        !self.lifecycle_event.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityBatch {
    #[serde(default)]
    pub value: Vec<Activity>,
}

/// Identifiers extracted from a change notification resource path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityIds {
    pub chat_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub reply_id: String,
    pub hosted_contents_id: String,
}

impl ActivityIds {
    pub fn is_chat(&self) -> bool {
        !self.chat_id.is_empty()
    }
}
