use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::BridgeCore;
use super::attachments::{is_file_attachment, strip_attachment_tags};
use crate::host::Post;
use crate::metrics::DISCARDED_REASON_NONE;
use crate::msteams::{Chat, Message};

fn chat_link(chat_id: &str, message_id: &str, tenant_id: &str) -> String {
    format!(
        "https://teams.microsoft.com/l/message/{chat_id}/{message_id}?tenantId={tenant_id}&context={{\"contextType\":\"chat\"}}"
    )
}

/// Builds the DM text announcing a chat message. Returns `None` when
/// there is nothing worth notifying.
pub fn format_notification_message(
    sender: &str,
    topic: &str,
    chat_size: usize,
    link: &str,
    message: &str,
    attachment_count: usize,
) -> Option<String> {
    let message = message.trim();
    if message.is_empty() && attachment_count == 0 {
        return None;
    }

    let topic = if topic.is_empty() {
        String::new()
    } else {
        format!(": {topic}")
    };

    let header = match chat_size {
        0 | 1 => return None,
        2 => format!("**{sender}** messaged you in an [MS Teams chat{topic}]({link}):"),
        3 => format!(
            "**{sender}** messaged you and 1 other user in an [MS Teams group chat{topic}]({link}):"
        ),
        n => format!(
            "**{sender}** messaged you and {} other users in an [MS Teams group chat{topic}]({link}):",
            n - 2
        ),
    };

    let mut components = vec![header];
    if !message.is_empty() {
        components.push(format!("> {}", message.replace('\n', "\n> ")));
    }
    match attachment_count {
        0 => {}
        1 => components.push("\n*This message was originally sent with one attachment.*".to_string()),
        n => components.push(format!(
            "\n*This message was originally sent with {n} attachments.*"
        )),
    }

    Some(components.join("\n"))
}

impl BridgeCore {
    /// DMs every opted-in local member of `chat` other than the author.
    /// `mirrored` is the local post already created for the message, if any.
    pub async fn handle_created_activity_notification(
        &self,
        msg: &Message,
        chat: &Chat,
        mirrored: Option<&Post>,
    ) -> &'static str {
        let (text, attachments) = self.render_text(msg).await;
        let text = strip_attachment_tags(&text);
        let file_count = attachments.iter().filter(|a| is_file_attachment(a)).count();
        let link = chat_link(&chat.id, &msg.id, &self.config().msteams.tenant_id);

        let Some(message) = format_notification_message(
            &msg.user_display_name,
            &chat.topic,
            chat.members.len(),
            &link,
            &text,
            file_count,
        ) else {
            debug!("nothing to notify chat_id={} message_id={}", chat.id, msg.id);
            return DISCARDED_REASON_NONE;
        };

        let mut notified = Vec::new();
        for member in &chat.members {
            if member.user_id == msg.user_id {
                continue;
            }

            let local_user_id = match self.users().teams_to_local(&member.user_id).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "failed to map remote user remote_user_id={} error={}",
                        member.user_id, e
                    );
                    continue;
                }
            };

            if !self.notifications_enabled(&local_user_id).await {
                continue;
            }

            let mut props = Map::new();
            props.insert("from_webhook".to_string(), Value::from("true"));
            props.insert("use_user_icon".to_string(), Value::from("true"));
            match self
                .notifier()
                .notify_with_props(&local_user_id, &message, props)
                .await
            {
                Ok(_) => {
                    info!("sent chat notification user_id={}", local_user_id);
                    self.metrics()
                        .observe_notification(chat.is_group(), file_count > 0);
                    notified.push(local_user_id);
                }
                Err(e) => warn!(
                    "failed to send chat notification user_id={} error={}",
                    local_user_id, e
                ),
            }
        }

        if !notified.is_empty() {
            let received_at = match mirrored {
                Some(post) => post.create_at * 1000,
                None => msg.create_at.timestamp_micros(),
            };
            if let Err(e) = self
                .users()
                .set_users_last_chat_received_at(&notified, received_at)
                .await
            {
                warn!("unable to set the last chat received at error={}", e);
            }
        }

        DISCARDED_REASON_NONE
    }
}
