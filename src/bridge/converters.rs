use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

use super::markdown::convert_to_markdown;
use super::{BridgeCore, remote_context_id};
use crate::host::Post;
use crate::msteams::resource::is_hosted_content_url;
use crate::msteams::{Attachment, Chat, Mention, Message};

static EMOJI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<emoji\b[^>]*?\balt="([^"]*)"[^>]*>.*?</emoji>"#).expect("valid emoji regex")
});
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<img .*?>").expect("valid image regex"));
static SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bsrc=(?:"([^"]*)"|'([^']*)')"#).expect("valid src regex"));

/// A remote message rendered as a local post.
#[derive(Debug, Clone)]
pub struct TranslatedPost {
    pub post: Post,
    pub skipped_files: usize,
    /// An attachment was dropped for exceeding the size or resolution limit.
    pub limit_exceeded: bool,
}

fn mention_tag(id: i32, text: &str) -> String {
    format!(r#"<at id="{id}">{text}</at>"#)
}

/// Teams splits a mention of a multi-word display name into one `<at>` per
/// word joined by `&nbsp;`. Rejoins those runs into a single mention.
pub fn collapse_mentions(text: &str, mentions: &[Mention]) -> (String, Vec<Mention>) {
    let mut text = text.to_string();
    let mut collapsed = Vec::with_capacity(mentions.len());

    let mut i = 0;
    while i < mentions.len() {
        let mut mention = mentions[i].clone();
        let mut j = i + 1;
        while j < mentions.len() && mentions[j].user_id == mention.user_id {
            let next = &mentions[j];
            let pair = format!(
                "{}&nbsp;{}",
                mention_tag(mention.id, &mention.mentioned_text),
                mention_tag(next.id, &next.mentioned_text)
            );
            // Genuinely adjacent mentions of the same user stay separate.
            if !text.contains(&pair) {
                break;
            }
            mention.mentioned_text = format!("{} {}", mention.mentioned_text, next.mentioned_text);
            text = text.replacen(&pair, &mention_tag(mention.id, &mention.mentioned_text), 1);
            j += 1;
        }
        collapsed.push(mention);
        i = j;
    }

    (text, collapsed)
}

/// Replaces `<emoji alt="…">…</emoji>` elements with their alt text.
pub fn replace_emojis(text: &str) -> String {
    EMOJI_RE.replace_all(text, "$1").into_owned()
}

/// Strips inline hosted-content images, returning them as file attachments.
pub fn extract_hosted_images(text: &str) -> (String, Vec<Attachment>) {
    let mut images = Vec::new();
    let text = IMAGE_RE
        .replace_all(text, |caps: &Captures| {
            let tag = &caps[0];
            let src = SRC_RE
                .captures(tag)
                .and_then(|src| src.get(1).or_else(|| src.get(2)))
                .map(|m| m.as_str().replace("&amp;", "&"));
            match src {
                Some(src) if is_hosted_content_url(&src) => {
                    images.push(Attachment {
                        content_type: "reference".to_string(),
                        content_url: src,
                        ..Attachment::default()
                    });
                    String::new()
                }
                _ => tag.to_string(),
            }
        })
        .into_owned();
    (text, images)
}

impl BridgeCore {
    /// Rewrites mention tags into local `@username`, `@all` and `@channel`.
    pub async fn handle_mentions(&self, msg: &Message) -> String {
        let (mut text, mentions) = collapse_mentions(&msg.text, &msg.mentions);

        for mention in mentions {
            let replacement = if !mention.user_id.is_empty() {
                match self.local_username(&mention.user_id).await {
                    Some(username) => format!("@{username}"),
                    None => mention.mentioned_text.clone(),
                }
            } else if mention.mentioned_text == "Everyone"
                && !msg.chat_id.is_empty()
                && mention.conversation_id == msg.chat_id
            {
                "@all".to_string()
            } else if !msg.channel_id.is_empty() && mention.conversation_id == msg.channel_id {
                "@channel".to_string()
            } else {
                mention.mentioned_text.clone()
            };

            text = text.replacen(&mention_tag(mention.id, &mention.mentioned_text), &replacement, 1);
        }

        text
    }

    async fn local_username(&self, remote_user_id: &str) -> Option<String> {
        let local_user_id = match self.users().teams_to_local(remote_user_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    "unable to map mentioned user remote_user_id={} error={}",
                    remote_user_id, e
                );
                return None;
            }
        };
        match self.host().get_user(&local_user_id).await {
            Ok(user) => Some(user.username),
            Err(e) => {
                warn!("unable to get mentioned user user_id={} error={}", local_user_id, e);
                None
            }
        }
    }

    /// Markdown body of `msg` plus its attachments, inline images included.
    pub async fn render_text(&self, msg: &Message) -> (String, Vec<Attachment>) {
        let text = self.handle_mentions(msg).await;
        let text = replace_emojis(&text);
        let (text, images) = extract_hosted_images(&text);
        let text = convert_to_markdown(&text);

        let mut attachments = msg.attachments.clone();
        attachments.extend(images);
        (text, attachments)
    }

    /// Translates a remote message into a local post for `channel_id`.
    pub async fn msg_to_post(
        &self,
        channel_id: &str,
        sender_id: &str,
        msg: &Message,
        chat: Option<&Chat>,
        existing_file_ids: &[String],
    ) -> TranslatedPost {
        let (text, attachments) = self.render_text(msg).await;

        let context_id = remote_context_id(&msg.chat_id, &msg.team_id, &msg.channel_id);
        let mut root_id = String::new();
        if !msg.reply_to_id.is_empty() {
            match self.posts().get_by_remote(&context_id, &msg.reply_to_id).await {
                Ok(Some(root)) => root_id = root.local_post_id,
                Ok(None) => {}
                Err(e) => warn!(
                    "unable to look up reply root message_id={} error={}",
                    msg.reply_to_id, e
                ),
            }
        }

        let outcome = self
            .handle_attachments(channel_id, sender_id, text, msg, &attachments, chat, existing_file_ids)
            .await;
        let mut text = outcome.text;
        if !outcome.parent_id.is_empty() {
            root_id = outcome.parent_id;
        }
        if root_id.is_empty() && !msg.subject.is_empty() {
            text = format!("## {}\n{}", msg.subject, text);
        }

        let mut post = Post::new(channel_id, sender_id, text);
        post.root_id = root_id;
        post.file_ids = outcome.file_ids;
        post.create_at = msg.create_at.timestamp_millis();
        post.add_prop(self.sync_prop_key(), true);
        if sender_id == self.bot_user_id() {
            post.add_prop("from_webhook", "true");
            post.add_prop("override_username", msg.user_display_name.clone());
            post.add_prop(
                "override_icon_url",
                format!("{}/avatar/{}", self.config().base_url(), msg.user_id),
            );
        }

        TranslatedPost {
            post,
            skipped_files: outcome.skipped,
            limit_exceeded: outcome.limit_exceeded,
        }
    }
}
