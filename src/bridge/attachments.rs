use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BridgeCore, remote_context_id};
use crate::media::{check_file_size, check_image_resolution, image_extension};
use crate::metrics::{
    ACTION_CREATED, DISCARDED_REASON_EMPTY_FILE_ID, DISCARDED_REASON_FILE_LIMIT_REACHED,
    DISCARDED_REASON_MAX_FILE_SIZE_EXCEEDED, DISCARDED_REASON_NONE, DISCARDED_REASON_OTHER,
    DISCARDED_REASON_RESOLUTION_TOO_HIGH, DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA,
    SOURCE_MSTEAMS,
};
use crate::msteams::resource::{is_hosted_content_url, parse_hosted_content_url};
use crate::msteams::{Attachment, Chat, Message, RemoteClient};
use crate::utils::SyncError;

/// Accepted file attachments per message.
pub const MAX_FILE_ATTACHMENTS: usize = 10;

const MIB: i64 = 1024 * 1024;

/// Leading bytes of a streamed file inspected for an image header.
const STREAM_HEADER_BYTES: usize = 256 * 1024;

const CONTENT_TYPE_CODE_SNIPPET: &str = "application/vnd.microsoft.card.codesnippet";
const CONTENT_TYPE_MESSAGE_REFERENCE: &str = "messageReference";
const CONTENT_TYPE_ADAPTIVE_CARD: &str = "application/vnd.microsoft.card.adaptive";
const CONTENT_TYPE_REFERENCE: &str = "reference";

static ATTACHMENT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<attachment id=.*?attachment>").expect("valid attachment regex"));

#[derive(Debug, Default)]
pub struct AttachmentOutcome {
    pub text: String,
    pub file_ids: Vec<String>,
    /// Local root post derived from a message reference.
    pub parent_id: String,
    pub skipped: usize,
    pub limit_exceeded: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeSnippetContent {
    #[serde(default)]
    language: String,
    #[serde(default)]
    code_snippet_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageReferenceContent {
    #[serde(default)]
    message_id: String,
}

#[derive(Deserialize)]
struct CardContent {
    #[serde(rename = "type", default)]
    card_type: String,
    #[serde(default)]
    body: Vec<CardElement>,
}

#[derive(Deserialize)]
struct CardElement {
    #[serde(rename = "type", default)]
    element_type: String,
    #[serde(default)]
    text: String,
}

pub fn strip_attachment_tags(text: &str) -> String {
    ATTACHMENT_TAG_RE.replace_all(text, "").into_owned()
}

pub fn is_file_attachment(attachment: &Attachment) -> bool {
    attachment.content_type == CONTENT_TYPE_REFERENCE
}

/// Snippet URLs split into 11 segments for chats and 13 or 15 for channels.
pub fn is_valid_code_snippet_url(url: &str) -> bool {
    let segments = url.split('/').count();
    if url.contains("chats") {
        segments == 11
    } else if url.contains("channels") {
        segments == 13 || segments == 15
    } else {
        false
    }
}

/// Appends the text of every `TextBlock` of an adaptive card.
pub fn append_card_text(content: &str, text: &str) -> String {
    let card: CardContent = match serde_json::from_str(content) {
        Ok(card) => card,
        Err(e) => {
            warn!("failed to decode adaptive card error={}", e);
            return text.to_string();
        }
    };
    if card.card_type != "AdaptiveCard" {
        warn!("ignoring unexpected card type card_type={}", card.card_type);
        return text.to_string();
    }

    let mut out = text.to_string();
    let mut found = false;
    for element in card.body {
        if element.element_type == "TextBlock" {
            found = true;
            out.push('\n');
            out.push_str(&element.text);
        } else {
            debug!("skipping card element element_type={}", element.element_type);
        }
    }
    if !found {
        warn!("adaptive card carried no text blocks");
    }
    out
}

fn pasted_image_name(data: &[u8]) -> String {
    format!(
        "Image Pasted at {}{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        image_extension(data)
    )
}

enum Download {
    Complete(Vec<u8>),
    Stream { download_url: String, size: i64 },
}

enum FileOutcome {
    Uploaded(String),
    Skipped(&'static str),
}

impl BridgeCore {
    /// Applies every attachment of `msg` to `text`, uploading referenced
    /// files into `channel_id` on behalf of `user_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_attachments(
        &self,
        channel_id: &str,
        user_id: &str,
        text: String,
        msg: &Message,
        attachments: &[Attachment],
        chat: Option<&Chat>,
        existing_file_ids: &[String],
    ) -> AttachmentOutcome {
        let mut outcome = AttachmentOutcome {
            text,
            ..AttachmentOutcome::default()
        };
        if attachments.is_empty() {
            return outcome;
        }

        let client = match chat {
            None => Some(self.clients().app_client()),
            Some(chat) => self.client_for_chat(chat).await,
        };
        let Some(client) = client else {
            warn!(
                "unable to get a client to handle attachments channel_id={} message_id={}",
                channel_id, msg.id
            );
            return outcome;
        };

        let is_direct = chat.is_some();
        let context_id = remote_context_id(&msg.chat_id, &msg.team_id, &msg.channel_id);
        let existing = self.existing_file_names(existing_file_ids).await;
        outcome.text = strip_attachment_tags(&outcome.text);

        let mut accepted = 0;
        for (index, attachment) in attachments.iter().enumerate() {
            match attachment.content_type.as_str() {
                CONTENT_TYPE_CODE_SNIPPET => {
                    outcome.text = self
                        .append_code_snippet(client.as_ref(), attachment, &outcome.text)
                        .await;
                    continue;
                }
                CONTENT_TYPE_MESSAGE_REFERENCE => {
                    outcome.parent_id = self.referenced_root(attachment, &context_id).await;
                    continue;
                }
                CONTENT_TYPE_ADAPTIVE_CARD => {
                    outcome.text = append_card_text(&attachment.content, &outcome.text);
                    continue;
                }
                CONTENT_TYPE_REFERENCE => {}
                other => {
                    warn!(
                        "ignored attachment content type attachment_id={} content_type={}",
                        attachment.id, other
                    );
                    continue;
                }
            }

            if let Some(file_id) = existing.get(&attachment.name) {
                outcome.file_ids.push(file_id.clone());
                continue;
            }

            match self
                .transfer_file(client.clone(), channel_id, attachment, &mut outcome)
                .await
            {
                FileOutcome::Uploaded(file_id) => {
                    outcome.file_ids.push(file_id);
                    self.metrics().observe_file(
                        ACTION_CREATED,
                        SOURCE_MSTEAMS,
                        DISCARDED_REASON_NONE,
                        is_direct,
                    );
                    accepted += 1;
                }
                FileOutcome::Skipped(reason) => {
                    self.metrics()
                        .observe_file(ACTION_CREATED, SOURCE_MSTEAMS, reason, is_direct);
                    outcome.skipped += 1;
                    continue;
                }
            }

            if accepted == MAX_FILE_ATTACHMENTS {
                let remaining = attachments[index + 1..]
                    .iter()
                    .filter(|a| is_file_attachment(a))
                    .count();
                self.metrics().observe_files(
                    ACTION_CREATED,
                    SOURCE_MSTEAMS,
                    DISCARDED_REASON_FILE_LIMIT_REACHED,
                    is_direct,
                    remaining as u64,
                );
                outcome.skipped += remaining;
                break;
            }
        }

        outcome
    }

    async fn existing_file_names(&self, file_ids: &[String]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for file_id in file_ids {
            if let Ok(info) = self.host().get_file_info(file_id).await {
                names.insert(info.name, file_id.clone());
            }
        }
        names
    }

    async fn append_code_snippet(
        &self,
        client: &dyn RemoteClient,
        attachment: &Attachment,
        text: &str,
    ) -> String {
        let content: CodeSnippetContent = match serde_json::from_str(&attachment.content) {
            Ok(content) => content,
            Err(e) => {
                warn!("failed to decode code snippet error={}", e);
                return text.to_string();
            }
        };
        if !is_valid_code_snippet_url(&content.code_snippet_url) {
            warn!("invalid code snippet url url={}", content.code_snippet_url);
            return text.to_string();
        }
        match client.get_code_snippet(&content.code_snippet_url).await {
            Ok(snippet) => format!("{text}\n```{}\n{snippet}\n```\n", content.language),
            Err(e) => {
                warn!("retrieving code snippet failed error={}", e);
                text.to_string()
            }
        }
    }

    /// Root of the local thread holding the referenced message, if mirrored.
    async fn referenced_root(&self, attachment: &Attachment, context_id: &str) -> String {
        let content: MessageReferenceContent = match serde_json::from_str(&attachment.content) {
            Ok(content) => content,
            Err(e) => {
                warn!("failed to decode message reference error={}", e);
                return String::new();
            }
        };
        let Ok(Some(correspondence)) = self
            .posts()
            .get_by_remote(context_id, &content.message_id)
            .await
        else {
            return String::new();
        };
        match self.host().get_post(&correspondence.local_post_id).await {
            Ok(post) if !post.root_id.is_empty() => post.root_id,
            Ok(post) => post.id,
            Err(_) => String::new(),
        }
    }

    async fn download(
        &self,
        client: &dyn RemoteClient,
        attachment: &Attachment,
        outcome: &mut AttachmentOutcome,
    ) -> Result<Download, &'static str> {
        if is_hosted_content_url(&attachment.content_url) {
            let Some(ids) = parse_hosted_content_url(&attachment.content_url) else {
                warn!("unparseable hosted content url url={}", attachment.content_url);
                return Err(DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA);
            };
            return client
                .get_hosted_file_content(&ids)
                .await
                .map(Download::Complete)
                .map_err(|e| {
                    warn!("failed to download hosted content error={}", e);
                    DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA
                });
        }

        let (size, download_url) = client
            .get_file_size_and_download_url(&attachment.content_url)
            .await
            .map_err(|e| {
                warn!("failed to get file size and download url error={}", e);
                DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA
            })?;

        if let Err(e) = check_file_size(&attachment.name, size, &self.host().limits()) {
            warn!("skipping file download: {}", e);
            outcome.limit_exceeded = true;
            return Err(DISCARDED_REASON_MAX_FILE_SIZE_EXCEEDED);
        }

        if size <= self.config().sync.max_size_for_complete_download_mib * MIB {
            return client
                .get_file_content(&download_url)
                .await
                .map(Download::Complete)
                .map_err(|e| {
                    warn!("failed to get file content error={}", e);
                    DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA
                });
        }
        Ok(Download::Stream { download_url, size })
    }

    async fn transfer_file(
        &self,
        client: Arc<dyn RemoteClient>,
        channel_id: &str,
        attachment: &Attachment,
        outcome: &mut AttachmentOutcome,
    ) -> FileOutcome {
        let download = match self.download(client.as_ref(), attachment, outcome).await {
            Ok(download) => download,
            Err(reason) => return FileOutcome::Skipped(reason),
        };

        let uploaded = match download {
            Download::Complete(data) => self.upload_complete(data, &attachment.name, channel_id).await,
            Download::Stream { download_url, size } => {
                self.upload_streamed(client, download_url, size, &attachment.name, channel_id)
                    .await
            }
        };

        match uploaded {
            Ok(file_id) if !file_id.is_empty() => FileOutcome::Uploaded(file_id),
            Ok(_) => FileOutcome::Skipped(DISCARDED_REASON_EMPTY_FILE_ID),
            Err(SyncError::ResolutionTooHigh { name, pixels, limit }) => {
                warn!(
                    "image resolution is too high name={} pixels={} limit={}",
                    name, pixels, limit
                );
                outcome.limit_exceeded = true;
                FileOutcome::Skipped(DISCARDED_REASON_RESOLUTION_TOO_HIGH)
            }
            Err(SyncError::InvalidInput(reason)) => {
                warn!("skipping unreadable image filename={} error={}", attachment.name, reason);
                FileOutcome::Skipped(DISCARDED_REASON_OTHER)
            }
            Err(e) => {
                warn!("upload file failed filename={} error={}", attachment.name, e);
                FileOutcome::Skipped(DISCARDED_REASON_EMPTY_FILE_ID)
            }
        }
    }

    async fn upload_complete(
        &self,
        data: Vec<u8>,
        name: &str,
        channel_id: &str,
    ) -> Result<String, SyncError> {
        check_image_resolution(name, &data, &self.host().limits())?;
        let name = if name.is_empty() {
            pasted_image_name(&data)
        } else {
            name.to_string()
        };
        let info = self.host().upload_file(data, channel_id, &name).await?;
        Ok(info.id)
    }

    /// Pipes the download straight into the host upload without buffering
    /// the whole file. The leading bytes are held back until the image
    /// resolution check has passed.
    async fn upload_streamed(
        &self,
        client: Arc<dyn RemoteClient>,
        download_url: String,
        size: i64,
        name: &str,
        channel_id: &str,
    ) -> Result<String, SyncError> {
        let buffer_size =
            usize::try_from(self.config().sync.buffer_size_for_streaming_mib * MIB).unwrap_or(0);
        let buffer_size = buffer_size.max(64 * 1024);
        let (mut reader, writer) = tokio::io::duplex(buffer_size);

        let download = tokio::spawn(async move {
            client
                .get_file_content_stream(&download_url, writer, buffer_size)
                .await
        });

        let header = read_header(&mut reader)
            .await
            .map_err(|e| SyncError::Internal(format!("unable to read {name}: {e}")))
            .and_then(|header| {
                check_image_resolution(name, &header, &self.host().limits()).map(|()| header)
            });
        let uploaded = match header {
            Ok(header) => {
                let body = Box::pin(std::io::Cursor::new(header).chain(reader));
                self.host()
                    .upload_file_stream(body, channel_id, name, size)
                    .await
                    .map_err(SyncError::from)
            }
            Err(e) => {
                // Closing the reader ends the download.
                drop(reader);
                Err(e)
            }
        };

        match download.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("streaming download failed filename={} error={}", name, e),
            Err(e) if e.is_panic() => {
                self.metrics().observe_worker_failure("file_stream");
                warn!("streaming download panicked filename={}", name);
            }
            Err(e) => warn!("streaming download aborted filename={} error={}", name, e),
        }

        Ok(uploaded?.id)
    }
}

async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(STREAM_HEADER_BYTES);
    (&mut *reader)
        .take(STREAM_HEADER_BYTES as u64)
        .read_to_end(&mut header)
        .await?;
    Ok(header)
}
