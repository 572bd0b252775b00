use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufWriter, DuplexStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::models::{
    ActivityIds, Attachment, Chat, ChatMember, ChatType, Mention, Message, Reaction,
    Subscription, User,
};
use super::{ALL_CHATS_RESOURCE, ClientError, ClientFactory, RemoteClient};
use crate::config::MsTeamsConfig;
use crate::db::UserStore;
use crate::utils::SyncError;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const SUBSCRIPTION_LIFETIME_MINUTES: i64 = 30;
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const CHANGE_TYPES: &str = "created,deleted,updated";

enum Credentials {
    App {
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    },
    User {
        access_token: SecretString,
    },
}

struct CachedToken {
    value: SecretString,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

/// Stored user tokens are either the raw access token or the serialized
/// OAuth token document.
#[derive(Deserialize)]
struct StoredToken {
    access_token: String,
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    login_url: String,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new_app(http: reqwest::Client, config: &MsTeamsConfig) -> Self {
        Self {
            http,
            base_url: GRAPH_BASE_URL.to_string(),
            login_url: LOGIN_BASE_URL.to_string(),
            credentials: Credentials::App {
                tenant_id: config.tenant_id.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
            token: Mutex::new(None),
        }
    }

    pub fn new_user(http: reqwest::Client, stored_token: &str) -> Self {
        let access_token = serde_json::from_str::<StoredToken>(stored_token)
            .map(|token| token.access_token)
            .unwrap_or_else(|_| stored_token.to_string());
        Self {
            http,
            base_url: GRAPH_BASE_URL.to_string(),
            login_url: LOGIN_BASE_URL.to_string(),
            credentials: Credentials::User {
                access_token: SecretString::from(access_token),
            },
            token: Mutex::new(None),
        }
    }

    pub fn with_base_urls(mut self, graph: impl Into<String>, login: impl Into<String>) -> Self {
        self.base_url = graph.into();
        self.login_url = login.into();
        self
    }

    async fn access_token(&self) -> Result<String, ClientError> {
        let (tenant_id, client_id, client_secret) = match &self.credentials {
            Credentials::User { access_token } => {
                return Ok(access_token.expose_secret().to_string());
            }
            Credentials::App {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.expose_secret().to_string());
        }

        let response = self
            .http
            .post(format!("{}/{}/oauth2/v2.0/token", self.login_url, tenant_id))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("scope", "https://graph.microsoft.com/.default"),
            ])
            .send()
            .await
            .map_err(|e| ClientError::network(format!("token request failed: {e}")))?;
        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::network(format!("invalid token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!("acquired application token expires_in={}", token.expires_in);
        *cached = Some(CachedToken {
            value: SecretString::from(token.access_token.clone()),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let token = self.access_token().await?;
        Ok(self.http.request(method, self.url(path)).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::network(e.to_string()))?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(self.request(Method::GET, path).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::network(format!("invalid response body: {e}")))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T, ClientError> {
        let response = self
            .send(self.request(method, path).await?.json(body))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::network(format!("invalid response body: {e}")))
    }

    async fn send_no_content(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(), ClientError> {
        let mut builder = self.request(method, path).await?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder).await?;
        Ok(())
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.send(self.request(Method::GET, path).await?).await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| ClientError::network(format!("failed reading body: {e}")))
    }

    async fn list_paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ClientError> {
        let mut items = Vec::new();
        let mut next = Some(self.url(path));
        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    async fn subscribe(
        &self,
        base_url: &str,
        webhook_secret: &str,
        resource: &str,
    ) -> Result<Subscription, ClientError> {
        let existing = self.list_subscriptions().await?;
        for subscription in existing
            .iter()
            .filter(|s| s.resource.trim_end_matches("?model=B") == resource.trim_end_matches("?model=B"))
        {
            if let Err(err) = self.delete_subscription(&subscription.id).await {
                warn!(
                    "unable to delete superseded subscription subscription_id={} error={}",
                    subscription.id, err
                );
            }
        }

        let notification_url = notification_url(base_url);
        let expires = Utc::now() + chrono::Duration::minutes(SUBSCRIPTION_LIFETIME_MINUTES);
        let body = json!({
            "changeType": CHANGE_TYPES,
            "notificationUrl": notification_url,
            "lifecycleNotificationUrl": notification_url,
            "resource": resource,
            "expirationDateTime": expires.to_rfc3339(),
            "clientState": webhook_secret,
        });
        let created: GraphSubscription = self.send_json(Method::POST, "subscriptions", &body).await?;
        Ok(created.into_subscription())
    }
}

/// Decodes a message delivered inline with a change notification.
pub fn message_from_json(content: &Value, ids: &ActivityIds) -> Option<Message> {
    let parsed: GraphChatMessage = serde_json::from_value(content.clone()).ok()?;
    Some(parsed.into_message(&ids.team_id, &ids.channel_id, &ids.chat_id))
}

/// Webhook deliveries go to the root path of the public base URL.
pub fn notification_url(base_url: &str) -> String {
    format!("{}/", base_url.trim_end_matches('/'))
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let (code, message) = serde_json::from_str::<GraphErrorBody>(&body)
        .map(|parsed| (parsed.error.code, parsed.error.message))
        .unwrap_or_else(|_| (status_code_name(status), body));

    Err(ClientError::from_status(status.as_u16(), &code, &message).with_retry_after(retry_after))
}

fn status_code_name(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("Unknown")
        .replace(' ', "")
}

/// Encodes a sharing URL for the `/shares/{id}` endpoint.
fn encode_sharing_url(web_url: &str) -> String {
    format!("u!{}", URL_SAFE_NO_PAD.encode(web_url.as_bytes()))
}

fn reply_path(team_id: &str, channel_id: &str, parent_id: &str, message_id: &str) -> String {
    if parent_id.is_empty() {
        format!("teams/{team_id}/channels/{channel_id}/messages/{message_id}")
    } else {
        format!("teams/{team_id}/channels/{channel_id}/messages/{parent_id}/replies/{message_id}")
    }
}

fn html_body(message: &str) -> Value {
    json!({ "contentType": "html", "content": message })
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct IdentitySet {
    #[serde(default)]
    user: Option<Identity>,
    #[serde(default)]
    conversation: Option<Identity>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMention {
    id: Option<i32>,
    mention_text: Option<String>,
    #[serde(default)]
    mentioned: Option<IdentitySet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphReaction {
    reaction_type: Option<String>,
    #[serde(default)]
    user: Option<IdentitySet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChatMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    from: Option<IdentitySet>,
    #[serde(default)]
    body: Option<ItemBody>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    reply_to_id: Option<String>,
    #[serde(default)]
    created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    attachments: Vec<GraphAttachment>,
    #[serde(default)]
    mentions: Vec<GraphMention>,
    #[serde(default)]
    reactions: Vec<GraphReaction>,
}

impl GraphChatMessage {
    fn into_message(self, team_id: &str, channel_id: &str, chat_id: &str) -> Message {
        let user = self.from.and_then(|from| from.user).unwrap_or_default();
        let create_at = self.created_date_time.unwrap_or_else(Utc::now);
        let mentions = self
            .mentions
            .into_iter()
            .filter_map(|mention| {
                let (Some(id), Some(text)) = (mention.id, mention.mention_text) else {
                    return None;
                };
                let mentioned = mention.mentioned.unwrap_or_default();
                Some(Mention {
                    id,
                    user_id: mentioned.user.and_then(|u| u.id).unwrap_or_default(),
                    mentioned_text: text,
                    conversation_id: mentioned.conversation.and_then(|c| c.id).unwrap_or_default(),
                })
            })
            .collect();
        let reactions = self
            .reactions
            .into_iter()
            .filter_map(|reaction| {
                let user_id = reaction.user?.user?.id?;
                Some(Reaction {
                    user_id,
                    reaction: reaction.reaction_type?,
                })
            })
            .collect();

        Message {
            id: self.id.unwrap_or_default(),
            user_id: user.id.unwrap_or_default(),
            user_display_name: user.display_name.unwrap_or_default(),
            text: self.body.and_then(|b| b.content).unwrap_or_default(),
            subject: self.subject.unwrap_or_default(),
            reply_to_id: self.reply_to_id.unwrap_or_default(),
            attachments: self
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id.unwrap_or_default(),
                    content_type: a.content_type.unwrap_or_default(),
                    content: a.content.unwrap_or_default(),
                    name: a.name.unwrap_or_default(),
                    content_url: a.content_url.unwrap_or_default(),
                })
                .collect(),
            reactions,
            mentions,
            channel_id: channel_id.to_string(),
            team_id: team_id.to_string(),
            chat_id: chat_id.to_string(),
            create_at,
            last_update_at: self.last_modified_date_time.unwrap_or(create_at),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChatMember {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChat {
    id: String,
    #[serde(default)]
    chat_type: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    members: Vec<GraphChatMember>,
}

impl GraphChat {
    fn into_chat(self) -> Chat {
        let chat_type = match self.chat_type.as_deref() {
            Some("group") => ChatType::Group,
            Some("oneOnOne") => ChatType::OneOnOne,
            _ => ChatType::Unknown,
        };
        Chat {
            id: self.id,
            chat_type,
            topic: self.topic.unwrap_or_default(),
            members: self
                .members
                .into_iter()
                .map(|m| ChatMember {
                    user_id: m.user_id.unwrap_or_default(),
                    display_name: m.display_name.unwrap_or_default(),
                    email: m.email.unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSubscription {
    id: String,
    #[serde(default)]
    resource: String,
    expiration_date_time: DateTime<Utc>,
    #[serde(default)]
    notification_url: String,
}

impl GraphSubscription {
    fn into_subscription(self) -> Subscription {
        let ids = super::resource::parse_resource(&self.resource);
        let (kind, team_id, channel_id) = if self.resource.contains(ALL_CHATS_RESOURCE) {
            ("allChats".to_string(), String::new(), String::new())
        } else {
            let parts: Vec<&str> = self.resource.trim_start_matches('/').split('/').collect();
            match parts.as_slice() {
                ["teams", team, "channels", channel, ..] => {
                    ("channel".to_string(), team.to_string(), channel.to_string())
                }
                _ => (String::new(), ids.team_id, ids.channel_id),
            }
        };
        Subscription {
            id: self.id,
            kind,
            team_id,
            channel_id,
            resource: self.resource,
            expires_on: self.expiration_date_time,
            notification_url: self.notification_url,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    mail: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
    #[serde(default)]
    account_enabled: Option<bool>,
}

#[derive(Deserialize)]
struct DriveItem {
    #[serde(default)]
    size: i64,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

#[derive(Deserialize)]
struct CreatedChat {
    id: String,
}

#[async_trait]
impl RemoteClient for GraphClient {
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, ClientError> {
        let chat: GraphChat = self
            .get_json(&format!("chats/{chat_id}?$expand=members"))
            .await?;
        Ok(chat.into_chat())
    }

    async fn get_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        let msg: GraphChatMessage = self
            .get_json(&format!("chats/{chat_id}/messages/{message_id}"))
            .await?;
        Ok(msg.into_message("", "", chat_id))
    }

    async fn get_message(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        let msg: GraphChatMessage = self
            .get_json(&reply_path(team_id, channel_id, "", message_id))
            .await?;
        Ok(msg.into_message(team_id, channel_id, ""))
    }

    async fn get_reply(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
        reply_id: &str,
    ) -> Result<Message, ClientError> {
        let msg: GraphChatMessage = self
            .get_json(&reply_path(team_id, channel_id, message_id, reply_id))
            .await?;
        Ok(msg.into_message(team_id, channel_id, ""))
    }

    async fn send_chat(
        &self,
        chat_id: &str,
        message: &str,
        parent: Option<&Message>,
    ) -> Result<Message, ClientError> {
        let mut content = message.to_string();
        let mut attachments = Vec::new();
        if let Some(parent) = parent.filter(|p| !p.id.is_empty()) {
            let reference = json!({
                "messageId": parent.id,
                "messagePreview": parent.text,
                "messageSender": {
                    "user": {
                        "userIdentityType": "aadUser",
                        "id": parent.user_id,
                        "displayName": parent.user_display_name,
                    }
                }
            });
            content = format!("<attachment id=\"{}\"></attachment> {}", parent.id, content);
            attachments.push(json!({
                "id": parent.id,
                "contentType": "messageReference",
                "content": reference.to_string(),
            }));
        }

        let body = json!({ "body": html_body(&content), "attachments": attachments });
        let msg: GraphChatMessage = self
            .send_json(Method::POST, &format!("chats/{chat_id}/messages"), &body)
            .await?;
        Ok(msg.into_message("", "", chat_id))
    }

    async fn send_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message: &str,
    ) -> Result<Message, ClientError> {
        let path = if parent_id.is_empty() {
            format!("teams/{team_id}/channels/{channel_id}/messages")
        } else {
            format!("teams/{team_id}/channels/{channel_id}/messages/{parent_id}/replies")
        };
        let body = json!({ "body": html_body(message) });
        let msg: GraphChatMessage = self.send_json(Method::POST, &path, &body).await?;
        Ok(msg.into_message(team_id, channel_id, ""))
    }

    async fn update_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "body": html_body(message) });
        self.send_no_content(
            Method::PATCH,
            &reply_path(team_id, channel_id, parent_id, message_id),
            Some(&body),
        )
        .await
    }

    async fn update_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "body": html_body(message) });
        self.send_no_content(
            Method::PATCH,
            &format!("chats/{chat_id}/messages/{message_id}"),
            Some(&body),
        )
        .await
    }

    async fn delete_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
    ) -> Result<(), ClientError> {
        let path = format!(
            "{}/softDelete",
            reply_path(team_id, channel_id, parent_id, message_id)
        );
        self.send_no_content(Method::POST, &path, None).await
    }

    async fn delete_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), ClientError> {
        let user_id = self.get_my_id().await?;
        self.send_no_content(
            Method::POST,
            &format!("users/{user_id}/chats/{chat_id}/messages/{message_id}/softDelete"),
            None,
        )
        .await
    }

    async fn set_reaction(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "reactionType": emoji, "user": { "id": user_id } });
        let path = format!(
            "{}/setReaction",
            reply_path(team_id, channel_id, parent_id, message_id)
        );
        self.send_no_content(Method::POST, &path, Some(&body)).await
    }

    async fn unset_reaction(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "reactionType": emoji, "user": { "id": user_id } });
        let path = format!(
            "{}/unsetReaction",
            reply_path(team_id, channel_id, parent_id, message_id)
        );
        self.send_no_content(Method::POST, &path, Some(&body)).await
    }

    async fn set_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "reactionType": emoji, "user": { "id": user_id } });
        self.send_no_content(
            Method::POST,
            &format!("chats/{chat_id}/messages/{message_id}/setReaction"),
            Some(&body),
        )
        .await
    }

    async fn unset_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let body = json!({ "reactionType": emoji, "user": { "id": user_id } });
        self.send_no_content(
            Method::POST,
            &format!("chats/{chat_id}/messages/{message_id}/unsetReaction"),
            Some(&body),
        )
        .await
    }

    async fn subscribe_to_chats(
        &self,
        base_url: &str,
        webhook_secret: &str,
        pay: bool,
    ) -> Result<Subscription, ClientError> {
        let resource = if pay {
            format!("{ALL_CHATS_RESOURCE}?model=B")
        } else {
            ALL_CHATS_RESOURCE.to_string()
        };
        self.subscribe(base_url, webhook_secret, &resource).await
    }

    async fn subscribe_to_channel(
        &self,
        team_id: &str,
        channel_id: &str,
        base_url: &str,
        webhook_secret: &str,
    ) -> Result<Subscription, ClientError> {
        let resource = format!("/teams/{team_id}/channels/{channel_id}/messages");
        self.subscribe(base_url, webhook_secret, &resource).await
    }

    async fn refresh_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<DateTime<Utc>, ClientError> {
        let expires = Utc::now() + chrono::Duration::minutes(SUBSCRIPTION_LIFETIME_MINUTES);
        let body = json!({ "expirationDateTime": expires.to_rfc3339() });
        self.send_no_content(
            Method::PATCH,
            &format!("subscriptions/{subscription_id}"),
            Some(&body),
        )
        .await?;
        Ok(expires)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.send_no_content(
            Method::DELETE,
            &format!("subscriptions/{subscription_id}"),
            None,
        )
        .await
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ClientError> {
        let subscriptions: Vec<GraphSubscription> = self.list_paged("subscriptions").await?;
        Ok(subscriptions
            .into_iter()
            .map(GraphSubscription::into_subscription)
            .collect())
    }

    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(i64, String), ClientError> {
        let item: DriveItem = self
            .get_json(&format!("shares/{}/driveItem", encode_sharing_url(web_url)))
            .await?;
        let download_url = item
            .download_url
            .ok_or_else(|| ClientError::invalid("download url not found"))?;
        Ok((item.size, download_url))
    }

    async fn get_file_content(&self, download_url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .send(self.http.get(download_url))
            .await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| ClientError::network(format!("failed reading file: {e}")))
    }

    async fn get_file_content_stream(
        &self,
        download_url: &str,
        mut writer: DuplexStream,
        buffer_size: usize,
    ) -> Result<(), ClientError> {
        let result = async {
            let response = self.send(self.http.get(download_url)).await?;
            let mut body = response.bytes_stream();
            let mut buffered = BufWriter::with_capacity(buffer_size.max(8 * 1024), &mut writer);
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| ClientError::network(format!("download interrupted: {e}")))?;
                buffered
                    .write_all(&chunk)
                    .await
                    .map_err(|e| ClientError::network(format!("reader closed: {e}")))?;
            }
            buffered
                .flush()
                .await
                .map_err(|e| ClientError::network(format!("reader closed: {e}")))
        }
        .await;

        if let Err(err) = writer.shutdown().await {
            debug!("stream writer already closed error={}", err);
        }
        result
    }

    async fn get_hosted_file_content(&self, ids: &ActivityIds) -> Result<Vec<u8>, ClientError> {
        let path = if ids.is_chat() {
            format!(
                "chats/{}/messages/{}/hostedContents/{}/$value",
                ids.chat_id, ids.message_id, ids.hosted_contents_id
            )
        } else if !ids.reply_id.is_empty() {
            format!(
                "{}/hostedContents/{}/$value",
                reply_path(&ids.team_id, &ids.channel_id, &ids.message_id, &ids.reply_id),
                ids.hosted_contents_id
            )
        } else {
            format!(
                "{}/hostedContents/{}/$value",
                reply_path(&ids.team_id, &ids.channel_id, "", &ids.message_id),
                ids.hosted_contents_id
            )
        };
        self.get_bytes(&path).await
    }

    async fn get_code_snippet(&self, url: &str) -> Result<String, ClientError> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn create_or_get_chat_for_users(
        &self,
        user_ids: &[String],
    ) -> Result<String, ClientError> {
        let chats: Vec<GraphChat> = self.list_paged("me/chats?$expand=members").await?;
        for chat in chats {
            if chat.members.len() != user_ids.len() {
                continue;
            }
            let all_present = user_ids.iter().all(|wanted| {
                chat.members
                    .iter()
                    .any(|m| m.user_id.as_deref() == Some(wanted.as_str()))
            });
            if all_present {
                return Ok(chat.id);
            }
        }

        let chat_type = if user_ids.len() == 2 { "oneOnOne" } else { "group" };
        let members: Vec<Value> = user_ids
            .iter()
            .map(|id| {
                json!({
                    "@odata.type": "#microsoft.graph.aadUserConversationMember",
                    "roles": ["owner"],
                    "user@odata.bind": format!("{GRAPH_BASE_URL}/users('{id}')"),
                })
            })
            .collect();
        let created: CreatedChat = self
            .send_json(
                Method::POST,
                "chats",
                &json!({ "chatType": chat_type, "members": members }),
            )
            .await?;
        Ok(created.id)
    }

    async fn get_user(&self, user_id: &str) -> Result<User, ClientError> {
        let user: GraphUser = self
            .get_json(&format!(
                "users/{user_id}?$select=id,displayName,mail,userPrincipalName,userType,accountEnabled"
            ))
            .await?;
        let mail = user
            .mail
            .or(user.user_principal_name)
            .unwrap_or_default()
            .to_lowercase();
        Ok(User {
            id: user.id,
            display_name: user.display_name.unwrap_or_default(),
            mail,
            user_type: user.user_type.unwrap_or_default(),
            is_account_enabled: user.account_enabled.unwrap_or(true),
        })
    }

    async fn get_user_avatar(&self, user_id: &str) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(&format!("users/{user_id}/photo/$value")).await
    }

    async fn get_my_id(&self) -> Result<String, ClientError> {
        #[derive(Deserialize)]
        struct Me {
            id: String,
        }
        let me: Me = self.get_json("me?$select=id").await?;
        Ok(me.id)
    }
}

/// Builds Graph clients: one shared app client and per-user clients from
/// the tokens held in the user store.
pub struct GraphClientFactory {
    http: reqwest::Client,
    app: Arc<GraphClient>,
    users: Arc<dyn UserStore>,
}

impl GraphClientFactory {
    pub fn new(
        config: &MsTeamsConfig,
        users: Arc<dyn UserStore>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = reqwest::Client::builder()
            .user_agent("msteams-sync")
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to construct HTTP client")?;
        let app = Arc::new(GraphClient::new_app(http.clone(), config));
        Ok(Self { http, app, users })
    }
}

#[async_trait]
impl ClientFactory for GraphClientFactory {
    fn app_client(&self) -> Arc<dyn RemoteClient> {
        self.app.clone()
    }

    async fn client_for_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, SyncError> {
        let token = self.users.get_token_for_local_user(local_user_id).await?;
        Ok(token.map(|token| {
            Arc::new(GraphClient::new_user(self.http.clone(), &token)) as Arc<dyn RemoteClient>
        }))
    }

    async fn client_for_teams_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, SyncError> {
        let token = self.users.get_token_for_remote_user(remote_user_id).await?;
        Ok(token.map(|token| {
            Arc::new(GraphClient::new_user(self.http.clone(), &token)) as Arc<dyn RemoteClient>
        }))
    }
}
