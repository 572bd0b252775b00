use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OwnedMutexGuard;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{
    Channel, ChannelMember, ChannelMemberIdentifier, FileInfo, FileReader, Host, HostError,
    HostLimits, KeyedMutex, Post, Preference, Reaction, User,
};
use crate::config::HostConfig;

const API_PREFIX: &str = "/api/v4";

/// Host implementation over the chat server's REST API, acting as the bot.
pub struct RestHost {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    bot_user_id: String,
    limits: HostLimits,
    mutexes: Arc<KeyedMutex>,
    kv: Mutex<HashMap<String, Vec<u8>>>,
}

#[derive(Deserialize)]
struct UploadResponse {
    file_infos: Vec<FileInfo>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl RestHost {
    pub fn new(config: &HostConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("msteams-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build host HTTP client")?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            bot_user_id: config.bot_user_id.clone(),
            limits: HostLimits {
                max_file_size: config.max_file_size,
                max_image_resolution: config.max_image_resolution,
            },
            mutexes: Arc::new(KeyedMutex::new()),
            kv: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(self.token.expose_secret())
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, HostError> {
        let response = builder
            .send()
            .await
            .map_err(|e| HostError::Request(e.to_string()))?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, HostError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        decode(response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T, HostError> {
        let response = self.send(self.request(method, path).json(body)).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HostError> {
    response
        .json()
        .await
        .map_err(|e| HostError::Request(format!("invalid response body: {e}")))
}

async fn check_status(response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|parsed| parsed.message)
        .unwrap_or(body);
    Err(match status {
        StatusCode::NOT_FOUND => HostError::NotFound(message),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => HostError::PermissionDenied(message),
        _ => HostError::Request(format!("status={} {message}", status.as_u16())),
    })
}

#[async_trait]
impl Host for RestHost {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn limits(&self) -> HostLimits {
        self.limits
    }

    async fn get_user(&self, user_id: &str) -> Result<User, HostError> {
        self.get_json(&format!("/users/{user_id}")).await
    }

    async fn update_user(&self, user: &User) -> Result<User, HostError> {
        let body = serde_json::to_value(user).map_err(|e| HostError::Internal(e.to_string()))?;
        self.send_json(Method::PUT, &format!("/users/{}", user.id), &body)
            .await
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, HostError> {
        self.get_json(&format!("/channels/{channel_id}")).await
    }

    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<ChannelMember>, HostError> {
        self.get_json(&format!(
            "/channels/{channel_id}/members?page={page}&per_page={per_page}"
        ))
        .await
    }

    async fn get_channels_for_user(&self, user_id: &str) -> Result<Vec<Channel>, HostError> {
        self.get_json(&format!("/users/{user_id}/channels")).await
    }

    async fn get_direct_channel(&self, user_a: &str, user_b: &str) -> Result<Channel, HostError> {
        self.send_json(Method::POST, "/channels/direct", &json!([user_a, user_b]))
            .await
    }

    async fn get_group_channel(&self, user_ids: &[String]) -> Result<Channel, HostError> {
        self.send_json(Method::POST, "/channels/group", &json!(user_ids))
            .await
    }

    async fn create_post(&self, post: &Post) -> Result<Post, HostError> {
        let body = serde_json::to_value(post).map_err(|e| HostError::Internal(e.to_string()))?;
        self.send_json(Method::POST, "/posts", &body).await
    }

    async fn update_post(&self, post: &Post) -> Result<Post, HostError> {
        let body = serde_json::to_value(post).map_err(|e| HostError::Internal(e.to_string()))?;
        self.send_json(Method::PUT, &format!("/posts/{}", post.id), &body)
            .await
    }

    async fn delete_post(&self, post_id: &str) -> Result<(), HostError> {
        self.send(self.request(Method::DELETE, &format!("/posts/{post_id}")))
            .await?;
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> Result<Post, HostError> {
        self.get_json(&format!("/posts/{post_id}")).await
    }

    async fn send_ephemeral_post(&self, user_id: &str, post: &Post) -> Result<(), HostError> {
        let body = json!({ "user_id": user_id, "post": post });
        let _: Value = self
            .send_json(Method::POST, "/posts/ephemeral", &body)
            .await?;
        Ok(())
    }

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<Reaction>, HostError> {
        self.get_json(&format!("/posts/{post_id}/reactions")).await
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), HostError> {
        let body =
            serde_json::to_value(reaction).map_err(|e| HostError::Internal(e.to_string()))?;
        let _: Value = self.send_json(Method::POST, "/reactions", &body).await?;
        Ok(())
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<(), HostError> {
        let path = format!(
            "/users/{}/posts/{}/reactions/{}",
            reaction.user_id, reaction.post_id, reaction.emoji_name
        );
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        data: Vec<u8>,
        channel_id: &str,
        filename: &str,
    ) -> Result<FileInfo, HostError> {
        let builder = self
            .request(Method::POST, "/files")
            .query(&[("channel_id", channel_id), ("filename", filename)])
            .body(data);
        first_file_info(self.send(builder).await?).await
    }

    async fn upload_file_stream(
        &self,
        reader: FileReader,
        channel_id: &str,
        filename: &str,
        size: i64,
    ) -> Result<FileInfo, HostError> {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let builder = self
            .request(Method::POST, "/files")
            .query(&[("channel_id", channel_id), ("filename", filename)])
            .header(reqwest::header::CONTENT_LENGTH, size.to_string())
            .body(body);
        first_file_info(self.send(builder).await?).await
    }

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, HostError> {
        self.get_json(&format!("/files/{file_id}/info")).await
    }

    async fn patch_channel_members_notifications(
        &self,
        members: &[ChannelMemberIdentifier],
        notify_props: &HashMap<String, String>,
    ) -> Result<(), HostError> {
        // The REST API only patches one membership per request.
        let body = json!(notify_props);
        for member in members {
            let path = format!(
                "/channels/{}/members/{}/notify_props",
                member.channel_id, member.user_id
            );
            let _: Value = self.send_json(Method::PUT, &path, &body).await?;
        }
        debug!("patched notify props members={}", members.len());
        Ok(())
    }

    async fn get_preference(
        &self,
        user_id: &str,
        category: &str,
        name: &str,
    ) -> Result<Option<String>, HostError> {
        let path = format!("/users/{user_id}/preferences/{category}/name/{name}");
        match self.get_json::<Preference>(&path).await {
            Ok(pref) => Ok(Some(pref.value)),
            Err(HostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: &[Preference],
    ) -> Result<(), HostError> {
        let body =
            serde_json::to_value(preferences).map_err(|e| HostError::Internal(e.to_string()))?;
        self.send(
            self.request(Method::PUT, &format!("/users/{user_id}/preferences"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self.kv.lock().get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<(), HostError> {
        self.kv.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.mutexes.lock(key).await
    }
}

async fn first_file_info(response: Response) -> Result<FileInfo, HostError> {
    let uploaded: UploadResponse = decode(response).await?;
    uploaded.file_infos.into_iter().next().ok_or_else(|| {
        warn!("file upload returned no file infos");
        HostError::Internal("upload returned no file info".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        serde_yaml::from_str(
            "url: https://chat.example.com/\nbot_user_id: bot1\nmax_file_size: 1024\n",
        )
        .unwrap()
    }

    #[test]
    fn builds_api_urls_and_limits() {
        let host = RestHost::new(&config(), Duration::from_secs(5)).unwrap();
        assert_eq!(host.url("/posts"), "https://chat.example.com/api/v4/posts");
        assert_eq!(host.bot_user_id(), "bot1");
        assert_eq!(host.limits().max_file_size, 1024);
    }

    #[tokio::test]
    async fn kv_is_process_local() {
        let host = RestHost::new(&config(), Duration::from_secs(5)).unwrap();
        assert_eq!(host.kv_get("k").await.unwrap(), None);
        host.kv_set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(host.kv_get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
