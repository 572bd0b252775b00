//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::OwnedMutexGuard;

use crate::bridge::BridgeCore;
use crate::config::Config;
use crate::db::DatabaseManager;
use crate::host::{
    Channel, ChannelMember, ChannelMemberIdentifier, ChannelType, FileInfo, Host, HostError,
    FileReader, HostLimits, KeyedMutex, Post, Preference, Reaction, User,
};
use crate::metrics::Metrics;
use crate::msteams::graph::notification_url;
use crate::msteams::{
    ALL_CHATS_RESOURCE, ActivityIds, Chat, ClientError, ClientFactory, Message, RemoteClient,
    Subscription,
};
use crate::utils::{SyncError, TokenCipher};

pub const TEST_CONFIG: &str = r#"
server:
  base_url: "https://sync.example.com"
msteams:
  tenant_id: tenant
  client_id: client
  client_secret: secret
  encryption_key: key
  webhook_secret: webhooksecret
host:
  url: "https://chat.example.com"
  bot_user_id: bot-user
  max_file_size: 1048576
  max_image_resolution: 10000
database:
  filename: /tmp/unused.db
"#;

pub fn test_config() -> Config {
    Config::load_from_str(TEST_CONFIG).unwrap()
}

/// Log lines written while the guard returned by [`capture_logs`] is alive.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.0.lock()).contains(needle)
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Routes this thread's tracing output into a buffer.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

/// A real, decodable PNG of the given size.
pub fn encoded_png(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::new();
    image::RgbImage::new(width, height)
        .write_to(&mut std::io::Cursor::new(&mut data), image::ImageFormat::Png)
        .unwrap();
    data
}

pub fn user(id: &str, username: &str) -> User {
    User {
        id: id.to_string(),
        username: username.to_string(),
        ..User::default()
    }
}

#[derive(Default)]
pub struct HostState {
    pub users: HashMap<String, User>,
    pub channels: HashMap<String, Channel>,
    pub members: HashMap<String, Vec<ChannelMember>>,
    pub posts: HashMap<String, Post>,
    pub created: Vec<Post>,
    pub updated: Vec<Post>,
    pub deleted: Vec<String>,
    pub ephemeral: Vec<(String, Post)>,
    pub reactions: Vec<Reaction>,
    pub removed_reactions: Vec<Reaction>,
    pub files: HashMap<String, FileInfo>,
    pub uploads: Vec<(String, Vec<u8>)>,
    pub preferences: HashMap<(String, String, String), String>,
    pub kv: HashMap<String, Vec<u8>>,
    pub notify_patches: Vec<(Vec<ChannelMemberIdentifier>, HashMap<String, String>)>,
    pub updated_users: Vec<User>,
    pub fail_update_post: bool,
    next_id: u64,
}

impl HostState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }
}

pub struct FakeHost {
    bot_user_id: String,
    limits: HostLimits,
    state: Mutex<HostState>,
    mutexes: Arc<KeyedMutex>,
}

impl FakeHost {
    pub fn new(bot_user_id: &str) -> Self {
        Self::with_limits(
            bot_user_id,
            HostLimits {
                max_file_size: 1024 * 1024,
                max_image_resolution: 10_000,
            },
        )
    }

    pub fn with_limits(bot_user_id: &str, limits: HostLimits) -> Self {
        let host = Self {
            bot_user_id: bot_user_id.to_string(),
            limits,
            state: Mutex::new(HostState::default()),
            mutexes: Arc::new(KeyedMutex::new()),
        };
        let mut bot = user(bot_user_id, "msteams");
        bot.is_bot = true;
        host.add_user(bot);
        host
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock()
    }

    pub fn add_user(&self, user: User) {
        self.state.lock().users.insert(user.id.clone(), user);
    }

    pub fn add_channel(&self, id: &str, team_id: &str, channel_type: ChannelType, members: &[&str]) {
        let mut state = self.state.lock();
        state.channels.insert(
            id.to_string(),
            Channel {
                id: id.to_string(),
                team_id: team_id.to_string(),
                channel_type,
                name: id.to_string(),
                display_name: id.to_string(),
            },
        );
        state.members.insert(
            id.to_string(),
            members
                .iter()
                .map(|user_id| ChannelMember {
                    channel_id: id.to_string(),
                    user_id: user_id.to_string(),
                    notify_props: HashMap::new(),
                })
                .collect(),
        );
    }

    pub fn insert_post(&self, post: Post) {
        self.state.lock().posts.insert(post.id.clone(), post);
    }

    pub fn set_preference(&self, user_id: &str, category: &str, name: &str, value: &str) {
        self.state.lock().preferences.insert(
            (user_id.to_string(), category.to_string(), name.to_string()),
            value.to_string(),
        );
    }

    pub fn preference(&self, user_id: &str, category: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .preferences
            .get(&(user_id.to_string(), category.to_string(), name.to_string()))
            .cloned()
    }

    pub fn created_posts(&self) -> Vec<Post> {
        self.state.lock().created.clone()
    }

    pub fn notify_patches(&self) -> Vec<(Vec<ChannelMemberIdentifier>, HashMap<String, String>)> {
        self.state.lock().notify_patches.clone()
    }

    pub fn member_props(&self, channel_id: &str, user_id: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .members
            .get(channel_id)
            .and_then(|members| members.iter().find(|m| m.user_id == user_id))
            .map(|m| m.notify_props.clone())
            .unwrap_or_default()
    }

    fn find_or_create_channel(&self, channel_type: ChannelType, user_ids: &[String]) -> Channel {
        let wanted: HashSet<&String> = user_ids.iter().collect();
        let mut state = self.state.lock();
        let existing = state.channels.values().find(|channel| {
            channel.channel_type == channel_type
                && state.members.get(&channel.id).is_some_and(|members| {
                    members.len() == wanted.len()
                        && members.iter().all(|m| wanted.contains(&m.user_id))
                })
        });
        if let Some(channel) = existing {
            return channel.clone();
        }

        let id = state.next_id(if channel_type == ChannelType::Direct { "dm" } else { "gm" });
        let channel = Channel {
            id: id.clone(),
            team_id: String::new(),
            channel_type,
            name: id.clone(),
            display_name: id.clone(),
        };
        state.channels.insert(id.clone(), channel.clone());
        let mut unique: Vec<&String> = wanted.into_iter().collect();
        unique.sort();
        state.members.insert(
            id.clone(),
            unique
                .into_iter()
                .map(|user_id| ChannelMember {
                    channel_id: id.clone(),
                    user_id: user_id.clone(),
                    notify_props: HashMap::new(),
                })
                .collect(),
        );
        channel
    }

    fn store_file(&self, data: Vec<u8>, filename: &str) -> FileInfo {
        let mut state = self.state.lock();
        let id = state.next_id("file");
        let info = FileInfo {
            id: id.clone(),
            name: filename.to_string(),
            size: data.len() as i64,
            mime_type: String::new(),
        };
        state.files.insert(id, info.clone());
        state.uploads.push((filename.to_string(), data));
        info
    }
}

#[async_trait]
impl Host for FakeHost {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn limits(&self) -> HostLimits {
        self.limits
    }

    async fn get_user(&self, user_id: &str) -> Result<User, HostError> {
        self.state
            .lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("user {user_id}")))
    }

    async fn update_user(&self, user: &User) -> Result<User, HostError> {
        let mut state = self.state.lock();
        state.users.insert(user.id.clone(), user.clone());
        state.updated_users.push(user.clone());
        Ok(user.clone())
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, HostError> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("channel {channel_id}")))
    }

    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<ChannelMember>, HostError> {
        let state = self.state.lock();
        let members = state.members.get(channel_id).cloned().unwrap_or_default();
        Ok(members
            .into_iter()
            .skip(page * per_page)
            .take(per_page)
            .collect())
    }

    async fn get_channels_for_user(&self, user_id: &str) -> Result<Vec<Channel>, HostError> {
        let state = self.state.lock();
        let mut channels: Vec<Channel> = state
            .channels
            .values()
            .filter(|channel| {
                state
                    .members
                    .get(&channel.id)
                    .is_some_and(|members| members.iter().any(|m| m.user_id == user_id))
            })
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(channels)
    }

    async fn get_direct_channel(&self, user_a: &str, user_b: &str) -> Result<Channel, HostError> {
        Ok(self.find_or_create_channel(
            ChannelType::Direct,
            &[user_a.to_string(), user_b.to_string()],
        ))
    }

    async fn get_group_channel(&self, user_ids: &[String]) -> Result<Channel, HostError> {
        Ok(self.find_or_create_channel(ChannelType::Group, user_ids))
    }

    async fn create_post(&self, post: &Post) -> Result<Post, HostError> {
        let mut state = self.state.lock();
        let mut created = post.clone();
        if created.id.is_empty() {
            created.id = state.next_id("post");
        }
        if created.create_at == 0 {
            created.create_at = Utc::now().timestamp_millis();
        }
        created.update_at = created.create_at;
        state.posts.insert(created.id.clone(), created.clone());
        state.created.push(created.clone());
        Ok(created)
    }

    async fn update_post(&self, post: &Post) -> Result<Post, HostError> {
        let mut state = self.state.lock();
        if state.fail_update_post {
            return Err(HostError::Request("update refused".to_string()));
        }
        if !state.posts.contains_key(&post.id) {
            return Err(HostError::NotFound(format!("post {}", post.id)));
        }
        state.posts.insert(post.id.clone(), post.clone());
        state.updated.push(post.clone());
        Ok(post.clone())
    }

    async fn delete_post(&self, post_id: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state
            .posts
            .remove(post_id)
            .ok_or_else(|| HostError::NotFound(format!("post {post_id}")))?;
        state.deleted.push(post_id.to_string());
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> Result<Post, HostError> {
        self.state
            .lock()
            .posts
            .get(post_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("post {post_id}")))
    }

    async fn send_ephemeral_post(&self, user_id: &str, post: &Post) -> Result<(), HostError> {
        self.state
            .lock()
            .ephemeral
            .push((user_id.to_string(), post.clone()));
        Ok(())
    }

    async fn get_reactions(&self, post_id: &str) -> Result<Vec<Reaction>, HostError> {
        Ok(self
            .state
            .lock()
            .reactions
            .iter()
            .filter(|r| r.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), HostError> {
        self.state.lock().reactions.push(reaction.clone());
        Ok(())
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.reactions.retain(|r| {
            !(r.post_id == reaction.post_id
                && r.user_id == reaction.user_id
                && r.emoji_name == reaction.emoji_name)
        });
        state.removed_reactions.push(reaction.clone());
        Ok(())
    }

    async fn upload_file(
        &self,
        data: Vec<u8>,
        _channel_id: &str,
        filename: &str,
    ) -> Result<FileInfo, HostError> {
        Ok(self.store_file(data, filename))
    }

    async fn upload_file_stream(
        &self,
        mut reader: FileReader,
        _channel_id: &str,
        filename: &str,
        _size: i64,
    ) -> Result<FileInfo, HostError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| HostError::Request(e.to_string()))?;
        Ok(self.store_file(data, filename))
    }

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, HostError> {
        self.state
            .lock()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("file {file_id}")))
    }

    async fn patch_channel_members_notifications(
        &self,
        members: &[ChannelMemberIdentifier],
        notify_props: &HashMap<String, String>,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        for member in members {
            if let Some(existing) = state
                .members
                .get_mut(&member.channel_id)
                .and_then(|list| list.iter_mut().find(|m| m.user_id == member.user_id))
            {
                existing.notify_props.extend(notify_props.clone());
            }
        }
        state
            .notify_patches
            .push((members.to_vec(), notify_props.clone()));
        Ok(())
    }

    async fn get_preference(
        &self,
        user_id: &str,
        category: &str,
        name: &str,
    ) -> Result<Option<String>, HostError> {
        Ok(self.preference(user_id, category, name))
    }

    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: &[Preference],
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        for pref in preferences {
            state.preferences.insert(
                (user_id.to_string(), pref.category.clone(), pref.name.clone()),
                pref.value.clone(),
            );
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self.state.lock().kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<(), HostError> {
        self.state.lock().kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.mutexes.lock(key).await
    }
}

/// One message sent through the fake remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub parent_id: String,
    pub text: String,
}

#[derive(Default)]
pub struct RemoteState {
    pub chats: HashMap<String, Chat>,
    pub messages: HashMap<String, Message>,
    pub subscriptions: Vec<Subscription>,
    pub fail_refresh: bool,
    pub fail_subscribe: bool,
    pub fail_list: bool,
    pub files: HashMap<String, (i64, String)>,
    pub contents: HashMap<String, Vec<u8>>,
    pub hosted: HashMap<String, Vec<u8>>,
    pub snippets: HashMap<String, String>,
    pub avatars: HashMap<String, Vec<u8>>,
    pub calls: Vec<String>,
    pub sent: Vec<SentMessage>,
    next_id: u64,
}

impl RemoteState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }
}

pub fn chat_message_key(chat_id: &str, message_id: &str) -> String {
    format!("chats/{chat_id}/{message_id}")
}

pub fn channel_message_key(team_id: &str, channel_id: &str, message_id: &str) -> String {
    format!("teams/{team_id}/{channel_id}/{message_id}")
}

pub fn reply_key(team_id: &str, channel_id: &str, message_id: &str, reply_id: &str) -> String {
    format!("teams/{team_id}/{channel_id}/{message_id}/{reply_id}")
}

fn not_found(what: &str) -> ClientError {
    ClientError::from_status(404, "NotFound", what)
}

/// Scriptable remote graph. Every call is recorded by name.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn add_chat(&self, chat: Chat) {
        self.state.lock().chats.insert(chat.id.clone(), chat);
    }

    pub fn add_chat_message(&self, message: Message) {
        let key = chat_message_key(&message.chat_id, &message.id);
        self.state.lock().messages.insert(key, message);
    }

    pub fn add_channel_message(&self, message: Message) {
        let key = channel_message_key(&message.team_id, &message.channel_id, &message.id);
        self.state.lock().messages.insert(key, message);
    }

    pub fn add_subscription(&self, subscription: Subscription) {
        self.state.lock().subscriptions.push(subscription);
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn lookup(&self, key: &str) -> Result<Message, ClientError> {
        self.state
            .lock()
            .messages
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    fn send(&self, target: String, parent_id: &str, text: &str) -> Message {
        let mut state = self.state.lock();
        let id = state.next_id("remote-msg");
        state.sent.push(SentMessage {
            target,
            parent_id: parent_id.to_string(),
            text: text.to_string(),
        });
        let now = Utc::now();
        Message {
            id,
            text: text.to_string(),
            create_at: now,
            last_update_at: now,
            ..Message::default()
        }
    }

    fn subscribe(&self, resource: String, base_url: &str) -> Result<Subscription, ClientError> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(ClientError::from_status(500, "InternalServerError", "subscribe failed"));
        }
        let subscription = Subscription {
            id: state.next_id("sub"),
            kind: String::new(),
            team_id: String::new(),
            channel_id: String::new(),
            resource,
            expires_on: Utc::now() + Duration::minutes(30),
            notification_url: notification_url(base_url),
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, ClientError> {
        self.record(format!("get_chat:{chat_id}"));
        self.state
            .lock()
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| not_found(chat_id))
    }

    async fn get_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        self.record(format!("get_chat_message:{chat_id}:{message_id}"));
        self.lookup(&chat_message_key(chat_id, message_id))
    }

    async fn get_message(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        self.record(format!("get_message:{team_id}:{channel_id}:{message_id}"));
        self.lookup(&channel_message_key(team_id, channel_id, message_id))
    }

    async fn get_reply(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
        reply_id: &str,
    ) -> Result<Message, ClientError> {
        self.record(format!("get_reply:{message_id}:{reply_id}"));
        self.lookup(&reply_key(team_id, channel_id, message_id, reply_id))
    }

    async fn send_chat(
        &self,
        chat_id: &str,
        message: &str,
        parent: Option<&Message>,
    ) -> Result<Message, ClientError> {
        self.record(format!("send_chat:{chat_id}"));
        let parent_id = parent.map(|p| p.id.clone()).unwrap_or_default();
        Ok(self.send(chat_id.to_string(), &parent_id, message))
    }

    async fn send_message(
        &self,
        team_id: &str,
        channel_id: &str,
        parent_id: &str,
        message: &str,
    ) -> Result<Message, ClientError> {
        self.record(format!("send_message:{team_id}:{channel_id}"));
        Ok(self.send(format!("{team_id}/{channel_id}"), parent_id, message))
    }

    async fn update_message(
        &self,
        _team_id: &str,
        _channel_id: &str,
        _parent_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("update_message:{message_id}:{message}"));
        Ok(())
    }

    async fn update_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("update_chat_message:{chat_id}:{message_id}:{message}"));
        Ok(())
    }

    async fn delete_message(
        &self,
        _team_id: &str,
        _channel_id: &str,
        _parent_id: &str,
        message_id: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("delete_message:{message_id}"));
        Ok(())
    }

    async fn delete_chat_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("delete_chat_message:{chat_id}:{message_id}"));
        Ok(())
    }

    async fn set_reaction(
        &self,
        _team_id: &str,
        _channel_id: &str,
        _parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("set_reaction:{message_id}:{user_id}:{emoji}"));
        Ok(())
    }

    async fn unset_reaction(
        &self,
        _team_id: &str,
        _channel_id: &str,
        _parent_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("unset_reaction:{message_id}:{user_id}:{emoji}"));
        Ok(())
    }

    async fn set_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("set_chat_reaction:{chat_id}:{message_id}:{user_id}:{emoji}"));
        Ok(())
    }

    async fn unset_chat_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.record(format!(
            "unset_chat_reaction:{chat_id}:{message_id}:{user_id}:{emoji}"
        ));
        Ok(())
    }

    async fn subscribe_to_chats(
        &self,
        base_url: &str,
        _webhook_secret: &str,
        _pay: bool,
    ) -> Result<Subscription, ClientError> {
        self.record("subscribe_to_chats".to_string());
        self.subscribe(ALL_CHATS_RESOURCE.to_string(), base_url)
    }

    async fn subscribe_to_channel(
        &self,
        team_id: &str,
        channel_id: &str,
        base_url: &str,
        _webhook_secret: &str,
    ) -> Result<Subscription, ClientError> {
        self.record(format!("subscribe_to_channel:{team_id}:{channel_id}"));
        let mut subscription = self.subscribe(
            format!("/teams/{team_id}/channels/{channel_id}/messages"),
            base_url,
        )?;
        subscription.team_id = team_id.to_string();
        subscription.channel_id = channel_id.to_string();
        Ok(subscription)
    }

    async fn refresh_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<DateTime<Utc>, ClientError> {
        self.record(format!("refresh_subscription:{subscription_id}"));
        let mut state = self.state.lock();
        if state.fail_refresh {
            return Err(not_found(subscription_id));
        }
        let subscription = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| not_found(subscription_id))?;
        subscription.expires_on = Utc::now() + Duration::minutes(30);
        Ok(subscription.expires_on)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.record(format!("delete_subscription:{subscription_id}"));
        self.state
            .lock()
            .subscriptions
            .retain(|s| s.id != subscription_id);
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ClientError> {
        self.record("list_subscriptions".to_string());
        let state = self.state.lock();
        if state.fail_list {
            return Err(ClientError::network("connection reset"));
        }
        Ok(state.subscriptions.clone())
    }

    async fn get_file_size_and_download_url(
        &self,
        web_url: &str,
    ) -> Result<(i64, String), ClientError> {
        self.record(format!("get_file_size_and_download_url:{web_url}"));
        self.state
            .lock()
            .files
            .get(web_url)
            .cloned()
            .ok_or_else(|| not_found(web_url))
    }

    async fn get_file_content(&self, download_url: &str) -> Result<Vec<u8>, ClientError> {
        self.record(format!("get_file_content:{download_url}"));
        self.state
            .lock()
            .contents
            .get(download_url)
            .cloned()
            .ok_or_else(|| not_found(download_url))
    }

    async fn get_file_content_stream(
        &self,
        download_url: &str,
        mut writer: DuplexStream,
        _buffer_size: usize,
    ) -> Result<(), ClientError> {
        self.record(format!("get_file_content_stream:{download_url}"));
        let data = self.state.lock().contents.get(download_url).cloned();
        let result = match data {
            Some(data) => writer
                .write_all(&data)
                .await
                .map_err(|e| ClientError::network(e.to_string())),
            None => Err(not_found(download_url)),
        };
        let _ = writer.shutdown().await;
        result
    }

    async fn get_hosted_file_content(&self, ids: &ActivityIds) -> Result<Vec<u8>, ClientError> {
        self.record(format!("get_hosted_file_content:{}", ids.hosted_contents_id));
        self.state
            .lock()
            .hosted
            .get(&ids.hosted_contents_id)
            .cloned()
            .ok_or_else(|| not_found(&ids.hosted_contents_id))
    }

    async fn get_code_snippet(&self, url: &str) -> Result<String, ClientError> {
        self.record(format!("get_code_snippet:{url}"));
        self.state
            .lock()
            .snippets
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(url))
    }

    async fn create_or_get_chat_for_users(
        &self,
        user_ids: &[String],
    ) -> Result<String, ClientError> {
        let mut sorted = user_ids.to_vec();
        sorted.sort();
        let chat_id = format!("chat-{}", sorted.join("-"));
        self.record(format!("create_or_get_chat_for_users:{chat_id}"));
        Ok(chat_id)
    }

    async fn get_user(&self, user_id: &str) -> Result<crate::msteams::User, ClientError> {
        self.record(format!("get_user:{user_id}"));
        Ok(crate::msteams::User {
            id: user_id.to_string(),
            is_account_enabled: true,
            ..Default::default()
        })
    }

    async fn get_user_avatar(&self, user_id: &str) -> Result<Vec<u8>, ClientError> {
        self.record(format!("get_user_avatar:{user_id}"));
        self.state
            .lock()
            .avatars
            .get(user_id)
            .cloned()
            .ok_or_else(|| not_found(user_id))
    }

    async fn get_my_id(&self) -> Result<String, ClientError> {
        self.record("get_my_id".to_string());
        Ok("app".to_string())
    }
}

/// Hands out the same fake remote as app client and for every connected user.
pub struct FakeClients {
    remote: Arc<FakeRemote>,
    local_users: Mutex<HashSet<String>>,
    remote_users: Mutex<HashSet<String>>,
}

impl FakeClients {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        Self {
            remote,
            local_users: Mutex::new(HashSet::new()),
            remote_users: Mutex::new(HashSet::new()),
        }
    }

    pub fn connect(&self, local_user_id: &str, remote_user_id: &str) {
        self.local_users.lock().insert(local_user_id.to_string());
        self.remote_users.lock().insert(remote_user_id.to_string());
    }
}

#[async_trait]
impl ClientFactory for FakeClients {
    fn app_client(&self) -> Arc<dyn RemoteClient> {
        self.remote.clone()
    }

    async fn client_for_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, SyncError> {
        Ok(self
            .local_users
            .lock()
            .contains(local_user_id)
            .then(|| self.remote.clone() as Arc<dyn RemoteClient>))
    }

    async fn client_for_teams_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<Arc<dyn RemoteClient>>, SyncError> {
        Ok(self
            .remote_users
            .lock()
            .contains(remote_user_id)
            .then(|| self.remote.clone() as Arc<dyn RemoteClient>))
    }
}

/// A bridge wired to fakes and a throwaway SQLite database.
pub struct TestBridge {
    pub bridge: BridgeCore,
    pub host: Arc<FakeHost>,
    pub remote: Arc<FakeRemote>,
    pub clients: Arc<FakeClients>,
    pub metrics: Arc<Metrics>,
    _dir: TempDir,
}

impl TestBridge {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let mut config = test_config();
        customize(&mut config);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db").to_string_lossy().to_string();
        let db = DatabaseManager::sqlite(path, Arc::new(TokenCipher::new("test-key")));
        db.migrate().await.unwrap();

        let host = Arc::new(FakeHost::with_limits(
            config.bot_user_id(),
            HostLimits {
                max_file_size: config.host.max_file_size,
                max_image_resolution: config.host.max_image_resolution,
            },
        ));
        let remote = Arc::new(FakeRemote::new());
        let clients = Arc::new(FakeClients::new(remote.clone()));
        let metrics = Arc::new(Metrics::new());
        let bridge = BridgeCore::new(
            Arc::new(config),
            host.clone(),
            clients.clone(),
            Arc::new(db),
            metrics.clone(),
        );

        Self {
            bridge,
            host,
            remote,
            clients,
            metrics,
            _dir: dir,
        }
    }

    /// Adds a local user linked to `remote_user_id` with a stored token.
    pub async fn connect_user(&self, local_user_id: &str, username: &str, remote_user_id: &str) {
        self.host.add_user(user(local_user_id, username));
        self.bridge
            .users()
            .set_user_info(local_user_id, remote_user_id, Some("token"))
            .await
            .unwrap();
        self.clients.connect(local_user_id, remote_user_id);
    }

    /// Adds a local user linked to `remote_user_id` without a token.
    pub async fn link_user(&self, local_user_id: &str, username: &str, remote_user_id: &str) {
        self.host.add_user(user(local_user_id, username));
        self.bridge
            .users()
            .set_user_info(local_user_id, remote_user_id, None)
            .await
            .unwrap();
    }
}
