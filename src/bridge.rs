use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Config;
use crate::db::{
    ChannelLinkStore, DatabaseManager, InviteStore, PostStore, SubscriptionStore, UserStore,
};
use crate::host::{Host, Post};
use crate::metrics::Metrics;
use crate::msteams::{Chat, ClientFactory, RemoteClient};
use crate::utils::BotNotifier;

pub mod activity;
pub mod attachments;
pub mod automute;
pub mod converters;
pub mod emoji;
pub mod hooks;
pub mod ignore;
pub mod markdown;
pub mod mirror;
pub mod monitor;
pub mod notifications;

use self::emoji::EmojiTable;
use self::ignore::IgnoredHooks;

/// KV key holding the remote timestamp of the newest applied change.
pub const LAST_RECEIVED_CHANGE_KEY: &str = "last_received_change";

/// Shared context of the sync engine. Every component borrows its
/// collaborators from here instead of reaching back into a parent.
#[derive(Clone)]
pub struct BridgeCore {
    config: Arc<Config>,
    host: Arc<dyn Host>,
    clients: Arc<dyn ClientFactory>,
    db: Arc<DatabaseManager>,
    metrics: Arc<Metrics>,
    emoji: Arc<EmojiTable>,
    ignored: Arc<IgnoredHooks>,
}

impl BridgeCore {
    pub fn new(
        config: Arc<Config>,
        host: Arc<dyn Host>,
        clients: Arc<dyn ClientFactory>,
        db: Arc<DatabaseManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            host,
            clients,
            db,
            metrics,
            emoji: Arc::new(EmojiTable::new()),
            ignored: Arc::new(IgnoredHooks::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn clients(&self) -> &Arc<dyn ClientFactory> {
        &self.clients
    }

    pub fn db(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn emoji(&self) -> &EmojiTable {
        &self.emoji
    }

    pub fn ignored(&self) -> &IgnoredHooks {
        &self.ignored
    }

    pub fn posts(&self) -> Arc<dyn PostStore> {
        self.db.post_store()
    }

    pub fn links(&self) -> Arc<dyn ChannelLinkStore> {
        self.db.link_store()
    }

    pub fn subscriptions(&self) -> Arc<dyn SubscriptionStore> {
        self.db.subscription_store()
    }

    pub fn users(&self) -> Arc<dyn UserStore> {
        self.db.user_store()
    }

    pub fn invites(&self) -> Arc<dyn InviteStore> {
        self.db.invite_store()
    }

    pub fn bot_user_id(&self) -> &str {
        self.config.bot_user_id()
    }

    pub fn notifier(&self) -> BotNotifier {
        BotNotifier::new(self.host.clone())
    }

    /// Prop stamped on every post the bridge writes locally.
    pub fn sync_prop_key(&self) -> String {
        format!("msteams_sync_{}", self.bot_user_id())
    }

    pub fn is_synced_post(&self, post: &Post) -> bool {
        post.props
            .get(&self.sync_prop_key())
            .is_some_and(|value| value.as_bool() == Some(true) || value.as_str() == Some("true"))
    }

    /// First client able to read the chat. Chat reads are refused for
    /// application credentials, so only member clients qualify.
    pub async fn client_for_chat(&self, chat: &Chat) -> Option<Arc<dyn RemoteClient>> {
        for member in &chat.members {
            match self.clients.client_for_teams_user(&member.user_id).await {
                Ok(Some(client)) => return Some(client),
                Ok(None) => {}
                Err(e) => warn!(
                    "unable to build client for chat member remote_user_id={} error={}",
                    member.user_id, e
                ),
            }
        }
        None
    }

    /// Records the newest remote change applied, in microseconds.
    pub async fn update_last_received_change(&self, at: DateTime<Utc>) {
        let value = at.timestamp_micros().to_string().into_bytes();
        if let Err(e) = self.host.kv_set(LAST_RECEIVED_CHANGE_KEY, value).await {
            warn!("unable to store last received change error={}", e);
        }
    }
}

/// `chat_id` for chat messages, `team_id || channel_id` for channel messages.
pub fn remote_context_id(chat_id: &str, team_id: &str, channel_id: &str) -> String {
    if chat_id.is_empty() {
        format!("{team_id}{channel_id}")
    } else {
        chat_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBridge;

    #[test]
    fn context_id_prefers_chat() {
        assert_eq!(remote_context_id("chat1", "", ""), "chat1");
        assert_eq!(remote_context_id("", "T", "C"), "TC");
    }

    #[tokio::test]
    async fn synced_posts_are_recognised_by_prop() {
        let env = TestBridge::new().await;
        let mut post = Post::new("c1", "u1", "hello");
        assert!(!env.bridge.is_synced_post(&post));
        post.add_prop(env.bridge.sync_prop_key(), true);
        assert!(env.bridge.is_synced_post(&post));
        assert_eq!(env.bridge.sync_prop_key(), "msteams_sync_bot-user");
    }

    #[tokio::test]
    async fn last_received_change_is_stored_in_micros() {
        let env = TestBridge::new().await;
        let at = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        env.bridge.update_last_received_change(at).await;
        let stored = env.host.kv_get(LAST_RECEIVED_CHANGE_KEY).await.unwrap().unwrap();
        assert_eq!(String::from_utf8(stored).unwrap(), "1700000000000005");
    }
}
