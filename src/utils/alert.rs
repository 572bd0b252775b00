use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::host::{Host, HostError, Post};

/// Sends direct messages from the bot account to a single local user.
pub struct BotNotifier {
    host: Arc<dyn Host>,
}

impl BotNotifier {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    pub async fn notify(&self, user_id: &str, message: &str) -> Result<Post, HostError> {
        self.notify_with_props(user_id, message, Map::new()).await
    }

    pub async fn notify_with_props(
        &self,
        user_id: &str,
        message: &str,
        props: Map<String, Value>,
    ) -> Result<Post, HostError> {
        let channel_id = self.ensure_dm_channel(user_id).await?;

        let mut post = Post::new(channel_id, self.host.bot_user_id(), message);
        post.props = props;
        let created = self.host.create_post(&post).await?;

        debug!("bot notification sent user_id={} post_id={}", user_id, created.id);
        Ok(created)
    }

    async fn ensure_dm_channel(&self, user_id: &str) -> Result<String, HostError> {
        let channel = self
            .host
            .get_direct_channel(user_id, self.host.bot_user_id())
            .await?;
        debug!("using bot DM channel user_id={} channel_id={}", user_id, channel.id);
        Ok(channel.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[tokio::test]
    async fn notify_posts_into_the_bot_dm() {
        let host = Arc::new(FakeHost::new("bot"));
        let notifier = BotNotifier::new(host.clone());

        let post = notifier.notify("u1", "hello").await.unwrap();
        assert_eq!(post.user_id, "bot");
        assert_eq!(post.message, "hello");

        let channel = host.get_channel(&post.channel_id).await.unwrap();
        assert!(channel.is_direct_or_group());
        assert_eq!(host.created_posts().len(), 1);
    }
}
