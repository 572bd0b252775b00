use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use super::ignore::IgnoredHooks;
use super::markdown::convert_to_html;
use super::{BridgeCore, remote_context_id};
use crate::db::{ChannelLink, PostCorrespondence};
use crate::host::{Channel, ChannelMember, Host, HostError, Post, Preference, Reaction, User};
use crate::metrics::{
    ACTION_CREATED, ACTION_DELETED, ACTION_UPDATED, REACTION_SET, REACTION_UNSET,
    SOURCE_MATTERMOST,
};
use crate::msteams::{Message, RemoteClient};
use crate::utils::SyncError;

static SHORTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([a-z0-9_+\-]+):").expect("valid shortcode regex"));

const MEMBERS_PAGE_SIZE: usize = 200;

pub const PROMOTION_FAILED_MESSAGE: &str = "Unable to promote synthetic user";

/// Turns a synthetic account into a regular one when its owner signs in.
#[async_trait]
pub trait SyntheticUserPromoter: Send + Sync {
    async fn promote(&self, user: &User) -> Result<(), HostError>;
}

/// Clears the remote id through the host user API.
pub struct HostPromoter {
    host: Arc<dyn Host>,
}

impl HostPromoter {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SyntheticUserPromoter for HostPromoter {
    async fn promote(&self, user: &User) -> Result<(), HostError> {
        let mut promoted = user.clone();
        promoted.remote_id = None;
        self.host.update_user(&promoted).await?;
        Ok(())
    }
}

/// Where a local channel is mirrored.
enum Mirror {
    Channel(ChannelLink),
    Chat,
}

/// Host callbacks relaying local activity to the remote side.
pub struct LocalHooks {
    core: BridgeCore,
    promoter: Arc<dyn SyntheticUserPromoter>,
}

impl LocalHooks {
    pub fn new(core: BridgeCore, promoter: Arc<dyn SyntheticUserPromoter>) -> Self {
        Self { core, promoter }
    }

    fn render(&self, text: &str) -> String {
        let text = SHORTCODE_RE.replace_all(text, |caps: &Captures| {
            let glyph = self.core.emoji().to_remote(&caps[1]);
            if glyph == caps[1] {
                caps[0].to_string()
            } else {
                glyph
            }
        });
        convert_to_html(&text)
    }

    async fn mirror_for(&self, channel_id: &str) -> Result<Option<Mirror>, SyncError> {
        if let Some(link) = self.core.links().get_link_by_channel_id(channel_id).await? {
            if !self.core.config().sync.sync_linked_channels {
                return Ok(None);
            }
            return Ok(Some(Mirror::Channel(link)));
        }

        let channel = self.core.host().get_channel(channel_id).await?;
        if channel.is_direct_or_group() && self.core.config().sync.sync_direct_messages {
            return Ok(Some(Mirror::Chat));
        }
        Ok(None)
    }

    /// The author's own client, or the app client with the author's name
    /// prefixed to the text.
    async fn channel_client(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<(Arc<dyn RemoteClient>, String), SyncError> {
        if let Some(client) = self.core.clients().client_for_user(user_id).await? {
            return Ok((client, text.to_string()));
        }
        let user = self.core.host().get_user(user_id).await?;
        Ok((
            self.core.clients().app_client(),
            format!("{}:\n\n{}", user.username, text),
        ))
    }

    async fn remote_parent_id(&self, root_id: &str) -> String {
        if root_id.is_empty() {
            return String::new();
        }
        match self.core.posts().get_by_local(root_id).await {
            Ok(Some(root)) => root.remote_message_id,
            Ok(None) => String::new(),
            Err(e) => {
                warn!("unable to look up thread root root_id={} error={}", root_id, e);
                String::new()
            }
        }
    }

    async fn channel_members(&self, channel_id: &str) -> Result<Vec<ChannelMember>, SyncError> {
        let mut all = Vec::new();
        let mut page = 0;
        loop {
            let members = self
                .core
                .host()
                .get_channel_members(channel_id, page, MEMBERS_PAGE_SIZE)
                .await?;
            let done = members.len() < MEMBERS_PAGE_SIZE;
            all.extend(members);
            if done {
                return Ok(all);
            }
            page += 1;
        }
    }

    async fn link_posts(&self, post_id: &str, message: &Message, context_id: String) {
        let correspondence = PostCorrespondence::new(
            post_id,
            &message.id,
            context_id,
            message.last_update_at.timestamp_micros(),
        );
        if let Err(e) = self.core.posts().link_posts(&correspondence).await {
            warn!("unable to link posts post_id={} error={}", post_id, e);
        }
    }

    async fn touch(&self, post_id: &str) {
        let now = Utc::now().timestamp_micros();
        if let Err(e) = self.core.posts().set_last_update_at_by_local(post_id, now).await {
            warn!("unable to update post link metadata post_id={} error={}", post_id, e);
        }
    }

    pub async fn message_has_been_posted(&self, post: &Post) {
        if self.core.is_synced_post(post) || post.is_system() {
            return;
        }

        let result = match self.mirror_for(&post.channel_id).await {
            Ok(Some(Mirror::Channel(link))) => self.send_to_channel(&link, post).await,
            Ok(Some(Mirror::Chat)) => self.send_to_chat(post).await,
            Ok(None) => return,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("unable to relay posted message post_id={} error={}", post.id, e);
        }
    }

    async fn send_to_channel(&self, link: &ChannelLink, post: &Post) -> Result<(), SyncError> {
        let (client, text) = self.channel_client(&post.user_id, &post.message).await?;
        let text = self.render(&text);
        let parent_id = self.remote_parent_id(&post.root_id).await;

        let message = client
            .send_message(&link.remote_team_id, &link.remote_channel_id, &parent_id, &text)
            .await?;
        self.core
            .metrics()
            .observe_message(ACTION_CREATED, SOURCE_MATTERMOST, false);
        let context_id = remote_context_id("", &link.remote_team_id, &link.remote_channel_id);
        self.link_posts(&post.id, &message, context_id).await;
        Ok(())
    }

    async fn chat_for_channel(
        &self,
        client: &dyn RemoteClient,
        channel_id: &str,
    ) -> Result<Option<String>, SyncError> {
        let mut remote_ids = Vec::new();
        for member in self.channel_members(channel_id).await? {
            match self.core.users().local_to_teams(&member.user_id).await? {
                Some(remote_id) => remote_ids.push(remote_id),
                None => {
                    debug!(
                        "chat member has no remote identity channel_id={} user_id={}",
                        channel_id, member.user_id
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(client.create_or_get_chat_for_users(&remote_ids).await?))
    }

    async fn send_to_chat(&self, post: &Post) -> Result<(), SyncError> {
        let Some(client) = self.core.clients().client_for_user(&post.user_id).await? else {
            debug!("author is not connected user_id={}", post.user_id);
            return Ok(());
        };
        let Some(chat_id) = self.chat_for_channel(client.as_ref(), &post.channel_id).await? else {
            return Ok(());
        };

        let parent_id = self.remote_parent_id(&post.root_id).await;
        let parent = if parent_id.is_empty() {
            None
        } else {
            client
                .get_chat_message(&chat_id, &parent_id)
                .await
                .inspect_err(|e| warn!("unable to get parent chat message error={}", e))
                .ok()
        };

        let message = client
            .send_chat(&chat_id, &self.render(&post.message), parent.as_ref())
            .await?;
        self.core
            .metrics()
            .observe_message(ACTION_CREATED, SOURCE_MATTERMOST, true);
        self.link_posts(&post.id, &message, chat_id).await;
        Ok(())
    }

    pub async fn message_has_been_updated(&self, new: &Post, _old: &Post) {
        if self.core.ignored().take(&IgnoredHooks::post_key(&new.id)) {
            return;
        }
        if let Err(e) = self.update(new).await {
            warn!("unable to relay message update post_id={} error={}", new.id, e);
        }
    }

    async fn update(&self, post: &Post) -> Result<(), SyncError> {
        let Some(correspondence) = self.core.posts().get_by_local(&post.id).await? else {
            return Ok(());
        };
        let Some(mirror) = self.mirror_for(&post.channel_id).await? else {
            return Ok(());
        };

        let _guard = self.core.host().lock(&format!("post_mutex_{}", post.id)).await;
        match mirror {
            Mirror::Channel(link) => {
                let (client, text) = self.channel_client(&post.user_id, &post.message).await?;
                let text = self.render(&text);
                let parent_id = self.remote_parent_id(&post.root_id).await;
                client
                    .update_message(
                        &link.remote_team_id,
                        &link.remote_channel_id,
                        &parent_id,
                        &correspondence.remote_message_id,
                        &text,
                    )
                    .await?;
                self.core
                    .metrics()
                    .observe_message(ACTION_UPDATED, SOURCE_MATTERMOST, false);
            }
            Mirror::Chat => {
                let Some(client) = self.core.clients().client_for_user(&post.user_id).await?
                else {
                    return Ok(());
                };
                client
                    .update_chat_message(
                        &correspondence.remote_context_id,
                        &correspondence.remote_message_id,
                        &self.render(&post.message),
                    )
                    .await?;
                self.core
                    .metrics()
                    .observe_message(ACTION_UPDATED, SOURCE_MATTERMOST, true);
            }
        }
        self.touch(&post.id).await;
        Ok(())
    }

    pub async fn message_has_been_deleted(&self, post: &Post) {
        if self.core.ignored().take(&IgnoredHooks::post_key(&post.id)) {
            return;
        }
        if let Err(e) = self.delete(post).await {
            warn!("unable to relay message deletion post_id={} error={}", post.id, e);
        }
    }

    async fn delete(&self, post: &Post) -> Result<(), SyncError> {
        let Some(correspondence) = self.core.posts().get_by_local(&post.id).await? else {
            return Ok(());
        };
        let Some(mirror) = self.mirror_for(&post.channel_id).await? else {
            return Ok(());
        };

        let _guard = self.core.host().lock(&format!("post_mutex_{}", post.id)).await;

        match mirror {
            Mirror::Channel(link) => {
                let (client, _) = self.channel_client(&post.user_id, "").await?;
                let parent_id = self.remote_parent_id(&post.root_id).await;
                client
                    .delete_message(
                        &link.remote_team_id,
                        &link.remote_channel_id,
                        &parent_id,
                        &correspondence.remote_message_id,
                    )
                    .await?;
                self.core
                    .metrics()
                    .observe_message(ACTION_DELETED, SOURCE_MATTERMOST, false);
            }
            Mirror::Chat => {
                let Some(client) = self.core.clients().client_for_user(&post.user_id).await?
                else {
                    return Ok(());
                };
                client
                    .delete_chat_message(
                        &correspondence.remote_context_id,
                        &correspondence.remote_message_id,
                    )
                    .await?;
                self.core
                    .metrics()
                    .observe_message(ACTION_DELETED, SOURCE_MATTERMOST, true);
            }
        }
        self.core.posts().delete_by_local(&post.id).await?;
        Ok(())
    }

    pub async fn reaction_has_been_added(&self, reaction: &Reaction) {
        let key = IgnoredHooks::reaction_key(&reaction.post_id, &reaction.user_id, &reaction.emoji_name);
        if self.core.ignored().take(&key) {
            return;
        }
        if let Err(e) = self.relay_reaction(reaction, true).await {
            warn!("unable to relay reaction post_id={} error={}", reaction.post_id, e);
        }
    }

    pub async fn reaction_has_been_removed(&self, reaction: &Reaction) {
        let key = IgnoredHooks::reaction_key(&reaction.post_id, &reaction.user_id, &reaction.emoji_name);
        if self.core.ignored().take(&key) {
            return;
        }
        if let Err(e) = self.relay_reaction(reaction, false).await {
            warn!("unable to relay reaction removal post_id={} error={}", reaction.post_id, e);
        }
    }

    async fn relay_reaction(&self, reaction: &Reaction, set: bool) -> Result<(), SyncError> {
        let Some(correspondence) = self.core.posts().get_by_local(&reaction.post_id).await? else {
            return Ok(());
        };
        let post = self.core.host().get_post(&reaction.post_id).await?;
        let Some(mirror) = self.mirror_for(&post.channel_id).await? else {
            return Ok(());
        };
        let Some(client) = self.core.clients().client_for_user(&reaction.user_id).await? else {
            debug!("reacting user is not connected user_id={}", reaction.user_id);
            return Ok(());
        };
        let Some(remote_user_id) = self.core.users().local_to_teams(&reaction.user_id).await? else {
            return Ok(());
        };

        let emoji = self.core.emoji().to_remote(&reaction.emoji_name);
        let message_id = &correspondence.remote_message_id;
        let action = if set { REACTION_SET } else { REACTION_UNSET };

        match mirror {
            Mirror::Channel(link) => {
                let parent_id = self.remote_parent_id(&post.root_id).await;
                let _guard = self.core.host().lock(&format!("post_mutex_{}", post.id)).await;
                let (team, channel) = (&link.remote_team_id, &link.remote_channel_id);
                if set {
                    client
                        .set_reaction(team, channel, &parent_id, message_id, &remote_user_id, &emoji)
                        .await?;
                } else {
                    client
                        .unset_reaction(team, channel, &parent_id, message_id, &remote_user_id, &emoji)
                        .await?;
                }
                self.core
                    .metrics()
                    .observe_reaction(action, SOURCE_MATTERMOST, false);
            }
            Mirror::Chat => {
                let chat_id = &correspondence.remote_context_id;
                let _guard = self
                    .core
                    .host()
                    .lock(&format!("post_mutex_{chat_id}{message_id}"))
                    .await;
                if set {
                    client
                        .set_chat_reaction(chat_id, message_id, &remote_user_id, &emoji)
                        .await?;
                } else {
                    client
                        .unset_chat_reaction(chat_id, message_id, &remote_user_id, &emoji)
                        .await?;
                }
                self.core
                    .metrics()
                    .observe_reaction(action, SOURCE_MATTERMOST, true);
            }
        }
        self.touch(&post.id).await;
        Ok(())
    }

    /// Returns a rejection message when sign-in must be refused.
    pub async fn user_will_log_in(&self, user: &User) -> Option<String> {
        if !user.is_synthetic() || !self.core.config().sync.automatically_promote_synthetic_users {
            return None;
        }
        if let Err(e) = self.promoter.promote(user).await {
            warn!("unable to promote synthetic user user_id={} error={}", user.id, e);
            return Some(PROMOTION_FAILED_MESSAGE.to_string());
        }
        info!("promoted synthetic user user_id={}", user.id);
        None
    }

    pub async fn user_has_joined_channel(&self, member: &ChannelMember) {
        if let Err(e) = self
            .core
            .update_automuting_on_user_joined_channel(&member.user_id, &member.channel_id)
            .await
        {
            warn!(
                "unable to update automuting on channel join user_id={} channel_id={} error={}",
                member.user_id, member.channel_id, e
            );
        }
    }

    pub async fn channel_has_been_created(&self, channel: &Channel) {
        if let Err(e) = self.core.update_automuting_on_channel_created(channel).await {
            warn!("unable to update automuting on channel creation channel_id={} error={}", channel.id, e);
        }
    }

    pub async fn preferences_have_changed(&self, preferences: &[Preference]) {
        self.core
            .update_automuting_on_preferences_changed(preferences)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ChannelType;
    use crate::metrics::COUNTER_MESSAGES;
    use crate::testing::TestBridge;

    struct Env {
        env: TestBridge,
        hooks: LocalHooks,
    }

    async fn setup() -> Env {
        let env = TestBridge::with_config(|config| {
            config.sync.sync_linked_channels = true;
            config.sync.sync_direct_messages = true;
        })
        .await;
        env.host.add_channel("linked", "team", ChannelType::Open, &["alice", "bob"]);
        env.bridge
            .links()
            .store_channel_link(&ChannelLink {
                local_team_id: "team".to_string(),
                local_channel_id: "linked".to_string(),
                remote_team_id: "T".to_string(),
                remote_channel_id: "C".to_string(),
                creator_user_id: "alice".to_string(),
            })
            .await
            .unwrap();
        let hooks = LocalHooks::new(
            env.bridge.clone(),
            Arc::new(HostPromoter::new(env.host.clone())),
        );
        Env { env, hooks }
    }

    async fn posted(env: &TestBridge, channel_id: &str, user_id: &str, text: &str) -> Post {
        env.host
            .create_post(&Post::new(channel_id, user_id, text))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn synced_and_system_posts_are_not_relayed() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;

        let mut synced = Post::new("linked", "alice", "from remote");
        synced.add_prop(env.bridge.sync_prop_key(), true);
        hooks.message_has_been_posted(&synced).await;

        let mut system = Post::new("linked", "alice", "joined");
        system.post_type = "system_join_channel".to_string();
        hooks.message_has_been_posted(&system).await;

        assert!(env.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn connected_author_posts_into_linked_channel() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;
        let post = posted(&env, "linked", "alice", "**hello** :+1:").await;

        hooks.message_has_been_posted(&post).await;

        let sent = env.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "T/C");
        assert_eq!(sent[0].text, "<p><strong>hello</strong> 👍</p>");
        let link = env.bridge.posts().get_by_local(&post.id).await.unwrap().unwrap();
        assert_eq!(link.remote_context_id, "TC");
        assert_eq!(
            env.metrics.counter_value(
                COUNTER_MESSAGES,
                &[("action", "created"), ("source", "mattermost"), ("is_direct", "false")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn unconnected_author_is_relayed_by_the_app() {
        let Env { env, hooks } = setup().await;
        env.host.add_user(crate::testing::user("bob", "bob"));
        let post = posted(&env, "linked", "bob", "hi").await;

        hooks.message_has_been_posted(&post).await;

        assert_eq!(env.remote.sent()[0].text, "<p>bob:</p><p>hi</p>");
    }

    #[tokio::test]
    async fn direct_messages_open_a_chat_and_thread_replies() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;
        env.link_user("bob", "bob", "rb").await;
        env.host.add_channel("dm", "", ChannelType::Direct, &["alice", "bob"]);

        let root = posted(&env, "dm", "alice", "first").await;
        hooks.message_has_been_posted(&root).await;
        let link = env.bridge.posts().get_by_local(&root.id).await.unwrap().unwrap();
        assert_eq!(link.remote_context_id, "chat-ra-rb");

        assert_eq!(env.remote.call_count("create_or_get_chat_for_users:chat-ra-rb"), 1);
        assert_eq!(env.remote.call_count("send_chat:chat-ra-rb"), 1);
    }

    #[tokio::test]
    async fn updates_consume_the_sentinel_once() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;
        let post = posted(&env, "linked", "alice", "v1").await;
        hooks.message_has_been_posted(&post).await;

        env.bridge.ignored().ignore(IgnoredHooks::post_key(&post.id));
        hooks.message_has_been_updated(&post, &post).await;
        assert_eq!(env.remote.call_count("update_message"), 0);

        hooks.message_has_been_updated(&post, &post).await;
        assert_eq!(env.remote.call_count("update_message"), 1);
    }

    #[tokio::test]
    async fn reactions_and_deletes_follow_the_correspondence() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;
        let post = posted(&env, "linked", "alice", "hi").await;
        hooks.message_has_been_posted(&post).await;
        assert_eq!(env.remote.sent()[0].target, "T/C");

        let reaction = Reaction {
            user_id: "alice".to_string(),
            post_id: post.id.clone(),
            emoji_name: "+1".to_string(),
            create_at: 0,
        };
        env.bridge.ignored().ignore(IgnoredHooks::reaction_key(&post.id, "alice", "+1"));
        hooks.reaction_has_been_added(&reaction).await;
        assert_eq!(env.remote.call_count("set_reaction"), 0);

        hooks.reaction_has_been_added(&reaction).await;
        hooks.reaction_has_been_removed(&reaction).await;
        let calls = env.remote.calls();
        assert!(calls.iter().any(|c| c.starts_with("set_reaction:") && c.ends_with(":ra:👍")));
        assert!(calls.iter().any(|c| c.starts_with("unset_reaction:")));

        hooks.message_has_been_deleted(&post).await;
        assert_eq!(env.remote.call_count("delete_message"), 1);
        assert!(env.bridge.posts().get_by_local(&post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_wait_for_the_post_mutex() {
        let Env { env, hooks } = setup().await;
        env.connect_user("alice", "alice", "ra").await;
        let post = posted(&env, "linked", "alice", "hi").await;
        hooks.message_has_been_posted(&post).await;

        let guard = env.host.lock(&format!("post_mutex_{}", post.id)).await;
        let remote = &env.remote;
        let release = async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            assert_eq!(remote.call_count("delete_message"), 0);
            drop(guard);
        };
        tokio::join!(hooks.message_has_been_deleted(&post), release);

        assert_eq!(env.remote.call_count("delete_message"), 1);
        assert!(env.bridge.posts().get_by_local(&post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synthetic_users_are_promoted_on_login() {
        let Env { env, hooks } = setup().await;
        let synthetic = User {
            remote_id: Some("remote".to_string()),
            ..crate::testing::user("s1", "synthetic")
        };
        env.host.add_user(synthetic.clone());

        assert_eq!(hooks.user_will_log_in(&synthetic).await, None);
        assert!(env.host.state().updated_users.is_empty());

        let env = TestBridge::with_config(|config| {
            config.sync.automatically_promote_synthetic_users = true;
        })
        .await;
        let hooks = LocalHooks::new(
            env.bridge.clone(),
            Arc::new(HostPromoter::new(env.host.clone())),
        );
        assert_eq!(hooks.user_will_log_in(&synthetic).await, None);
        let updated = env.host.state().updated_users.clone();
        assert_eq!(updated.len(), 1);
        assert!(!updated[0].is_synthetic());
    }

    struct FailingPromoter;

    #[async_trait]
    impl SyntheticUserPromoter for FailingPromoter {
        async fn promote(&self, _user: &User) -> Result<(), HostError> {
            Err(HostError::Request("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_promotion_refuses_login() {
        let env = TestBridge::with_config(|config| {
            config.sync.automatically_promote_synthetic_users = true;
        })
        .await;
        let hooks = LocalHooks::new(env.bridge.clone(), Arc::new(FailingPromoter));
        let synthetic = User {
            remote_id: Some("remote".to_string()),
            ..crate::testing::user("s1", "synthetic")
        };
        assert_eq!(
            hooks.user_will_log_in(&synthetic).await.as_deref(),
            Some(PROMOTION_FAILED_MESSAGE)
        );
    }
}
