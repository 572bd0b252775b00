use std::collections::HashSet;

use tracing::{debug, error, warn};

use super::ignore::IgnoredHooks;
use super::{BridgeCore, remote_context_id};
use crate::db::PostCorrespondence;
use crate::host::{Post, Reaction};
use crate::metrics::{
    ACTION_CREATED, ACTION_DELETED, ACTION_UPDATED, DISCARDED_REASON_ALREADY_APPLIED,
    DISCARDED_REASON_CHANNEL_NOT_LINKED, DISCARDED_REASON_INACTIVE_USER, DISCARDED_REASON_NONE,
    DISCARDED_REASON_OTHER, REACTION_SET, REACTION_UNSET, SOURCE_MSTEAMS,
};
use crate::msteams::graph::message_from_json;
use crate::msteams::{ActivityIds, Chat, ChatType, Message};
use crate::utils::SyncError;

pub const LIMIT_EXCEEDED_NOTICE: &str = "Some images could not be delivered because they exceeded the maximum resolution and/or size allowed.";

impl BridgeCore {
    /// Fetches the message an activity points at, plus its chat for chat
    /// events. Chat reads need a member's client; `Ok((None, _))` means no
    /// member is connected.
    pub async fn resolve_message(
        &self,
        ids: &ActivityIds,
        content: Option<&serde_json::Value>,
    ) -> Result<(Option<Message>, Option<Chat>), SyncError> {
        let provided = content.and_then(|value| message_from_json(value, ids));

        if ids.is_chat() {
            let chat = self.clients().app_client().get_chat(&ids.chat_id).await?;
            if let Some(msg) = provided {
                return Ok((Some(msg), Some(chat)));
            }
            let Some(client) = self.client_for_chat(&chat).await else {
                return Ok((None, Some(chat)));
            };
            let mut msg = client.get_chat_message(&chat.id, &ids.message_id).await?;
            msg.chat_id = chat.id.clone();
            return Ok((Some(msg), Some(chat)));
        }

        if let Some(msg) = provided {
            return Ok((Some(msg), None));
        }
        let app = self.clients().app_client();
        let mut msg = if ids.reply_id.is_empty() {
            app.get_message(&ids.team_id, &ids.channel_id, &ids.message_id)
                .await?
        } else {
            app.get_reply(&ids.team_id, &ids.channel_id, &ids.message_id, &ids.reply_id)
                .await?
        };
        msg.team_id = ids.team_id.clone();
        msg.channel_id = ids.channel_id.clone();
        Ok((Some(msg), None))
    }

    /// True when the message was written by the bridge's own identity.
    pub async fn is_bot_author(&self, msg: &Message) -> bool {
        if msg.user_id == self.bot_user_id() {
            return true;
        }
        match self.users().local_to_teams(self.bot_user_id()).await {
            Ok(Some(remote_id)) => remote_id == msg.user_id,
            Ok(None) => false,
            Err(e) => {
                warn!("unable to look up the bot's remote identity error={}", e);
                false
            }
        }
    }

    /// Whether full mirroring applies to this message's conversation.
    pub fn mirroring_enabled(&self, is_chat: bool) -> bool {
        if is_chat {
            self.config().sync.sync_direct_messages
        } else {
            self.config().sync.sync_linked_channels
        }
    }

    async fn sender_for(&self, remote_user_id: &str) -> String {
        match self.users().teams_to_local(remote_user_id).await {
            Ok(Some(local_id)) => local_id,
            Ok(None) => self.bot_user_id().to_string(),
            Err(e) => {
                warn!("unable to map remote user remote_user_id={} error={}", remote_user_id, e);
                self.bot_user_id().to_string()
            }
        }
    }

    async fn is_active_user(&self, user_id: &str) -> bool {
        match self.host().get_user(user_id).await {
            Ok(user) => user.is_active(),
            Err(e) => {
                warn!("unable to get local user user_id={} error={}", user_id, e);
                false
            }
        }
    }

    /// Local DM or GM channel whose members mirror the chat's members.
    async fn chat_channel_id(&self, chat: &Chat) -> Result<String, SyncError> {
        let mut user_ids = Vec::with_capacity(chat.members.len());
        for member in &chat.members {
            match self.users().teams_to_local(&member.user_id).await? {
                Some(local_id) => user_ids.push(local_id),
                None => debug!("skipping unmapped chat member remote_user_id={}", member.user_id),
            }
        }
        if user_ids.len() < 2 {
            return Err(SyncError::InvalidInput(format!(
                "not enough local users for chat {}",
                chat.id
            )));
        }

        let direct = match chat.chat_type {
            ChatType::OneOnOne => true,
            ChatType::Group => false,
            ChatType::Unknown => user_ids.len() == 2,
        };
        let channel = if direct {
            self.host()
                .get_direct_channel(&user_ids[0], &user_ids[1])
                .await?
        } else {
            self.host().get_group_channel(&user_ids).await?
        };
        Ok(channel.id)
    }

    /// Creates the local copy of a new remote message. Errors carry the
    /// discard reason.
    pub async fn mirror_created_message(
        &self,
        msg: &Message,
        chat: Option<&Chat>,
    ) -> Result<Post, &'static str> {
        let channel_id = match chat {
            Some(chat) => self.chat_channel_id(chat).await.map_err(|e| {
                error!("unable to get the local channel for chat chat_id={} error={}", chat.id, e);
                DISCARDED_REASON_OTHER
            })?,
            None => match self
                .links()
                .get_link_by_remote_channel_id(&msg.team_id, &msg.channel_id)
                .await
            {
                Ok(Some(link)) => link.local_channel_id,
                Ok(None) => return Err(DISCARDED_REASON_CHANNEL_NOT_LINKED),
                Err(e) => {
                    error!("unable to get channel link error={}", e);
                    return Err(DISCARDED_REASON_OTHER);
                }
            },
        };

        let sender_id = self.sender_for(&msg.user_id).await;
        if !self.is_active_user(&sender_id).await {
            debug!("skipping message from inactive user user_id={}", sender_id);
            return Err(DISCARDED_REASON_INACTIVE_USER);
        }

        let translated = self
            .msg_to_post(&channel_id, &sender_id, msg, chat, &[])
            .await;
        let created = self.host().create_post(&translated.post).await.map_err(|e| {
            error!("unable to create post channel_id={} error={}", channel_id, e);
            DISCARDED_REASON_OTHER
        })?;
        self.metrics()
            .observe_message(ACTION_CREATED, SOURCE_MSTEAMS, chat.is_some());

        if translated.limit_exceeded {
            let notice = Post::new(&channel_id, self.bot_user_id(), LIMIT_EXCEEDED_NOTICE);
            if let Err(e) = self.host().send_ephemeral_post(&sender_id, &notice).await {
                warn!("unable to send limit notice user_id={} error={}", sender_id, e);
            }
        }

        self.update_last_received_change(msg.last_update_at).await;
        let correspondence = PostCorrespondence::new(
            &created.id,
            &msg.id,
            remote_context_id(&msg.chat_id, &msg.team_id, &msg.channel_id),
            msg.last_update_at.timestamp_micros(),
        );
        if let Err(e) = self.posts().link_posts(&correspondence).await {
            warn!("unable to link posts post_id={} error={}", created.id, e);
        }
        Ok(created)
    }

    /// Applies a remote edit to the mirrored local post.
    pub async fn mirror_updated_message(&self, msg: &Message, chat: Option<&Chat>) -> &'static str {
        let context_id = remote_context_id(&msg.chat_id, &msg.team_id, &msg.channel_id);
        let correspondence = match self.posts().get_by_remote(&context_id, &msg.id).await {
            Ok(Some(correspondence)) => correspondence,
            Ok(None) => {
                self.update_last_received_change(msg.last_update_at).await;
                return DISCARDED_REASON_OTHER;
            }
            Err(e) => {
                error!("unable to get post correspondence message_id={} error={}", msg.id, e);
                return DISCARDED_REASON_OTHER;
            }
        };

        let _guard = self
            .host()
            .lock(&format!("post_mutex_{}", correspondence.local_post_id))
            .await;
        // Another edit may have been applied while waiting for the lock.
        let last_update_at = match self.posts().get_by_local(&correspondence.local_post_id).await {
            Ok(Some(current)) => current.last_update_at,
            Ok(None) => return DISCARDED_REASON_OTHER,
            Err(e) => {
                error!("unable to get post correspondence message_id={} error={}", msg.id, e);
                return DISCARDED_REASON_OTHER;
            }
        };

        // Equal means already applied; older must never overwrite newer.
        if msg.last_update_at.timestamp_micros() <= last_update_at {
            return DISCARDED_REASON_ALREADY_APPLIED;
        }

        let existing = match self.host().get_post(&correspondence.local_post_id).await {
            Ok(post) => post,
            Err(e) => {
                error!(
                    "unable to find the original post post_id={} error={}",
                    correspondence.local_post_id, e
                );
                return DISCARDED_REASON_OTHER;
            }
        };

        let sender_id = self.sender_for(&msg.user_id).await;
        if !self.is_active_user(&sender_id).await {
            return DISCARDED_REASON_INACTIVE_USER;
        }

        let translated = self
            .msg_to_post(&existing.channel_id, &sender_id, msg, chat, &existing.file_ids)
            .await;
        let mut post = translated.post;
        post.id = existing.id.clone();
        post.root_id = existing.root_id.clone();
        post.create_at = existing.create_at;

        let key = IgnoredHooks::post_key(&post.id);
        self.ignored().ignore(key.clone());
        if let Err(e) = self.host().update_post(&post).await {
            self.ignored().take(&key);
            error!("unable to update post post_id={} error={}", post.id, e);
            return DISCARDED_REASON_OTHER;
        }

        let is_direct = chat.is_some();
        self.metrics()
            .observe_message(ACTION_UPDATED, SOURCE_MSTEAMS, is_direct);
        self.update_last_received_change(msg.last_update_at).await;
        self.reconcile_reactions(&post.id, is_direct, msg).await;

        if let Err(e) = self
            .posts()
            .set_last_update_at_by_local(&post.id, msg.last_update_at.timestamp_micros())
            .await
        {
            warn!("unable to update post link metadata post_id={} error={}", post.id, e);
        }
        DISCARDED_REASON_NONE
    }

    /// Makes the local reactions of `post_id` match the remote message's.
    pub async fn reconcile_reactions(&self, post_id: &str, is_direct: bool, msg: &Message) {
        let current = match self.host().get_reactions(post_id).await {
            Ok(reactions) => reactions,
            Err(e) => {
                warn!("unable to get reactions post_id={} error={}", post_id, e);
                return;
            }
        };
        if current.is_empty() && msg.reactions.is_empty() {
            return;
        }

        let mut wanted: Vec<(String, String)> = Vec::new();
        for reaction in &msg.reactions {
            let Some(emoji_name) = self.emoji().to_local(&reaction.reaction) else {
                warn!("no emoji found for reaction reaction={}", reaction.reaction);
                continue;
            };
            match self.users().teams_to_local(&reaction.user_id).await {
                Ok(Some(user_id)) => {
                    let key = (user_id, emoji_name.to_string());
                    if !wanted.contains(&key) {
                        wanted.push(key);
                    }
                }
                Ok(None) => debug!("skipping reaction of unmapped user remote_user_id={}", reaction.user_id),
                Err(e) => warn!("unable to map reacting user error={}", e),
            }
        }

        let present: HashSet<(String, String)> = current
            .iter()
            .map(|r| (r.user_id.clone(), r.emoji_name.clone()))
            .collect();

        for reaction in &current {
            if wanted.contains(&(reaction.user_id.clone(), reaction.emoji_name.clone())) {
                continue;
            }
            let key = IgnoredHooks::reaction_key(post_id, &reaction.user_id, &reaction.emoji_name);
            self.ignored().ignore(key.clone());
            match self.host().remove_reaction(reaction).await {
                Ok(()) => self
                    .metrics()
                    .observe_reaction(REACTION_UNSET, SOURCE_MSTEAMS, is_direct),
                Err(e) => {
                    self.ignored().take(&key);
                    warn!("unable to remove reaction post_id={} error={}", post_id, e);
                }
            }
        }

        for (user_id, emoji_name) in wanted {
            if present.contains(&(user_id.clone(), emoji_name.clone())) {
                continue;
            }
            let key = IgnoredHooks::reaction_key(post_id, &user_id, &emoji_name);
            self.ignored().ignore(key.clone());
            let reaction = Reaction {
                user_id,
                post_id: post_id.to_string(),
                emoji_name,
                create_at: 0,
            };
            match self.host().add_reaction(&reaction).await {
                Ok(()) => self
                    .metrics()
                    .observe_reaction(REACTION_SET, SOURCE_MSTEAMS, is_direct),
                Err(e) => {
                    self.ignored().take(&key);
                    warn!("unable to add reaction post_id={} error={}", post_id, e);
                }
            }
        }
    }

    /// Deletes the local copy of a removed remote message.
    pub async fn mirror_deleted_message(&self, ids: &ActivityIds) -> &'static str {
        let message_id = if ids.reply_id.is_empty() {
            &ids.message_id
        } else {
            &ids.reply_id
        };
        let context_id = remote_context_id(&ids.chat_id, &ids.team_id, &ids.channel_id);
        let correspondence = match self.posts().get_by_remote(&context_id, message_id).await {
            Ok(Some(correspondence)) => correspondence,
            Ok(None) => return DISCARDED_REASON_OTHER,
            Err(e) => {
                error!("unable to get post correspondence message_id={} error={}", message_id, e);
                return DISCARDED_REASON_OTHER;
            }
        };

        let post_id = correspondence.local_post_id;
        let _guard = self.host().lock(&format!("post_mutex_{post_id}")).await;
        let key = IgnoredHooks::post_key(&post_id);
        self.ignored().ignore(key.clone());
        if let Err(e) = self.host().delete_post(&post_id).await {
            self.ignored().take(&key);
            error!("unable to delete post post_id={} error={}", post_id, e);
            return DISCARDED_REASON_OTHER;
        }
        if let Err(e) = self.posts().delete_by_local(&post_id).await {
            warn!("unable to delete post link post_id={} error={}", post_id, e);
        }

        self.metrics()
            .observe_message(ACTION_DELETED, SOURCE_MSTEAMS, ids.is_chat());
        DISCARDED_REASON_NONE
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration};

    use super::*;
    use crate::host::{ChannelType, Host};
    use crate::msteams::{ChatMember, Reaction as RemoteReaction};
    use crate::testing::TestBridge;

    fn chat(id: &str, members: &[&str], chat_type: ChatType) -> Chat {
        Chat {
            id: id.to_string(),
            members: members
                .iter()
                .map(|id| ChatMember {
                    user_id: id.to_string(),
                    ..ChatMember::default()
                })
                .collect(),
            chat_type,
            topic: String::new(),
        }
    }

    fn chat_message(id: &str, user_id: &str, text: &str) -> Message {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Message {
            id: id.to_string(),
            user_id: user_id.to_string(),
            chat_id: "chat1".to_string(),
            text: text.to_string(),
            create_at: at,
            last_update_at: at,
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn chat_messages_land_in_the_direct_channel() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;

        let msg = chat_message("m1", "ra", "hello");
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        let post = env.bridge.mirror_created_message(&msg, Some(&chat)).await.unwrap();

        assert_eq!(post.user_id, "a");
        assert_eq!(post.message, "hello");
        let channel = env.host.get_channel(&post.channel_id).await.unwrap();
        assert_eq!(channel.channel_type, ChannelType::Direct);
        let link = env.bridge.posts().get_by_remote("chat1", "m1").await.unwrap().unwrap();
        assert_eq!(link.local_post_id, post.id);
        assert_eq!(link.last_update_at, msg.last_update_at.timestamp_micros());
    }

    #[tokio::test]
    async fn unmapped_chat_members_leave_too_few_users() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        let msg = chat_message("m1", "ra", "hi");
        let chat = chat("chat1", &["ra", "stranger"], ChatType::OneOnOne);
        assert_eq!(
            env.bridge.mirror_created_message(&msg, Some(&chat)).await,
            Err(DISCARDED_REASON_OTHER)
        );
    }

    #[tokio::test]
    async fn inactive_senders_are_skipped() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let mut alice = env.host.get_user("a").await.unwrap();
        alice.delete_at = 1;
        env.host.add_user(alice);

        let msg = chat_message("m1", "ra", "hi");
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        assert_eq!(
            env.bridge.mirror_created_message(&msg, Some(&chat)).await,
            Err(DISCARDED_REASON_INACTIVE_USER)
        );
    }

    #[tokio::test]
    async fn edits_apply_once_and_never_go_backwards() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        let original = chat_message("m1", "ra", "v1");
        let post = env.bridge.mirror_created_message(&original, Some(&chat)).await.unwrap();

        assert_eq!(
            env.bridge.mirror_updated_message(&original, Some(&chat)).await,
            DISCARDED_REASON_ALREADY_APPLIED
        );

        let mut edited = chat_message("m1", "ra", "v2");
        edited.last_update_at = original.last_update_at + Duration::seconds(10);
        assert_eq!(
            env.bridge.mirror_updated_message(&edited, Some(&chat)).await,
            DISCARDED_REASON_NONE
        );
        assert_eq!(env.host.get_post(&post.id).await.unwrap().message, "v2");
        assert!(env.bridge.ignored().take(&IgnoredHooks::post_key(&post.id)));

        let mut stale = chat_message("m1", "ra", "stale");
        stale.last_update_at = original.last_update_at + Duration::seconds(5);
        assert_eq!(
            env.bridge.mirror_updated_message(&stale, Some(&chat)).await,
            DISCARDED_REASON_ALREADY_APPLIED
        );
        assert_eq!(env.host.get_post(&post.id).await.unwrap().message, "v2");

        let link = env.bridge.posts().get_by_local(&post.id).await.unwrap().unwrap();
        assert_eq!(link.last_update_at, edited.last_update_at.timestamp_micros());
    }

    #[tokio::test]
    async fn remote_edits_wait_for_the_post_mutex() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        let original = chat_message("m1", "ra", "v1");
        let post = env.bridge.mirror_created_message(&original, Some(&chat)).await.unwrap();
        let mut edited = chat_message("m1", "ra", "v2");
        edited.last_update_at = original.last_update_at + Duration::seconds(1);

        let guard = env.host.lock(&format!("post_mutex_{}", post.id)).await;
        let host = &env.host;
        let post_id = post.id.clone();
        let release = async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            assert_eq!(host.get_post(&post_id).await.unwrap().message, "v1");
            drop(guard);
        };
        let (outcome, ()) =
            tokio::join!(env.bridge.mirror_updated_message(&edited, Some(&chat)), release);

        assert_eq!(outcome, DISCARDED_REASON_NONE);
        assert_eq!(env.host.get_post(&post.id).await.unwrap().message, "v2");
    }

    #[tokio::test]
    async fn concurrent_edit_and_delete_leave_no_correspondence() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        let original = chat_message("m1", "ra", "v1");
        let post = env.bridge.mirror_created_message(&original, Some(&chat)).await.unwrap();
        let mut edited = chat_message("m1", "ra", "v2");
        edited.last_update_at = original.last_update_at + Duration::seconds(1);
        let ids = ActivityIds {
            chat_id: "chat1".to_string(),
            message_id: "m1".to_string(),
            ..ActivityIds::default()
        };

        let (_, deleted) = tokio::join!(
            env.bridge.mirror_updated_message(&edited, Some(&chat)),
            env.bridge.mirror_deleted_message(&ids)
        );

        assert_eq!(deleted, DISCARDED_REASON_NONE);
        assert_eq!(env.host.state().deleted, vec![post.id.clone()]);
        assert!(env.bridge.posts().get_by_local(&post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_updates_release_the_sentinel() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let chat = chat("chat1", &["ra", "rb"], ChatType::OneOnOne);
        let original = chat_message("m1", "ra", "v1");
        let post = env.bridge.mirror_created_message(&original, Some(&chat)).await.unwrap();

        env.host.state().fail_update_post = true;
        let mut edited = chat_message("m1", "ra", "v2");
        edited.last_update_at = original.last_update_at + Duration::seconds(1);
        assert_eq!(
            env.bridge.mirror_updated_message(&edited, Some(&chat)).await,
            DISCARDED_REASON_OTHER
        );
        assert!(!env.bridge.ignored().take(&IgnoredHooks::post_key(&post.id)));
    }

    #[tokio::test]
    async fn reactions_follow_the_remote_message() {
        let env = TestBridge::new().await;
        env.link_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        env.host.insert_post(Post {
            id: "p1".to_string(),
            ..Post::new("c1", "a", "hi")
        });
        env.host
            .add_reaction(&Reaction {
                user_id: "a".to_string(),
                post_id: "p1".to_string(),
                emoji_name: "smile".to_string(),
                create_at: 0,
            })
            .await
            .unwrap();

        let mut msg = chat_message("m1", "ra", "hi");
        msg.reactions = vec![
            RemoteReaction {
                user_id: "rb".to_string(),
                reaction: "like".to_string(),
            },
            RemoteReaction {
                user_id: "stranger".to_string(),
                reaction: "like".to_string(),
            },
        ];
        env.bridge.reconcile_reactions("p1", true, &msg).await;

        let reactions = env.host.get_reactions("p1").await.unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].user_id, "b");
        assert_eq!(reactions[0].emoji_name, "+1");
        assert!(env.bridge.ignored().take(&IgnoredHooks::reaction_key("p1", "b", "+1")));
        assert!(env.bridge.ignored().take(&IgnoredHooks::reaction_key("p1", "a", "smile")));
    }

    #[tokio::test]
    async fn deletes_remove_post_and_correspondence() {
        let env = TestBridge::new().await;
        env.host.insert_post(Post {
            id: "p1".to_string(),
            ..Post::new("c1", "a", "hi")
        });
        env.bridge
            .posts()
            .link_posts(&PostCorrespondence::new("p1", "R", "TC", 1))
            .await
            .unwrap();

        let ids = ActivityIds {
            team_id: "T".to_string(),
            channel_id: "C".to_string(),
            message_id: "M".to_string(),
            reply_id: "R".to_string(),
            ..ActivityIds::default()
        };
        assert_eq!(env.bridge.mirror_deleted_message(&ids).await, DISCARDED_REASON_NONE);
        assert_eq!(env.host.state().deleted, vec!["p1".to_string()]);
        assert!(env.bridge.posts().get_by_local("p1").await.unwrap().is_none());
        assert_eq!(env.bridge.mirror_deleted_message(&ids).await, DISCARDED_REASON_OTHER);
    }

    #[tokio::test]
    async fn bot_author_matches_local_or_linked_identity() {
        let env = TestBridge::new().await;
        let mut msg = chat_message("m1", "bot-user", "hi");
        assert!(env.bridge.is_bot_author(&msg).await);

        msg.user_id = "remote-bot".to_string();
        assert!(!env.bridge.is_bot_author(&msg).await);
        env.bridge
            .users()
            .set_user_info("bot-user", "remote-bot", None)
            .await
            .unwrap();
        assert!(env.bridge.is_bot_author(&msg).await);
    }
}
