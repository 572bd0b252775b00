use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use super::{BridgeCore, remote_context_id};
use crate::db::{SubscriptionKind, SubscriptionRecord};
use crate::metrics::{
    DISCARDED_REASON_DIRECT_MESSAGES_DISABLED, DISCARDED_REASON_DUPLICATED_POST,
    DISCARDED_REASON_EXPIRED_SUBSCRIPTION, DISCARDED_REASON_FAILED_TO_REFRESH,
    DISCARDED_REASON_INVALID_CHANGE_TYPE, DISCARDED_REASON_INVALID_WEBHOOK_SECRET,
    DISCARDED_REASON_IS_BOT_USER, DISCARDED_REASON_LINKED_CHANNELS_DISABLED,
    DISCARDED_REASON_NONE, DISCARDED_REASON_NOT_USER_EVENT, DISCARDED_REASON_NOTIFICATIONS_ONLY,
    DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA, DISCARDED_REASON_UNKNOWN_LIFECYCLE_EVENT,
    DISCARDED_REASON_UNUSED_SUBSCRIPTION, SUBSCRIPTION_REFRESHED,
};
use crate::msteams::{Activity, ActivityIds, Chat, Message, parse_resource};

pub const LIFECYCLE_REAUTHORIZATION_REQUIRED: &str = "reauthorizationRequired";

const CHANGE_CREATED: &str = "created";
const CHANGE_UPDATED: &str = "updated";
const CHANGE_DELETED: &str = "deleted";

const WORKER_ACTIVITY: &str = "activity_handler";
const WORKER_LAST_ACTIVITY: &str = "last_activity_flusher";

/// Subscriptions idle for longer than this are not flushed.
const LAST_ACTIVITY_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("activity queue is full")]
    QueueFull,

    #[error("activity handler is stopped")]
    Closed,
}

/// Compares secrets without returning early on the first differing byte.
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Bounded queue of change notifications drained by a fixed worker pool.
pub struct ActivityHandler {
    core: BridgeCore,
    sender: mpsc::Sender<Activity>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Activity>>>,
    last_activity: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivityHandler {
    pub fn new(core: BridgeCore) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(core.config().activity.queue_size.max(1));
        Arc::new(Self {
            core,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            last_activity: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn core(&self) -> &BridgeCore {
        &self.core
    }

    pub fn is_quitting(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawns the workers and the last-activity flusher.
    pub fn start(self: &Arc<Self>) {
        let activity = &self.core.config().activity;
        self.core
            .metrics()
            .set_change_event_queue_capacity(self.sender.max_capacity());

        let mut tasks = self.tasks.lock();
        for worker in 0..activity.workers {
            let handler = self.clone();
            tasks.push(supervise(
                WORKER_ACTIVITY,
                self.core.metrics().clone(),
                self.shutdown.clone(),
                move || {
                    let handler = handler.clone();
                    async move { handler.run_worker().await }
                        .instrument(info_span!("activity_worker", worker))
                },
            ));
        }

        let handler = self.clone();
        let interval = Duration::from_secs(activity.flush_interval_secs.max(1));
        tasks.push(supervise(
            WORKER_LAST_ACTIVITY,
            self.core.metrics().clone(),
            self.shutdown.clone(),
            move || {
                let handler = handler.clone();
                async move { handler.run_flusher(interval).await }
            },
        ));
        info!("activity handler started workers={}", activity.workers);
    }

    /// Signals every worker to quit and waits for them.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("activity worker did not stop cleanly error={}", e);
            }
        }
        info!("activity handler stopped");
    }

    /// Queues an activity without waiting. A full queue rejects it.
    pub fn handle(&self, activity: Activity) -> Result<(), EnqueueError> {
        match self.sender.try_send(activity) {
            Ok(()) => {
                self.observe_queue_length();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(activity)) => {
                self.core.metrics().increment_change_event_queue_rejected();
                warn!(
                    "activity queue is full subscription_id={} change_type={}",
                    activity.subscription_id, activity.change_type
                );
                Err(EnqueueError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    fn observe_queue_length(&self) {
        let length = self.sender.max_capacity() - self.sender.capacity();
        self.core.metrics().set_change_event_queue_length(length);
    }

    async fn run_worker(&self) {
        loop {
            let activity = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    activity = receiver.recv() => activity,
                }
            };
            let Some(activity) = activity else {
                return;
            };
            self.observe_queue_length();
            self.handle_activity(activity).await;
        }
    }

    async fn run_flusher(&self, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.flush_last_activity().await;
                    return;
                }
                _ = tokio::time::sleep(interval) => self.flush_last_activity().await,
            }
        }
    }

    /// Persists `last_activity_at` of every subscription heard from recently.
    pub async fn flush_last_activity(&self) {
        let now = Utc::now();
        let recent: Vec<(String, DateTime<Utc>)> = {
            let mut map = self.last_activity.lock();
            map.retain(|_, at| now - *at <= LAST_ACTIVITY_WINDOW);
            map.iter().map(|(id, at)| (id.clone(), *at)).collect()
        };
        for (subscription_id, at) in recent {
            if let Err(e) = self
                .core
                .subscriptions()
                .update_subscription_last_activity_at(&subscription_id, at)
                .await
            {
                warn!(
                    "unable to store subscription last activity subscription_id={} error={}",
                    subscription_id, e
                );
            }
        }
    }

    async fn subscription(&self, subscription_id: &str) -> Option<SubscriptionRecord> {
        match self.core.subscriptions().get_subscription(subscription_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("unable to get subscription subscription_id={} error={}", subscription_id, e);
                None
            }
        }
    }

    fn secret_is_valid(&self, activity: &Activity, subscription: Option<&SubscriptionRecord>) -> bool {
        let expected = subscription
            .map(|s| s.secret.as_str())
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(|| self.core.config().webhook_secret());
        secrets_match(&activity.client_state, expected)
    }

    /// A channel subscription is only valid while its link exists.
    async fn channel_subscription_is_live(&self, subscription: Option<&SubscriptionRecord>) -> bool {
        let Some(subscription) = subscription else {
            return false;
        };
        if subscription.kind != SubscriptionKind::Channel {
            return false;
        }
        let team_id = subscription.remote_team_id.as_deref().unwrap_or_default();
        let channel_id = subscription.remote_channel_id.as_deref().unwrap_or_default();
        match self
            .core
            .links()
            .get_link_by_remote_channel_id(team_id, channel_id)
            .await
        {
            Ok(link) => link.is_some(),
            Err(e) => {
                warn!("unable to get the channel link error={}", e);
                false
            }
        }
    }

    /// Processes one queued activity and records its outcome.
    pub async fn handle_activity(&self, activity: Activity) {
        if activity.is_lifecycle_event() {
            self.handle_lifecycle_event(&activity).await;
            return;
        }

        let ids = parse_resource(&activity.resource);
        let reason = self.dispatch(&activity, &ids).await;
        if reason != DISCARDED_REASON_NONE {
            debug!(
                "discarded change event reason={} change_type={} subscription_id={}",
                reason, activity.change_type, activity.subscription_id
            );
        }
        self.core
            .metrics()
            .observe_change_event(&activity.change_type, reason);
    }

    async fn dispatch(&self, activity: &Activity, ids: &ActivityIds) -> &'static str {
        let subscription = self.subscription(&activity.subscription_id).await;

        if !ids.is_chat() && !self.channel_subscription_is_live(subscription.as_ref()).await {
            if let Err(e) = self
                .core
                .subscriptions()
                .delete_subscription(&activity.subscription_id)
                .await
            {
                debug!("unable to delete orphaned subscription error={}", e);
            }
            error!(
                "discarded reason={} subscription_id={}",
                DISCARDED_REASON_EXPIRED_SUBSCRIPTION, activity.subscription_id
            );
            return DISCARDED_REASON_EXPIRED_SUBSCRIPTION;
        }

        if !self.secret_is_valid(activity, subscription.as_ref()) {
            error!(
                "discarded reason={} subscription_id={}",
                DISCARDED_REASON_INVALID_WEBHOOK_SECRET, activity.subscription_id
            );
            return DISCARDED_REASON_INVALID_WEBHOOK_SECRET;
        }

        self.last_activity
            .lock()
            .insert(activity.subscription_id.clone(), Utc::now());

        match activity.change_type.as_str() {
            CHANGE_CREATED => self.handle_created(ids, activity.content.as_ref()).await,
            CHANGE_UPDATED => self.handle_updated(ids, activity.content.as_ref()).await,
            CHANGE_DELETED => self.handle_deleted(ids).await,
            other => {
                warn!("unsupported change type change_type={}", other);
                DISCARDED_REASON_INVALID_CHANGE_TYPE
            }
        }
    }

    /// Resolves the message and filters out events that are not user
    /// messages or that the bridge itself authored.
    async fn resolve_user_message(
        &self,
        ids: &ActivityIds,
        content: Option<&serde_json::Value>,
    ) -> Result<(Message, Option<Chat>), &'static str> {
        let (msg, chat) = match self.core.resolve_message(ids, content).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("unable to get original message error={}", e);
                return Err(DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA);
            }
        };
        let Some(msg) = msg else {
            debug!("no connected chat member can read the message chat_id={}", ids.chat_id);
            return Err(DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA);
        };
        if msg.user_id.is_empty() {
            return Err(DISCARDED_REASON_NOT_USER_EVENT);
        }
        if self.core.is_bot_author(&msg).await {
            self.core.update_last_received_change(msg.last_update_at).await;
            return Err(DISCARDED_REASON_IS_BOT_USER);
        }
        Ok((msg, chat))
    }

    async fn handle_created(
        &self,
        ids: &ActivityIds,
        content: Option<&serde_json::Value>,
    ) -> &'static str {
        let (msg, chat) = match self.resolve_user_message(ids, content).await {
            Ok(resolved) => resolved,
            Err(reason) => return reason,
        };

        let context_id = remote_context_id(&msg.chat_id, &msg.team_id, &msg.channel_id);
        // Held until the correspondence is linked so redelivered events see it.
        let _guard = self
            .core
            .host()
            .lock(&format!("post_mutex_{context_id}{}", msg.id))
            .await;
        if let Ok(Some(_)) = self.core.posts().get_by_remote(&context_id, &msg.id).await {
            self.core.update_last_received_change(msg.last_update_at).await;
            return DISCARDED_REASON_DUPLICATED_POST;
        }

        let mirror = self.core.mirroring_enabled(chat.is_some());
        let notify = chat.is_some() && self.core.config().sync.sync_chats;
        if !mirror && !notify {
            return if chat.is_some() {
                DISCARDED_REASON_DIRECT_MESSAGES_DISABLED
            } else {
                DISCARDED_REASON_LINKED_CHANNELS_DISABLED
            };
        }

        let mut reason = DISCARDED_REASON_NONE;
        let mut mirrored = None;
        if mirror {
            match self.core.mirror_created_message(&msg, chat.as_ref()).await {
                Ok(post) => mirrored = Some(post),
                Err(discarded) => reason = discarded,
            }
        } else {
            self.core.update_last_received_change(msg.last_update_at).await;
        }

        if let Some(chat) = chat.as_ref().filter(|_| notify) {
            self.core
                .handle_created_activity_notification(&msg, chat, mirrored.as_ref())
                .await;
        }
        reason
    }

    async fn handle_updated(
        &self,
        ids: &ActivityIds,
        content: Option<&serde_json::Value>,
    ) -> &'static str {
        if !self.core.mirroring_enabled(ids.is_chat()) {
            return DISCARDED_REASON_NOTIFICATIONS_ONLY;
        }
        match self.resolve_user_message(ids, content).await {
            Ok((msg, chat)) => self.core.mirror_updated_message(&msg, chat.as_ref()).await,
            Err(reason) => reason,
        }
    }

    async fn handle_deleted(&self, ids: &ActivityIds) -> &'static str {
        if !self.core.mirroring_enabled(ids.is_chat()) {
            return DISCARDED_REASON_NOTIFICATIONS_ONLY;
        }
        self.core.mirror_deleted_message(ids).await
    }

    async fn handle_lifecycle_event(&self, activity: &Activity) {
        let event = activity.lifecycle_event.as_str();
        let reason = self.lifecycle_event_outcome(activity).await;
        self.core.metrics().observe_lifecycle_event(event, reason);
    }

    async fn lifecycle_event_outcome(&self, activity: &Activity) -> &'static str {
        let subscription = self.subscription(&activity.subscription_id).await;
        if !self.secret_is_valid(activity, subscription.as_ref()) {
            error!(
                "discarded lifecycle event reason={} subscription_id={}",
                DISCARDED_REASON_INVALID_WEBHOOK_SECRET, activity.subscription_id
            );
            return DISCARDED_REASON_INVALID_WEBHOOK_SECRET;
        }
        if activity.lifecycle_event != LIFECYCLE_REAUTHORIZATION_REQUIRED {
            warn!("ignoring unknown lifecycle event lifecycle_event={}", activity.lifecycle_event);
            return DISCARDED_REASON_UNKNOWN_LIFECYCLE_EVENT;
        }
        if subscription.is_none() {
            warn!(
                "ignoring lifecycle event for unused subscription subscription_id={}",
                activity.subscription_id
            );
            return DISCARDED_REASON_UNUSED_SUBSCRIPTION;
        }

        let expires_on = match self
            .core
            .clients()
            .app_client()
            .refresh_subscription(&activity.subscription_id)
            .await
        {
            Ok(expires_on) => expires_on,
            Err(e) => {
                warn!(
                    "unable to refresh the subscription subscription_id={} error={}",
                    activity.subscription_id, e
                );
                return DISCARDED_REASON_FAILED_TO_REFRESH;
            }
        };
        info!(
            "refreshed subscription subscription_id={} expires_on={}",
            activity.subscription_id, expires_on
        );
        self.core.metrics().observe_subscription(SUBSCRIPTION_REFRESHED);
        if let Err(e) = self
            .core
            .subscriptions()
            .update_subscription_expires_on(&activity.subscription_id, expires_on)
            .await
        {
            warn!(
                "unable to store the subscription expiry subscription_id={} error={}",
                activity.subscription_id, e
            );
        }
        DISCARDED_REASON_NONE
    }
}

/// Runs the task built by `make` and relaunches it after a panic unless
/// shutdown has started. A normal return ends supervision.
pub fn supervise<F, Fut>(
    name: &'static str,
    metrics: Arc<crate::metrics::Metrics>,
    shutdown: CancellationToken,
    make: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make()).await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    error!("worker failed unexpectedly worker={} error={}", name, e);
                    metrics.observe_worker_failure(name);
                    if shutdown.is_cancelled() {
                        return;
                    }
                    warn!("relaunching worker worker={}", name);
                }
                Err(e) => {
                    debug!("worker cancelled worker={} error={}", name, e);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::bridge::automute::{PREF_NOTIFICATIONS, PREF_VALUE_ON};
    use crate::db::{ChannelLink, PostCorrespondence};
    use crate::host::ChannelType;
    use crate::metrics::{
        COUNTER_CHANGE_EVENTS, COUNTER_LIFECYCLE_EVENTS, COUNTER_QUEUE_REJECTED,
        COUNTER_SUBSCRIPTIONS, COUNTER_WORKER_FAILURES, Metrics,
    };
    use crate::msteams::{ChatMember, ChatType, Subscription};
    use crate::testing::TestBridge;

    const RESOURCE: &str = "teams('T')/channels('C')/messages('M')";

    fn envelope(change_type: &str, client_state: &str, resource: &str) -> Activity {
        Activity {
            subscription_id: "S".to_string(),
            change_type: change_type.to_string(),
            client_state: client_state.to_string(),
            resource: resource.to_string(),
            ..Activity::default()
        }
    }

    fn change_events(env: &TestBridge, change_type: &str, reason: &str) -> u64 {
        env.metrics.counter_value(
            COUNTER_CHANGE_EVENTS,
            &[("change_type", change_type), ("discarded_reason", reason)],
        )
    }

    /// Linked channel `L` mirrors remote `T/C`, watched by subscription `S`.
    async fn linked_env() -> TestBridge {
        let env = TestBridge::with_config(|config| config.sync.sync_linked_channels = true).await;
        env.host.add_channel("L", "team", ChannelType::Open, &["u"]);
        env.link_user("u", "user", "U").await;
        env.bridge
            .links()
            .store_channel_link(&ChannelLink {
                local_team_id: "team".to_string(),
                local_channel_id: "L".to_string(),
                remote_team_id: "T".to_string(),
                remote_channel_id: "C".to_string(),
                creator_user_id: "u".to_string(),
            })
            .await
            .unwrap();
        env.bridge
            .subscriptions()
            .save_channel_subscription(&SubscriptionRecord::channel(
                "S",
                "T",
                "C",
                "webhooksecret",
                Utc::now() + ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();
        env.remote.add_channel_message(Message {
            id: "M".to_string(),
            user_id: "U".to_string(),
            text: "hi".to_string(),
            team_id: "T".to_string(),
            channel_id: "C".to_string(),
            ..Message::default()
        });
        env
    }

    #[tokio::test]
    async fn channel_message_is_mirrored_into_the_linked_channel() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());

        handler
            .handle_activity(envelope("created", "webhooksecret", RESOURCE))
            .await;

        let posts = env.host.created_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel_id, "L");
        assert_eq!(posts[0].user_id, "u");
        assert_eq!(posts[0].message, "hi");
        let link = env.bridge.posts().get_by_remote("TC", "M").await.unwrap().unwrap();
        assert_eq!(link.local_post_id, posts[0].id);
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_NONE), 1);
    }

    #[tokio::test]
    async fn wrong_secret_touches_nothing() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());

        handler
            .handle_activity(envelope("created", "wrong", RESOURCE))
            .await;

        assert!(env.remote.calls().is_empty());
        assert!(env.host.created_posts().is_empty());
        assert!(env.bridge.posts().get_by_remote("TC", "M").await.unwrap().is_none());
        let subscription = env.bridge.subscriptions().get_subscription("S").await.unwrap().unwrap();
        assert_eq!(subscription.last_activity_at, None);
        assert_eq!(
            change_events(&env, "created", DISCARDED_REASON_INVALID_WEBHOOK_SECRET),
            1
        );
    }

    #[tokio::test]
    async fn orphaned_channel_subscriptions_are_dropped() {
        let env = linked_env().await;
        env.bridge.links().delete_link_by_channel_id("L").await.unwrap();
        env.bridge
            .subscriptions()
            .save_channel_subscription(&SubscriptionRecord::channel(
                "S",
                "T",
                "C",
                "webhooksecret",
                Utc::now() + ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();
        let handler = ActivityHandler::new(env.bridge.clone());

        handler
            .handle_activity(envelope("created", "webhooksecret", RESOURCE))
            .await;

        assert!(env.bridge.subscriptions().get_subscription("S").await.unwrap().is_none());
        assert!(env.remote.calls().is_empty());
        assert_eq!(
            change_events(&env, "created", DISCARDED_REASON_EXPIRED_SUBSCRIPTION),
            1
        );
    }

    #[tokio::test]
    async fn bot_and_duplicate_messages_are_discarded() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());
        env.remote.add_channel_message(Message {
            id: "B".to_string(),
            user_id: "bot-user".to_string(),
            team_id: "T".to_string(),
            channel_id: "C".to_string(),
            ..Message::default()
        });
        handler
            .handle_activity(envelope(
                "created",
                "webhooksecret",
                "teams('T')/channels('C')/messages('B')",
            ))
            .await;
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_IS_BOT_USER), 1);

        env.bridge
            .posts()
            .link_posts(&PostCorrespondence::new("p0", "M", "TC", 0))
            .await
            .unwrap();
        handler
            .handle_activity(envelope("created", "webhooksecret", RESOURCE))
            .await;
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_DUPLICATED_POST), 1);
        assert!(env.host.created_posts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_redelivery_creates_one_post() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());

        let first = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .handle_activity(envelope("created", "webhooksecret", RESOURCE))
                    .await
            }
        });
        let second = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .handle_activity(envelope("created", "webhooksecret", RESOURCE))
                    .await
            }
        });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(env.host.created_posts().len(), 1);
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_NONE), 1);
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_DUPLICATED_POST), 1);
    }

    #[tokio::test]
    async fn remote_edit_round_trips_into_the_local_post() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());
        handler
            .handle_activity(envelope("created", "webhooksecret", RESOURCE))
            .await;
        let post_id = env.host.created_posts()[0].id.clone();

        let edited_at = Utc::now() + ChronoDuration::seconds(30);
        env.remote.add_channel_message(Message {
            id: "M".to_string(),
            user_id: "U".to_string(),
            text: "hi again".to_string(),
            team_id: "T".to_string(),
            channel_id: "C".to_string(),
            last_update_at: edited_at,
            ..Message::default()
        });
        handler
            .handle_activity(envelope("updated", "webhooksecret", RESOURCE))
            .await;
        handler
            .handle_activity(envelope("updated", "webhooksecret", RESOURCE))
            .await;

        let state = env.host.state();
        assert_eq!(state.posts[&post_id].message, "hi again");
        assert_eq!(state.updated.len(), 1);
        drop(state);
        let link = env.bridge.posts().get_by_local(&post_id).await.unwrap().unwrap();
        assert_eq!(link.last_update_at, edited_at.timestamp_micros());
        assert_eq!(change_events(&env, "updated", DISCARDED_REASON_NONE), 1);
        assert_eq!(
            change_events(&env, "updated", crate::metrics::DISCARDED_REASON_ALREADY_APPLIED),
            1
        );

        handler
            .handle_activity(envelope("deleted", "webhooksecret", RESOURCE))
            .await;
        assert_eq!(env.host.state().deleted, vec![post_id]);
    }

    #[tokio::test]
    async fn updates_without_mirroring_are_notifications_only() {
        let env = TestBridge::new().await;
        let handler = ActivityHandler::new(env.bridge.clone());
        handler
            .handle_activity(envelope(
                "updated",
                "webhooksecret",
                "chats('chat1')/messages('m1')",
            ))
            .await;
        handler
            .handle_activity(envelope("moved", "webhooksecret", "chats('chat1')/messages('m1')"))
            .await;
        assert_eq!(change_events(&env, "updated", DISCARDED_REASON_NOTIFICATIONS_ONLY), 1);
        assert_eq!(change_events(&env, "moved", DISCARDED_REASON_INVALID_CHANGE_TYPE), 1);
        assert!(env.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn chat_messages_notify_opted_in_members() {
        let env = TestBridge::new().await;
        env.connect_user("a", "alice", "ra").await;
        env.link_user("b", "bob", "rb").await;
        let category = env.bridge.config().preference_category();
        env.host.set_preference("b", &category, PREF_NOTIFICATIONS, PREF_VALUE_ON);
        env.bridge
            .subscriptions()
            .save_global_subscription(&SubscriptionRecord::global(
                "S",
                "webhooksecret",
                Utc::now() + ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();
        env.remote.add_chat(Chat {
            id: "chat1".to_string(),
            members: ["ra", "rb"]
                .iter()
                .map(|id| ChatMember {
                    user_id: id.to_string(),
                    ..ChatMember::default()
                })
                .collect(),
            chat_type: ChatType::OneOnOne,
            topic: String::new(),
        });
        env.remote.add_chat_message(Message {
            id: "m1".to_string(),
            user_id: "ra".to_string(),
            user_display_name: "Alice".to_string(),
            chat_id: "chat1".to_string(),
            text: "lunch?".to_string(),
            ..Message::default()
        });
        let handler = ActivityHandler::new(env.bridge.clone());

        handler
            .handle_activity(envelope("created", "webhooksecret", "chats('chat1')/messages('m1')"))
            .await;

        let posts = env.host.created_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].user_id, "bot-user");
        assert!(posts[0].message.ends_with("> lunch?"));
        assert_eq!(change_events(&env, "created", DISCARDED_REASON_NONE), 1);
    }

    #[tokio::test]
    async fn reauthorization_refreshes_known_subscriptions() {
        let env = TestBridge::new().await;
        let old_expiry = Utc::now() + ChronoDuration::minutes(1);
        env.bridge
            .subscriptions()
            .save_global_subscription(&SubscriptionRecord::global("S", "webhooksecret", old_expiry))
            .await
            .unwrap();
        env.remote.add_subscription(Subscription {
            id: "S".to_string(),
            kind: String::new(),
            team_id: String::new(),
            channel_id: String::new(),
            resource: "chats/getAllMessages".to_string(),
            expires_on: old_expiry,
            notification_url: "https://sync.example.com/".to_string(),
        });
        let handler = ActivityHandler::new(env.bridge.clone());

        let mut event = envelope("", "webhooksecret", "");
        event.lifecycle_event = LIFECYCLE_REAUTHORIZATION_REQUIRED.to_string();
        handler.handle_activity(event.clone()).await;

        let stored = env.bridge.subscriptions().get_subscription("S").await.unwrap().unwrap();
        assert!(stored.expires_on > old_expiry);
        let lifecycle = |reason: &str| {
            env.metrics.counter_value(
                COUNTER_LIFECYCLE_EVENTS,
                &[("event_type", LIFECYCLE_REAUTHORIZATION_REQUIRED), ("discarded_reason", reason)],
            )
        };
        assert_eq!(lifecycle(DISCARDED_REASON_NONE), 1);
        assert_eq!(
            env.metrics.counter_value(COUNTER_SUBSCRIPTIONS, &[("action", "refreshed")]),
            1
        );

        event.subscription_id = "unknown".to_string();
        handler.handle_activity(event.clone()).await;
        assert_eq!(lifecycle(DISCARDED_REASON_UNUSED_SUBSCRIPTION), 1);

        event.client_state = "wrong".to_string();
        handler.handle_activity(event).await;
        assert_eq!(lifecycle(DISCARDED_REASON_INVALID_WEBHOOK_SECRET), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_activities() {
        let env = TestBridge::with_config(|config| config.activity.queue_size = 1).await;
        let handler = ActivityHandler::new(env.bridge.clone());

        assert_eq!(handler.handle(envelope("created", "x", RESOURCE)), Ok(()));
        assert_eq!(
            handler.handle(envelope("created", "x", RESOURCE)),
            Err(EnqueueError::QueueFull)
        );
        assert_eq!(env.metrics.counter_value(COUNTER_QUEUE_REJECTED, &[]), 1);
        assert_eq!(env.metrics.change_event_queue_length(), 1);
    }

    #[tokio::test]
    async fn workers_drain_the_queue_until_stopped() {
        let env = TestBridge::with_config(|config| config.activity.workers = 4).await;
        let handler = ActivityHandler::new(env.bridge.clone());
        handler.start();

        for _ in 0..3 {
            handler
                .handle(envelope("updated", "webhooksecret", "chats('c')/messages('m')"))
                .unwrap();
        }
        for _ in 0..100 {
            if change_events(&env, "updated", DISCARDED_REASON_NOTIFICATIONS_ONLY) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(change_events(&env, "updated", DISCARDED_REASON_NOTIFICATIONS_ONLY), 3);

        handler.stop().await;
        assert!(handler.is_quitting());
        assert_eq!(env.metrics.change_event_queue_length(), 0);
    }

    #[tokio::test]
    async fn last_activity_is_flushed_for_recent_subscriptions() {
        let env = linked_env().await;
        let handler = ActivityHandler::new(env.bridge.clone());
        handler
            .handle_activity(envelope("deleted", "webhooksecret", RESOURCE))
            .await;
        handler.flush_last_activity().await;

        let subscription = env.bridge.subscriptions().get_subscription("S").await.unwrap().unwrap();
        assert!(subscription.last_activity_at.is_some());
    }

    #[tokio::test]
    async fn supervisor_relaunches_after_a_panic() {
        let metrics = Arc::new(Metrics::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = supervise("test", metrics.clone(), CancellationToken::new(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            metrics.counter_value(COUNTER_WORKER_FAILURES, &[("worker", "test")]),
            1
        );
    }

    async fn always_panics() {
        panic!("always fails");
    }

    #[tokio::test]
    async fn supervisor_stops_relaunching_on_shutdown() {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let task = supervise("test", metrics.clone(), shutdown, always_panics);
        task.await.unwrap();
        assert_eq!(
            metrics.counter_value(COUNTER_WORKER_FAILURES, &[("worker", "test")]),
            1
        );
    }

    #[test]
    fn secrets_compare_whole_values() {
        assert!(secrets_match("webhooksecret", "webhooksecret"));
        assert!(!secrets_match("webhooksecreT", "webhooksecret"));
        assert!(!secrets_match("webhook", "webhooksecret"));
    }
}
