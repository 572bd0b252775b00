use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BridgeCore;
use super::activity::supervise;
use crate::db::{SubscriptionKind, SubscriptionRecord};
use crate::metrics::{SUBSCRIPTION_CONNECTED, SUBSCRIPTION_RECONNECTED, SUBSCRIPTION_REFRESHED};
use crate::msteams::{ALL_CHATS_RESOURCE, RemoteClient, Subscription};
use crate::utils::SyncError;

const WORKER_MONITOR: &str = "subscription_monitor";

/// Subscriptions closer than this to their expiry get refreshed.
const REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// Periodically reconciles the remote subscription inventory with the
/// local catalog.
pub struct SubscriptionMonitor {
    core: BridgeCore,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionMonitor {
    pub fn new(core: BridgeCore) -> Arc<Self> {
        Arc::new(Self {
            core,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.core.config().monitor.interval_secs.max(1));
        let monitor = self.clone();
        let task = supervise(
            WORKER_MONITOR,
            self.core.metrics().clone(),
            self.shutdown.clone(),
            move || {
                let monitor = monitor.clone();
                async move { monitor.run(interval).await }
            },
        );
        *self.task.lock() = Some(task);
        info!("subscription monitor started interval_secs={}", interval.as_secs());
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("subscription monitor did not stop cleanly error={}", e);
            }
        }
    }

    async fn run(&self, interval: Duration) {
        loop {
            if let Err(e) = self.check().await {
                error!("subscription check failed error={}", e);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Runs one reconciliation pass. Only a failure to list either side
    /// aborts the pass; per-subscription failures are logged.
    pub async fn check(&self) -> Result<(), SyncError> {
        let app = self.core.clients().app_client();
        let base_url = self.core.config().base_url();

        let remote: HashMap<String, Subscription> = app
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.notification_url.starts_with(base_url))
            .map(|s| (s.id.clone(), s))
            .collect();
        let remote_global = remote
            .values()
            .find(|s| s.resource.contains(ALL_CHATS_RESOURCE))
            .cloned();

        let subscriptions = self.core.subscriptions();
        let local_global = subscriptions.list_global_subscriptions().await?.into_iter().next();
        let local_channels = subscriptions.list_channel_subscriptions().await?;
        let links = self.core.links().list_channel_links().await?;

        self.check_global(app.as_ref(), &remote, local_global, remote_global)
            .await;

        let linked: HashSet<(String, String)> = links
            .iter()
            .map(|l| (l.remote_team_id.clone(), l.remote_channel_id.clone()))
            .collect();
        let mut covered = HashSet::new();
        for record in local_channels {
            let key = (
                record.remote_team_id.clone().unwrap_or_default(),
                record.remote_channel_id.clone().unwrap_or_default(),
            );
            if !linked.contains(&key) {
                self.delete_orphan(app.as_ref(), &record).await;
                continue;
            }
            covered.insert(key);
            if remote.contains_key(&record.subscription_id) {
                self.refresh_or_recreate(app.as_ref(), &record).await;
            } else {
                warn!(
                    "channel subscription is missing remotely subscription_id={} team_id={} channel_id={}",
                    record.subscription_id, record_team(&record), record_channel(&record)
                );
                report_expired(&record, Utc::now());
                self.replace(app.as_ref(), &record, false).await;
            }
        }

        for (team_id, channel_id) in linked.difference(&covered) {
            match self.subscribe_channel(app.as_ref(), team_id, channel_id).await {
                Ok(record) => {
                    info!(
                        "created channel subscription subscription_id={} team_id={} channel_id={}",
                        record.subscription_id, team_id, channel_id
                    );
                    self.core.metrics().observe_subscription(SUBSCRIPTION_CONNECTED);
                }
                Err(e) => warn!(
                    "unable to subscribe to channel team_id={} channel_id={} error={}",
                    team_id, channel_id, e
                ),
            }
        }
        Ok(())
    }

    async fn check_global(
        &self,
        app: &dyn RemoteClient,
        remote: &HashMap<String, Subscription>,
        local: Option<SubscriptionRecord>,
        remote_global: Option<Subscription>,
    ) {
        match (local, remote_global) {
            (None, None) => match self.subscribe_global(app).await {
                Ok(record) => {
                    info!("created chats subscription subscription_id={}", record.subscription_id);
                    self.core.metrics().observe_subscription(SUBSCRIPTION_CONNECTED);
                }
                Err(e) => error!("unable to create the chats subscription error={}", e),
            },
            (None, Some(existing)) => {
                let record = SubscriptionRecord::global(
                    existing.id.clone(),
                    self.core.config().webhook_secret(),
                    existing.expires_on,
                );
                match self.core.subscriptions().save_global_subscription(&record).await {
                    Ok(()) => info!("adopted chats subscription subscription_id={}", existing.id),
                    Err(e) => warn!(
                        "unable to adopt the chats subscription subscription_id={} error={}",
                        existing.id, e
                    ),
                }
            }
            (Some(record), _) if !remote.contains_key(&record.subscription_id) => {
                warn!(
                    "chats subscription is missing remotely subscription_id={}",
                    record.subscription_id
                );
                report_expired(&record, Utc::now());
                self.replace(app, &record, false).await;
            }
            (Some(record), _) => self.refresh_or_recreate(app, &record).await,
        }
    }

    async fn refresh_or_recreate(&self, app: &dyn RemoteClient, record: &SubscriptionRecord) {
        let now = Utc::now();
        if record.expires_on - now > REFRESH_WINDOW {
            debug!("subscription is fresh subscription_id={}", record.subscription_id);
            return;
        }
        report_expired(record, now);

        match app.refresh_subscription(&record.subscription_id).await {
            Ok(expires_on) => {
                if let Err(e) = self
                    .core
                    .subscriptions()
                    .update_subscription_expires_on(&record.subscription_id, expires_on)
                    .await
                {
                    warn!(
                        "unable to store the subscription expiry subscription_id={} error={}",
                        record.subscription_id, e
                    );
                    return;
                }
                debug!(
                    "refreshed subscription subscription_id={} expires_on={}",
                    record.subscription_id, expires_on
                );
                self.core.metrics().observe_subscription(SUBSCRIPTION_REFRESHED);
            }
            Err(e) => {
                warn!(
                    "unable to refresh subscription, recreating subscription_id={} error={}",
                    record.subscription_id, e
                );
                self.replace(app, record, true).await;
            }
        }
    }

    /// Creates a successor for `record` and drops the stale local row.
    async fn replace(&self, app: &dyn RemoteClient, record: &SubscriptionRecord, delete_remote: bool) {
        if delete_remote {
            if let Err(e) = app.delete_subscription(&record.subscription_id).await {
                debug!(
                    "unable to delete the remote subscription subscription_id={} error={}",
                    record.subscription_id, e
                );
            }
        }

        let created = match record.kind {
            SubscriptionKind::AllChats => self.subscribe_global(app).await,
            SubscriptionKind::Channel => {
                self.subscribe_channel(app, record_team(record), record_channel(record))
                    .await
            }
        };
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                error!(
                    "unable to recreate subscription subscription_id={} error={}",
                    record.subscription_id, e
                );
                return;
            }
        };

        if created.subscription_id != record.subscription_id {
            if let Err(e) = self
                .core
                .subscriptions()
                .delete_subscription(&record.subscription_id)
                .await
            {
                warn!(
                    "unable to delete the stale subscription subscription_id={} error={}",
                    record.subscription_id, e
                );
            }
        }
        info!(
            "recreated subscription old_subscription_id={} subscription_id={}",
            record.subscription_id, created.subscription_id
        );
        self.core.metrics().observe_subscription(SUBSCRIPTION_RECONNECTED);
    }

    async fn delete_orphan(&self, app: &dyn RemoteClient, record: &SubscriptionRecord) {
        info!(
            "deleting subscription of an unlinked channel subscription_id={}",
            record.subscription_id
        );
        if let Err(e) = app.delete_subscription(&record.subscription_id).await {
            debug!(
                "unable to delete the remote subscription subscription_id={} error={}",
                record.subscription_id, e
            );
        }
        if let Err(e) = self
            .core
            .subscriptions()
            .delete_subscription(&record.subscription_id)
            .await
        {
            warn!(
                "unable to delete the subscription subscription_id={} error={}",
                record.subscription_id, e
            );
        }
    }

    async fn subscribe_global(&self, app: &dyn RemoteClient) -> Result<SubscriptionRecord, SyncError> {
        let config = self.core.config();
        let created = app
            .subscribe_to_chats(config.base_url(), config.webhook_secret(), !config.msteams.evaluation_api)
            .await?;
        let record = SubscriptionRecord::global(created.id, config.webhook_secret(), created.expires_on);
        self.core.subscriptions().save_global_subscription(&record).await?;
        Ok(record)
    }

    async fn subscribe_channel(
        &self,
        app: &dyn RemoteClient,
        team_id: &str,
        channel_id: &str,
    ) -> Result<SubscriptionRecord, SyncError> {
        let config = self.core.config();
        let created = app
            .subscribe_to_channel(team_id, channel_id, config.base_url(), config.webhook_secret())
            .await?;
        let record = SubscriptionRecord::channel(
            created.id,
            team_id,
            channel_id,
            config.webhook_secret(),
            created.expires_on,
        );
        self.core.subscriptions().save_channel_subscription(&record).await?;
        Ok(record)
    }
}

/// Logs subscriptions that lapsed before being renewed.
fn report_expired(record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
    if !record.is_expired(now) {
        return false;
    }
    error!(
        "subscription expired, events may have been lost subscription_id={} expires_on={}",
        record.subscription_id, record.expires_on
    );
    true
}

fn record_team(record: &SubscriptionRecord) -> &str {
    record.remote_team_id.as_deref().unwrap_or_default()
}

fn record_channel(record: &SubscriptionRecord) -> &str {
    record.remote_channel_id.as_deref().unwrap_or_default()
}
