use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

const NAMESPACE: &str = "msteams_connect";

pub const ACTION_CREATED: &str = "created";
pub const ACTION_UPDATED: &str = "updated";
pub const ACTION_DELETED: &str = "deleted";

pub const REACTION_SET: &str = "set";
pub const REACTION_UNSET: &str = "unset";

pub const SOURCE_MSTEAMS: &str = "msteams";
pub const SOURCE_MATTERMOST: &str = "mattermost";

pub const SUBSCRIPTION_CONNECTED: &str = "connected";
pub const SUBSCRIPTION_REFRESHED: &str = "refreshed";
pub const SUBSCRIPTION_RECONNECTED: &str = "reconnected";

pub const DISCARDED_REASON_NONE: &str = "";
pub const DISCARDED_REASON_EXPIRED_SUBSCRIPTION: &str = "expired_subscription";
pub const DISCARDED_REASON_INVALID_WEBHOOK_SECRET: &str = "invalid_webhook_secret";
pub const DISCARDED_REASON_INVALID_CHANGE_TYPE: &str = "invalid_change_type";
pub const DISCARDED_REASON_UNABLE_TO_GET_TEAMS_DATA: &str = "unable_to_get_teams_data";
pub const DISCARDED_REASON_NOTIFICATIONS_ONLY: &str = "notifications_only";
pub const DISCARDED_REASON_IS_BOT_USER: &str = "is_bot_user";
pub const DISCARDED_REASON_DUPLICATED_POST: &str = "duplicated_post";
pub const DISCARDED_REASON_ALREADY_APPLIED: &str = "already_applied_change";
pub const DISCARDED_REASON_DIRECT_MESSAGES_DISABLED: &str = "direct_messages_disabled";
pub const DISCARDED_REASON_LINKED_CHANNELS_DISABLED: &str = "linked_channels_disabled";
pub const DISCARDED_REASON_CHANNEL_NOT_LINKED: &str = "channel_not_linked";
pub const DISCARDED_REASON_INACTIVE_USER: &str = "inactive_user";
pub const DISCARDED_REASON_FILE_LIMIT_REACHED: &str = "file_limit_reached";
pub const DISCARDED_REASON_MAX_FILE_SIZE_EXCEEDED: &str = "max_file_size_exceeded";
pub const DISCARDED_REASON_RESOLUTION_TOO_HIGH: &str = "resolution_too_high";
pub const DISCARDED_REASON_EMPTY_FILE_ID: &str = "empty_file_id";
pub const DISCARDED_REASON_NOT_USER_EVENT: &str = "not_user_event";
pub const DISCARDED_REASON_OTHER: &str = "other";
pub const DISCARDED_REASON_UNKNOWN_LIFECYCLE_EVENT: &str = "unknown_lifecycle_event";
pub const DISCARDED_REASON_UNUSED_SUBSCRIPTION: &str = "unused_subscription";
pub const DISCARDED_REASON_FAILED_TO_REFRESH: &str = "failed_to_refresh";

pub const COUNTER_CHANGE_EVENTS: &str = "events_change_events_total";
pub const COUNTER_LIFECYCLE_EVENTS: &str = "events_lifecycle_events_total";
pub const COUNTER_MESSAGES: &str = "events_messages_total";
pub const COUNTER_REACTIONS: &str = "events_reactions_total";
pub const COUNTER_FILES: &str = "events_files_total";
pub const COUNTER_SUBSCRIPTIONS: &str = "events_subscriptions_total";
pub const COUNTER_NOTIFICATIONS: &str = "events_notifications_total";
pub const COUNTER_QUEUE_REJECTED: &str = "events_change_event_queue_rejected_total";
pub const COUNTER_WORKER_FAILURES: &str = "system_worker_failures_total";

const COUNTER_HELP: &[(&str, &str)] = &[
    (COUNTER_CHANGE_EVENTS, "Change events received from the remote webhook."),
    (COUNTER_LIFECYCLE_EVENTS, "Subscription lifecycle events received."),
    (COUNTER_MESSAGES, "Messages mirrored between platforms."),
    (COUNTER_REACTIONS, "Reactions mirrored between platforms."),
    (COUNTER_FILES, "File attachments handled."),
    (COUNTER_SUBSCRIPTIONS, "Subscription transitions."),
    (COUNTER_NOTIFICATIONS, "Chat notifications delivered."),
    (COUNTER_QUEUE_REJECTED, "Change events rejected because the queue was full."),
    (COUNTER_WORKER_FAILURES, "Unexpected background worker failures."),
];

type SeriesKey = (&'static str, Vec<(&'static str, String)>);

/// In-process registry of the engine's counters, rendered in the
/// Prometheus text format.
pub struct Metrics {
    started_at: Instant,
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    queue_capacity: AtomicI64,
    queue_length: AtomicI64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bool_label(value: bool) -> String {
    value.to_string()
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Mutex::new(BTreeMap::new()),
            queue_capacity: AtomicI64::new(0),
            queue_length: AtomicI64::new(0),
        }
    }

    fn add(&self, name: &'static str, labels: Vec<(&'static str, String)>, value: u64) {
        #[cfg(feature = "prometheus")]
        {
            let exported: Vec<metrics::Label> = labels
                .iter()
                .map(|(k, v)| metrics::Label::new(*k, v.clone()))
                .collect();
            metrics::counter!(format!("{NAMESPACE}_{name}"), exported).increment(value);
        }
        *self.counters.lock().entry((name, labels)).or_insert(0) += value;
    }

    pub fn observe_change_event(&self, change_type: &str, discarded_reason: &str) {
        self.add(
            COUNTER_CHANGE_EVENTS,
            vec![
                ("change_type", change_type.to_string()),
                ("discarded_reason", discarded_reason.to_string()),
            ],
            1,
        );
    }

    pub fn observe_lifecycle_event(&self, event_type: &str, discarded_reason: &str) {
        self.add(
            COUNTER_LIFECYCLE_EVENTS,
            vec![
                ("event_type", event_type.to_string()),
                ("discarded_reason", discarded_reason.to_string()),
            ],
            1,
        );
    }

    pub fn observe_message(&self, action: &str, source: &str, is_direct: bool) {
        self.add(
            COUNTER_MESSAGES,
            vec![
                ("action", action.to_string()),
                ("source", source.to_string()),
                ("is_direct", bool_label(is_direct)),
            ],
            1,
        );
    }

    pub fn observe_reaction(&self, action: &str, source: &str, is_direct: bool) {
        self.add(
            COUNTER_REACTIONS,
            vec![
                ("action", action.to_string()),
                ("source", source.to_string()),
                ("is_direct", bool_label(is_direct)),
            ],
            1,
        );
    }

    pub fn observe_file(&self, action: &str, source: &str, discarded_reason: &str, is_direct: bool) {
        self.observe_files(action, source, discarded_reason, is_direct, 1);
    }

    pub fn observe_files(
        &self,
        action: &str,
        source: &str,
        discarded_reason: &str,
        is_direct: bool,
        count: u64,
    ) {
        if count == 0 {
            return;
        }
        self.add(
            COUNTER_FILES,
            vec![
                ("action", action.to_string()),
                ("source", source.to_string()),
                ("discarded_reason", discarded_reason.to_string()),
                ("is_direct", bool_label(is_direct)),
            ],
            count,
        );
    }

    pub fn observe_subscription(&self, action: &str) {
        self.add(COUNTER_SUBSCRIPTIONS, vec![("action", action.to_string())], 1);
    }

    pub fn observe_notification(&self, is_group_chat: bool, has_attachments: bool) {
        self.add(
            COUNTER_NOTIFICATIONS,
            vec![
                ("is_group_chat", bool_label(is_group_chat)),
                ("has_attachments", bool_label(has_attachments)),
            ],
            1,
        );
    }

    pub fn increment_change_event_queue_rejected(&self) {
        self.add(COUNTER_QUEUE_REJECTED, Vec::new(), 1);
    }

    pub fn observe_worker_failure(&self, worker: &str) {
        self.add(COUNTER_WORKER_FAILURES, vec![("worker", worker.to_string())], 1);
    }

    pub fn set_change_event_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.store(capacity as i64, Ordering::Relaxed);
        #[cfg(feature = "prometheus")]
        metrics::gauge!(format!("{NAMESPACE}_events_change_event_queue_capacity"))
            .set(capacity as f64);
    }

    pub fn set_change_event_queue_length(&self, length: usize) {
        self.queue_length.store(length as i64, Ordering::Relaxed);
        #[cfg(feature = "prometheus")]
        metrics::gauge!(format!("{NAMESPACE}_events_change_event_queue_length"))
            .set(length as f64);
    }

    pub fn change_event_queue_length(&self) -> i64 {
        self.queue_length.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Current value of one series. Labels must be given in declaration order.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .iter()
            .find(|((n, l), _)| {
                *n == name
                    && l.len() == labels.len()
                    && l.iter().zip(labels).all(|((k1, v1), (k2, v2))| k1 == k2 && v1 == v2)
            })
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// Sum of every series of `name` whose labels include all of `labels`.
    pub fn counter_total(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((n, l), _)| {
                *n == name
                    && labels
                        .iter()
                        .all(|(k, v)| l.iter().any(|(k2, v2)| k2 == k && v2 == v))
            })
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn render(&self) -> String {
        let counters = self.counters.lock();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP {NAMESPACE}_uptime_seconds Seconds since start.");
        let _ = writeln!(out, "# TYPE {NAMESPACE}_uptime_seconds gauge");
        let _ = writeln!(out, "{NAMESPACE}_uptime_seconds {}", self.uptime_secs());

        for (family, help) in COUNTER_HELP {
            let _ = writeln!(out, "# HELP {NAMESPACE}_{family} {help}");
            let _ = writeln!(out, "# TYPE {NAMESPACE}_{family} counter");
            for ((name, labels), value) in counters.iter() {
                if name != family {
                    continue;
                }
                let _ = writeln!(out, "{NAMESPACE}_{name}{} {value}", format_labels(labels));
            }
        }

        for (name, value) in [
            (
                "events_change_event_queue_capacity",
                self.queue_capacity.load(Ordering::Relaxed),
            ),
            (
                "events_change_event_queue_length",
                self.queue_length.load(Ordering::Relaxed),
            ),
        ] {
            let _ = writeln!(out, "# TYPE {NAMESPACE}_{name} gauge");
            let _ = writeln!(out, "{NAMESPACE}_{name} {value}");
        }
        out
    }
}

fn format_labels(labels: &[(&'static str, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", inner.join(","))
}
