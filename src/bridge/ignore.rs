use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::TimedCache;

pub const IGNORE_TTL: Duration = Duration::from_secs(30);

/// Sentinels set before the bridge itself mutates a local post, so the
/// host hook fired by that mutation is skipped instead of echoed back.
/// Unconsumed sentinels expire after [`IGNORE_TTL`].
pub struct IgnoredHooks {
    entries: Mutex<TimedCache<String, ()>>,
}

impl Default for IgnoredHooks {
    fn default() -> Self {
        Self::new(IGNORE_TTL)
    }
}

impl IgnoredHooks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(TimedCache::new(ttl)),
        }
    }

    pub fn post_key(post_id: &str) -> String {
        format!("post_{post_id}")
    }

    pub fn reaction_key(post_id: &str, user_id: &str, emoji_name: &str) -> String {
        format!("{post_id}_{user_id}_{emoji_name}")
    }

    pub fn ignore(&self, key: String) {
        self.entries.lock().insert(key, ());
    }

    /// Consumes the sentinel. True means the hook must be skipped.
    pub fn take(&self, key: &str) -> bool {
        self.entries.lock().take(&key.to_string()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
