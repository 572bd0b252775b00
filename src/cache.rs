use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct TimedValue<V> {
    value: V,
    expires_at: Instant,
}

impl<V> TimedValue<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Map whose entries disappear `ttl` after insertion.
pub struct TimedCache<K, V> {
    map: HashMap<K, TimedValue<V>>,
    ttl: Duration,
}

impl<K, V> TimedCache<K, V>
where
    K: Hash + Eq,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let now = Instant::now();
        self.map
            .get(key)
            .filter(|tv| tv.is_live(now))
            .map(|tv| &tv.value)
    }

    /// Inserts and sweeps expired entries so abandoned keys cannot pile up.
    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.map.retain(|_, tv| tv.is_live(now));
        self.map.insert(
            key,
            TimedValue {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Removes the entry, returning it only while it is still live.
    pub fn take(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.map
            .remove(key)
            .filter(|tv| tv.is_live(now))
            .map(|tv| tv.value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn cleanup_expired(&mut self) {
        let now = Instant::now();
        self.map.retain(|_, tv| tv.is_live(now));
    }
}

pub struct AsyncTimedCache<K, V> {
    inner: RwLock<TimedCache<K, V>>,
}

impl<K, V> AsyncTimedCache<K, V>
where
    K: Hash + Eq,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(TimedCache::new(ttl)),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.write().await.insert(key, value);
    }

    pub async fn take(&self, key: &K) -> Option<V> {
        self.inner.write().await.take(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
