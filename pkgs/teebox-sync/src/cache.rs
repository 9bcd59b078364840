//! Bounded cache with per-entry expiry and an explicit open/close lifecycle
//!
//! Storage, capacity and wall-clock expiry come from [`moka::sync::Cache`].
//! Each entry also remembers when it was inserted so lookups honour the
//! caller's clock. A closed cache holds nothing and ignores inserts until it
//! is opened again.

use moka::sync::Cache;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    entries: Cache<K, (V, Instant)>,
    ttl: Duration,
    open: bool,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A closed cache; call [`TtlCache::open`] before use
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity.max(1) as u64)
                .time_to_live(ttl)
                .build(),
            ttl,
            open: false,
        }
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    /// Drop every entry and stop accepting new ones
    pub fn close(&mut self) {
        self.entries.invalidate_all();
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns false when the cache is closed
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> bool {
        if !self.open {
            return false;
        }
        self.entries.insert(key, (value, now));
        true
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.entries
            .get(key)
            .filter(|(_, inserted_at)| !self.is_expired(*inserted_at, now))
            .map(|(value, _)| value)
    }

    pub fn contains(&self, key: &K, now: Instant) -> bool {
        self.get(key, now).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    /// Drop entries expired by `now`, returning how many were removed
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, (_, at))| self.is_expired(*at, now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.entries.invalidate(key.as_ref());
        }
        if !expired.is_empty() {
            debug!("Purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Live entries after pending evictions have been applied
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) >= self.ttl
    }
}
