//! Process-wide TTL+LRU caches (§5, §8, §9) for tracker-fetched data. One
//! `moka::sync::Cache` instance per kind (task/tag/section), each
//! linearizable per key with no torn reads under concurrent workers.

use std::time::Duration;

use moka::sync::Cache;

const DEFAULT_MAX_CAPACITY: u64 = 100;
const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Thin wrapper around `moka::sync::Cache<String, V>` pinned to this
/// codebase's default sizing (100 entries, 2 minute TTL per §5) so the
/// defaults live in one place instead of being repeated at each call site.
#[derive(Clone)]
pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    inner: Cache<String, V>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_MAX_CAPACITY, DEFAULT_TTL)
    }

    pub fn with_capacity_and_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key)
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.inner.insert(key.into(), value);
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Forces pending TTL/size eviction to run synchronously; moka normally
    /// does this lazily, which makes timing-sensitive tests flaky otherwise.
    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three process-wide caches named in §5/§9: per-task, per-tag,
/// per-section. Exposed together so callers (mainly the triage processor)
/// get one init/teardown unit instead of three loose globals.
pub struct TrackerCaches {
    pub tasks: TtlCache<crate::types::ProjectTask>,
    pub tags: TtlCache<Vec<String>>,
    pub sections: TtlCache<String>,
}

impl TrackerCaches {
    pub fn new() -> Self {
        Self {
            tasks: TtlCache::new(),
            tags: TtlCache::new(),
            sections: TtlCache::new(),
        }
    }
}

impl Default for TrackerCaches {
    fn default() -> Self {
        Self::new()
    }
}
