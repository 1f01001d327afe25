//! Retrieval planner with a lightweight in-memory result cache.
//!
//! Entries are keyed by the serialized request and the store's cache epoch,
//! so any committed ingestion or approval makes older entries unreachable.
//! Capacity is enforced LRU-style and entries expire after a TTL.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::IsgResult;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    CacheHit,
    CacheMiss,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Cache key for `payload` under the store state `epoch`.
pub fn cache_key(tool_name: &str, epoch: i64, payload: &impl Serialize) -> IsgResult<String> {
    let normalized = serde_json::to_string(payload)?;
    Ok(format!("{tool_name}:{epoch}:{normalized}"))
}

pub struct QueryPlanner<V> {
    max_entries: usize,
    ttl: Duration,
    cache: Mutex<IndexMap<String, CacheEntry<V>>>,
    counters: Mutex<(u64, u64)>,
}

impl<V: Clone> QueryPlanner<V> {
    pub fn new(max_entries: usize, ttl_seconds: f64) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl: Duration::from_secs_f64(ttl_seconds.max(0.1)),
            cache: Mutex::new(IndexMap::new()),
            counters: Mutex::new((0, 0)),
        }
    }

    fn evict_expired(&self, cache: &mut IndexMap<String, CacheEntry<V>>) {
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
    }

    fn evict_over_capacity(&self, cache: &mut IndexMap<String, CacheEntry<V>>) {
        while cache.len() > self.max_entries {
            cache.shift_remove_index(0);
        }
    }

    /// Return the cached value for `key` or compute, store and return it.
    /// Errors are never cached.
    pub fn get_or_compute<F>(&self, key: String, compute: F) -> IsgResult<(V, CacheMode)>
    where
        F: FnOnce() -> IsgResult<V>,
    {
        {
            let mut cache = self.cache.lock();
            self.evict_expired(&mut cache);
            if let Some(index) = cache.get_index_of(&key) {
                // Move to the back: most recently used.
                let last = cache.len() - 1;
                cache.move_index(index, last);
                if let Some((_, entry)) = cache.get_index(last) {
                    let value = entry.value.clone();
                    self.counters.lock().0 += 1;
                    return Ok((value, CacheMode::CacheHit));
                }
            }
        }

        let value = compute()?;
        self.counters.lock().1 += 1;
        let mut cache = self.cache.lock();
        cache.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.evict_over_capacity(&mut cache);
        Ok((value, CacheMode::CacheMiss))
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let (hits, misses) = *self.counters.lock();
        CacheStats {
            entries: self.cache.lock().len(),
            max_entries: self.max_entries,
            hits,
            misses,
        }
    }
}
