//! Bounded, expiring cache of unwrapped project KEKs.
//!
//! Entries live at most `ttl` after insertion and the cache never holds more
//! than `limit` entries; inserting past the limit evicts the oldest. A zero
//! TTL or limit disables caching. Values are dropped (and so zeroized, for
//! key types that wipe themselves) on eviction; an optional hook runs first,
//! which the PKCS#11 plugin uses to destroy session key objects.

use crate::observability::MetricsRecorder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

type EvictHook<K> = Arc<dyn Fn(K) + Send + Sync>;

struct CacheEntry<K> {
    value: K,
    inserted_at: Instant,
    // breaks ties between equal instants
    seq: u64,
}

pub struct ProjectKekCache<K: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<K>>>,
    ttl: Duration,
    limit: usize,
    on_evict: Option<EvictHook<K>>,
    next_seq: AtomicU64,
    metrics: MetricsRecorder,
}

impl<K: Clone> std::fmt::Debug for ProjectKekCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectKekCache")
            .field("ttl", &self.ttl)
            .field("limit", &self.limit)
            .field("len", &self.len())
            .finish()
    }
}

impl<K: Clone> ProjectKekCache<K> {
    pub fn new(ttl: Duration, limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            limit,
            on_evict: None,
            next_seq: AtomicU64::new(0),
            metrics: MetricsRecorder::new(),
        }
    }

    /// Run `hook` on every value leaving the cache.
    pub fn with_evict_hook(mut self, hook: impl Fn(K) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(hook));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0 && !self.ttl.is_zero()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<K>>> {
        // entries are plain data, so a panic elsewhere leaves them consistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict(&self, evicted: Vec<K>, reason: &'static str) {
        if evicted.is_empty() {
            return;
        }
        self.metrics.record_kek_cache_eviction(reason, evicted.len());
        debug!(count = evicted.len(), reason, "Evicted project KEKs from cache");
        if let Some(hook) = &self.on_evict {
            for value in evicted {
                hook(value);
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<K> {
        let (result, expired) = {
            let mut entries = self.lock();
            match entries.get(label).map(|entry| entry.inserted_at.elapsed() < self.ttl) {
                Some(true) => (entries.get(label).map(|entry| entry.value.clone()), None),
                Some(false) => (None, entries.remove(label).map(|e| e.value)),
                None => (None, None),
            }
        };

        if let Some(expired) = expired {
            self.evict(vec![expired], "expired");
        }
        match &result {
            Some(_) => self.metrics.record_kek_cache_hit(),
            None => self.metrics.record_kek_cache_miss(),
        }
        result
    }

    /// Cache `value`, purging expired entries and then the oldest ones until
    /// the limit holds.
    pub fn insert(&self, label: impl Into<String>, value: K) {
        if !self.is_enabled() {
            if let Some(hook) = &self.on_evict {
                hook(value);
            }
            return;
        }

        let (expired, overflow, size) = {
            let mut entries = self.lock();
            let expired = drain_expired(&mut entries, self.ttl);

            let mut replaced = entries
                .insert(
                    label.into(),
                    CacheEntry {
                        value,
                        inserted_at: Instant::now(),
                        seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    },
                )
                .map(|e| vec![e.value])
                .unwrap_or_default();

            while entries.len() > self.limit {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
                    .map(|(label, _)| label.clone());
                match oldest.and_then(|label| entries.remove(&label)) {
                    Some(entry) => replaced.push(entry.value),
                    None => break,
                }
            }
            (expired, replaced, entries.len())
        };

        self.evict(expired, "expired");
        self.evict(overflow, "capacity");
        self.metrics.set_kek_cache_size(size);
    }

    pub fn invalidate(&self, label: &str) {
        let removed = self.lock().remove(label).map(|e| e.value);
        if let Some(value) = removed {
            self.evict(vec![value], "invalidated");
        }
    }

    pub fn clear(&self) {
        let all: Vec<K> = self.lock().drain().map(|(_, e)| e.value).collect();
        self.evict(all, "cleared");
        self.metrics.set_kek_cache_size(0);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn drain_expired<K>(entries: &mut HashMap<String, CacheEntry<K>>, ttl: Duration) -> Vec<K> {
    let labels: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.inserted_at.elapsed() >= ttl)
        .map(|(label, _)| label.clone())
        .collect();
    labels.into_iter().filter_map(|label| entries.remove(&label)).map(|e| e.value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hit_and_miss() {
        let cache = ProjectKekCache::new(Duration::from_secs(60), 10);
        assert!(cache.get("project-KEK-1").is_none());
        cache.insert("project-KEK-1", vec![1u8; 32]);
        assert_eq!(cache.get("project-KEK-1"), Some(vec![1u8; 32]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let cache = ProjectKekCache::new(Duration::from_millis(20), 10);
        cache.insert("a", 1u32);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_evicts_oldest_past_limit() {
        let cache = ProjectKekCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1u32);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn zero_limit_or_ttl_disables_caching() {
        let no_room = ProjectKekCache::new(Duration::from_secs(60), 0);
        no_room.insert("a", 1u32);
        assert!(no_room.get("a").is_none());

        let no_time = ProjectKekCache::new(Duration::ZERO, 10);
        no_time.insert("a", 1u32);
        assert!(no_time.get("a").is_none());
        assert!(!no_time.is_enabled());
    }

    #[test]
    fn evict_hook_sees_every_departure() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let cache = ProjectKekCache::new(Duration::from_secs(60), 1).with_evict_hook(move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        cache.invalidate("b");
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
        cache.insert("c", 3);
        cache.clear();
        assert_eq!(evicted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn insert_drops_expired_entries() {
        let cache = ProjectKekCache::new(Duration::from_millis(30), 10);
        cache.insert("old", 1u32);
        std::thread::sleep(Duration::from_millis(50));
        cache.insert("new", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("new"), Some(2));
    }

    proptest! {
        #[test]
        fn never_exceeds_limit(
            limit in 1usize..8,
            labels in proptest::collection::vec(0u8..16, 0..64)
        ) {
            let cache = ProjectKekCache::new(Duration::from_secs(60), limit);
            for (i, label) in labels.iter().enumerate() {
                cache.insert(format!("project-KEK-{}", label), i);
                prop_assert!(cache.len() <= limit);
            }
            if let Some(last) = labels.last() {
                let label = format!("project-KEK-{}", last);
                prop_assert_eq!(cache.get(&label), Some(labels.len() - 1));
            }
        }
    }
}
