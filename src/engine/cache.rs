// Colony Memory — Cache Layer
// Four independent namespaces in front of the store, each an LRU with its
// own TTL and entry ceiling:
//
//   knowledge    get-by-id and metadata query results
//   history      thread reads and caller timelines
//   analytics    insights views
//   similarity   ranked similarity search results
//
// Entries are derived views only. Writers invalidate by subject prefix before
// acknowledging, and a miss is never an error. Expired entries are treated
// as misses by `get` but stay readable through `get_stale` until the sweeper
// drops them, so read fallbacks can still serve them.

use crate::atoms::types::{
    HistoryRecord, Insights, KnowledgeEntry, ReadScope, ScoredEntry,
};
use crate::engine::config::{CacheConfig, NamespaceConfig};
use log::{debug, info};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

// ── Namespaces + values ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Knowledge,
    History,
    Analytics,
    Similarity,
}

impl Namespace {
    pub const ALL: [Namespace; 4] =
        [Namespace::Knowledge, Namespace::History, Namespace::Analytics, Namespace::Similarity];

    fn index(self) -> usize {
        match self {
            Namespace::Knowledge => 0,
            Namespace::History => 1,
            Namespace::Analytics => 2,
            Namespace::Similarity => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Knowledge => "knowledge",
            Namespace::History => "history",
            Namespace::Analytics => "analytics",
            Namespace::Similarity => "similarity",
        }
    }
}

/// Cached payloads. Arc-wrapped so a hit is a pointer copy.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Entry(Arc<KnowledgeEntry>),
    Entries(Arc<Vec<KnowledgeEntry>>),
    Ranked(Arc<Vec<ScoredEntry>>),
    Records(Arc<Vec<HistoryRecord>>),
    Insights(Arc<Insights>),
}

#[derive(Debug, Clone, Copy)]
pub struct NamespaceSettings {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl From<&NamespaceConfig> for NamespaceSettings {
    fn from(c: &NamespaceConfig) -> Self {
        NamespaceSettings { ttl: c.ttl(), max_entries: c.max_entries }
    }
}

// ── Per-namespace store ────────────────────────────────────────────────────

struct Slot {
    value: CacheValue,
    inserted_at: Instant,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

struct Shelf {
    entries: Mutex<LruCache<String, Slot>>,
    ttl: Duration,
    capacity: usize,
    counters: Counters,
    // Bumped by every invalidation, under the entries lock.
    generation: AtomicU64,
}

impl Shelf {
    fn new(settings: NamespaceSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Shelf {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: settings.ttl,
            capacity: capacity.get(),
            counters: Counters::default(),
            generation: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceStats {
    pub namespace: Namespace,
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

// ── Cache layer ────────────────────────────────────────────────────────────

pub struct CacheLayer {
    shelves: [Shelf; 4],
    sweep_interval: Duration,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_settings(
            [
                (&config.knowledge).into(),
                (&config.history).into(),
                (&config.analytics).into(),
                (&config.similarity).into(),
            ],
            Duration::from_secs(config.sweep_interval_secs.max(1)),
        )
    }

    /// Settings ordered knowledge, history, analytics, similarity.
    pub fn with_settings(settings: [NamespaceSettings; 4], sweep_interval: Duration) -> Self {
        CacheLayer { shelves: settings.map(Shelf::new), sweep_interval }
    }

    fn shelf(&self, ns: Namespace) -> &Shelf {
        &self.shelves[ns.index()]
    }

    /// Fresh value or miss. Expired entries count as misses.
    pub fn get(&self, ns: Namespace, key: &str) -> Option<CacheValue> {
        let shelf = self.shelf(ns);
        let mut entries = shelf.entries.lock();
        let fresh = entries.peek(key).map(|slot| slot.inserted_at.elapsed() < shelf.ttl);
        match fresh {
            Some(true) => {
                shelf.counters.hits.fetch_add(1, Ordering::Relaxed);
                entries.get(key).map(|slot| slot.value.clone())
            }
            _ => {
                shelf.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Any value still held for `key`, expired or not. Used only by read
    /// fallbacks after the backing component failed.
    pub fn get_stale(&self, ns: Namespace, key: &str) -> Option<CacheValue> {
        let shelf = self.shelf(ns);
        let value = shelf.entries.lock().peek(key).map(|slot| slot.value.clone());
        if value.is_some() {
            shelf.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Insert or replace. Concurrent writers to one key: last write wins.
    pub fn put(&self, ns: Namespace, key: impl Into<String>, value: CacheValue) {
        let key = key.into();
        let shelf = self.shelf(ns);
        let evicted = shelf
            .entries
            .lock()
            .push(key.clone(), Slot { value, inserted_at: Instant::now() });
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                shelf.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot taken before a backing-store read; pass it to
    /// `put_if_current` so a result fetched before a write cannot land
    /// after that write's invalidation.
    pub fn generation(&self, ns: Namespace) -> u64 {
        self.shelf(ns).generation.load(Ordering::Acquire)
    }

    /// `put` unless the namespace was invalidated since `generation`.
    pub fn put_if_current(&self, ns: Namespace, key: impl Into<String>, value: CacheValue, generation: u64) -> bool {
        let key = key.into();
        let shelf = self.shelf(ns);
        let mut entries = shelf.entries.lock();
        if shelf.generation.load(Ordering::Acquire) != generation {
            debug!("[memory::cache] Skipped {} put for '{}': invalidated mid-read", ns.as_str(), key);
            return false;
        }
        if let Some((old_key, _)) = entries.push(key.clone(), Slot { value, inserted_at: Instant::now() }) {
            if old_key != key {
                shelf.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    pub fn invalidate(&self, ns: Namespace, key: &str) -> bool {
        let shelf = self.shelf(ns);
        let mut entries = shelf.entries.lock();
        shelf.generation.fetch_add(1, Ordering::AcqRel);
        let removed = entries.pop(key).is_some();
        if removed {
            shelf.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every key starting with `prefix`. Returns how many were removed.
    pub fn invalidate_prefix(&self, ns: Namespace, prefix: &str) -> usize {
        let shelf = self.shelf(ns);
        let mut entries = shelf.entries.lock();
        shelf.generation.fetch_add(1, Ordering::AcqRel);
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        shelf.counters.invalidations.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    pub fn clear(&self, ns: Namespace) -> usize {
        let shelf = self.shelf(ns);
        let mut entries = shelf.entries.lock();
        shelf.generation.fetch_add(1, Ordering::AcqRel);
        let n = entries.len();
        entries.clear();
        shelf.counters.invalidations.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Remove expired entries from every namespace.
    pub fn sweep(&self) -> usize {
        let mut total = 0;
        for shelf in &self.shelves {
            let mut entries = shelf.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, slot)| slot.inserted_at.elapsed() >= shelf.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            shelf.counters.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
            total += expired.len();
        }
        if total > 0 {
            debug!("[memory::cache] Swept {} expired entries", total);
        }
        total
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        info!("[memory::cache] Sweeper running every {}s", period.as_secs());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep();
            }
        })
    }

    pub fn stats(&self) -> Vec<NamespaceStats> {
        Namespace::ALL
            .iter()
            .map(|&ns| {
                let shelf = self.shelf(ns);
                let c = &shelf.counters;
                let hits = c.hits.load(Ordering::Relaxed);
                let misses = c.misses.load(Ordering::Relaxed);
                let lookups = hits + misses;
                NamespaceStats {
                    namespace: ns,
                    size: shelf.entries.lock().len(),
                    capacity: shelf.capacity,
                    ttl_secs: shelf.ttl.as_secs(),
                    hits,
                    misses,
                    stale_hits: c.stale_hits.load(Ordering::Relaxed),
                    evictions: c.evictions.load(Ordering::Relaxed),
                    expirations: c.expirations.load(Ordering::Relaxed),
                    invalidations: c.invalidations.load(Ordering::Relaxed),
                    hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
                }
            })
            .collect()
    }
}

// ── Keys ───────────────────────────────────────────────────────────────────
// Deterministic functions of (operation, normalized arguments). Every key
// starts with its subject so writers can invalidate by prefix.

pub mod keys {
    use super::*;
    use crate::atoms::types::{InsightsSubject, KnowledgeFilter};

    fn digest(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.finalize().iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }

    fn filter_digest(filter: &KnowledgeFilter) -> String {
        let canonical = serde_json::to_string(filter).unwrap_or_default();
        digest(&[&canonical])
    }

    fn normalize_query(query: &str) -> String {
        query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }

    pub fn entry_prefix(id: &str) -> String {
        format!("entry:{}:", id)
    }

    pub fn entry(id: &str, scope: &ReadScope) -> String {
        format!("{}{}", entry_prefix(id), scope.cache_tag())
    }

    pub const METADATA_PREFIX: &str = "meta:";

    pub fn metadata(scope: &ReadScope, filter: &KnowledgeFilter) -> String {
        format!("{}{}:{}", METADATA_PREFIX, scope.cache_tag(), filter_digest(filter))
    }

    pub fn similarity(
        scope: &ReadScope,
        query: &str,
        k: usize,
        filter: &KnowledgeFilter,
        min_score: Option<f64>,
    ) -> String {
        let min = min_score.map(|s| format!("{:.6}", s)).unwrap_or_default();
        format!(
            "similarity:{}:query:{}:k:{}:filters:{}:min:{}",
            scope.cache_tag(),
            digest(&[&normalize_query(query)]),
            k,
            filter_digest(filter),
            min
        )
    }

    pub fn thread_prefix(thread_id: &str) -> String {
        format!("thread:{}:", thread_id)
    }

    pub fn thread(thread_id: &str, since: Option<u64>, limit: usize) -> String {
        format!("{}since:{}:limit:{}", thread_prefix(thread_id), since.unwrap_or(0), limit)
    }

    pub fn caller_prefix(caller_id: &str) -> String {
        format!("caller:{}:", caller_id)
    }

    pub fn caller_history(caller_id: &str, limit: usize) -> String {
        format!("{}limit:{}", caller_prefix(caller_id), limit)
    }

    pub const CALLER_INSIGHTS_PREFIX: &str = "insights:caller:";

    pub fn category_insights_prefix(category: &str) -> String {
        format!("insights:category:{}", category.to_lowercase())
    }

    pub fn insights(subject: &InsightsSubject) -> String {
        match subject {
            InsightsSubject::Caller(id) => format!("{}{}", CALLER_INSIGHTS_PREFIX, id),
            InsightsSubject::Category(cat) => category_insights_prefix(cat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{InsightsSubject, KnowledgeFilter};

    fn records(n: usize) -> CacheValue {
        CacheValue::Records(Arc::new(Vec::with_capacity(n)))
    }

    fn layer(ttl: Duration, max: usize) -> CacheLayer {
        let s = NamespaceSettings { ttl, max_entries: max };
        CacheLayer::with_settings([s; 4], Duration::from_secs(60))
    }

    fn stats_for(cache: &CacheLayer, ns: Namespace) -> NamespaceStats {
        cache.stats().into_iter().find(|s| s.namespace == ns).unwrap()
    }

    #[test]
    fn miss_then_hit() {
        let cache = layer(Duration::from_secs(60), 10);
        assert!(cache.get(Namespace::History, "thread:t1:").is_none());
        cache.put(Namespace::History, "thread:t1:", records(0));
        assert!(cache.get(Namespace::History, "thread:t1:").is_some());
        let stats = stats_for(&cache, Namespace::History);
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn namespaces_are_independent() {
        let cache = layer(Duration::from_secs(60), 10);
        cache.put(Namespace::Knowledge, "k", records(0));
        assert!(cache.get(Namespace::Similarity, "k").is_none());
        cache.clear(Namespace::Similarity);
        assert!(cache.get(Namespace::Knowledge, "k").is_some());
    }

    #[test]
    fn lru_evicts_least_recent() {
        let cache = layer(Duration::from_secs(60), 2);
        cache.put(Namespace::Analytics, "a", records(0));
        cache.put(Namespace::Analytics, "b", records(0));
        assert!(cache.get(Namespace::Analytics, "a").is_some());
        cache.put(Namespace::Analytics, "c", records(0));
        assert!(cache.get(Namespace::Analytics, "b").is_none());
        assert!(cache.get(Namespace::Analytics, "a").is_some());
        assert_eq!(stats_for(&cache, Namespace::Analytics).evictions, 1);
    }

    #[test]
    fn replacing_a_key_is_not_an_eviction() {
        let cache = layer(Duration::from_secs(60), 2);
        cache.put(Namespace::Analytics, "a", records(0));
        cache.put(Namespace::Analytics, "a", records(1));
        assert_eq!(stats_for(&cache, Namespace::Analytics).evictions, 0);
    }

    #[test]
    fn expired_is_miss_but_stale_readable_until_swept() {
        let cache = layer(Duration::from_millis(20), 10);
        cache.put(Namespace::Similarity, "q", records(0));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(Namespace::Similarity, "q").is_none());
        assert!(cache.get_stale(Namespace::Similarity, "q").is_some());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.get_stale(Namespace::Similarity, "q").is_none());
        assert_eq!(stats_for(&cache, Namespace::Similarity).expirations, 1);
    }

    #[test]
    fn prefix_invalidation_only_hits_subject() {
        let cache = layer(Duration::from_secs(60), 10);
        cache.put(Namespace::History, keys::thread("t1", None, 50), records(0));
        cache.put(Namespace::History, keys::thread("t1", Some(3), 50), records(0));
        cache.put(Namespace::History, keys::thread("t10", None, 50), records(0));
        assert_eq!(cache.invalidate_prefix(Namespace::History, &keys::thread_prefix("t1")), 2);
        assert!(cache.get(Namespace::History, &keys::thread("t10", None, 50)).is_some());
    }

    #[test]
    fn put_after_invalidation_is_dropped() {
        let cache = layer(Duration::from_secs(60), 10);
        let before = cache.generation(Namespace::Knowledge);
        cache.invalidate_prefix(Namespace::Knowledge, &keys::entry_prefix("k1"));
        assert!(!cache.put_if_current(Namespace::Knowledge, keys::entry("k1", &ReadScope::All), records(0), before));
        assert!(cache.get(Namespace::Knowledge, &keys::entry("k1", &ReadScope::All)).is_none());
        let now = cache.generation(Namespace::Knowledge);
        assert!(cache.put_if_current(Namespace::Knowledge, keys::entry("k1", &ReadScope::All), records(0), now));
    }

    #[test]
    fn similarity_keys_normalize_query_and_scope() {
        let f = KnowledgeFilter::default();
        let a = keys::similarity(&ReadScope::All, "Lead  X", 5, &f, None);
        let b = keys::similarity(&ReadScope::All, " lead x ", 5, &f, None);
        let c = keys::similarity(&ReadScope::Department("sales".into()), "lead x", 5, &f, None);
        let d = keys::similarity(&ReadScope::All, "lead x", 6, &f, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn insight_keys_share_prefix() {
        let key = keys::insights(&InsightsSubject::Caller("agent-1".into()));
        assert!(key.starts_with(keys::CALLER_INSIGHTS_PREFIX));
        let cat = keys::insights(&InsightsSubject::Category("Lead_Scoring".into()));
        assert_eq!(cat, keys::category_insights_prefix("lead_scoring"));
    }
}
