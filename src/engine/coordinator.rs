// Colony Memory — Memory Coordinator
// Single entry point for every agent-facing operation.
//
//   request → SecurityValidator → cache (reads) → ErrorHandler → component
//
// Reads that still fail after retries degrade to the last cached value (even
// if expired) or an empty result, and are counted as fallbacks. Writes never
// degrade: they return the classified error. Every write invalidates the
// cache keys for its subject before it returns.
//
// All collaborators are injected at construction; `open` wires the SQLite
// implementations from a `MemoryConfig`.

use crate::atoms::constants::LOG_PREVIEW_CHARS;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::EmbeddingProvider;
use crate::atoms::types::{
    timestamp_now, Caller, CallerRecord, Component, ContentKind, HealthStatus, HistoryRecord,
    Insights, InsightsSubject, KnowledgeEntry, KnowledgeFilter, NewHistoryRecord, NewKnowledge,
    OperationKind, OutcomeEvent, ReadScope, ScoredEntry, SearchRequest,
};
use crate::engine::cache::{keys, CacheLayer, CacheValue, Namespace, NamespaceStats};
use crate::engine::config::MemoryConfig;
use crate::engine::pool::{ConnectionPool, PoolSettings, PoolStats};
use crate::engine::resilience::{ComponentReport, ErrorHandler, RetryPolicy, RetryStats};
use crate::engine::security::{Request, SecurityStats, SecurityValidator};
use crate::engine::store::{build_provider, Backends};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

// ── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub requests: u64,
    /// Rejected by the security validator.
    pub rejected: u64,
    pub successes: u64,
    pub failures: u64,
    /// Reads answered from stale cache or an empty default.
    pub fallbacks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentReport>,
    pub routing: BTreeMap<String, RouteStats>,
    pub cache: Vec<NamespaceStats>,
    pub pool: Option<PoolStats>,
    pub retry: RetryStats,
    pub security: SecurityStats,
    pub embedder: String,
    pub started_at: String,
    pub generated_at: String,
}

// ── Cache adapters ─────────────────────────────────────────────────────────

/// Read results that can live in a cache namespace.
trait Cacheable: Clone {
    fn into_cache(self) -> Option<CacheValue>;
    fn from_cache(value: &CacheValue) -> Option<Self>;
}

impl Cacheable for Vec<ScoredEntry> {
    fn into_cache(self) -> Option<CacheValue> {
        Some(CacheValue::Ranked(Arc::new(self)))
    }
    fn from_cache(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Ranked(v) => Some(v.as_ref().clone()),
            _ => None,
        }
    }
}

impl Cacheable for Vec<KnowledgeEntry> {
    fn into_cache(self) -> Option<CacheValue> {
        Some(CacheValue::Entries(Arc::new(self)))
    }
    fn from_cache(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Entries(v) => Some(v.as_ref().clone()),
            _ => None,
        }
    }
}

/// Absent entries are not cached.
impl Cacheable for Option<KnowledgeEntry> {
    fn into_cache(self) -> Option<CacheValue> {
        self.map(|e| CacheValue::Entry(Arc::new(e)))
    }
    fn from_cache(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Entry(e) => Some(Some(e.as_ref().clone())),
            _ => None,
        }
    }
}

impl Cacheable for Vec<HistoryRecord> {
    fn into_cache(self) -> Option<CacheValue> {
        Some(CacheValue::Records(Arc::new(self)))
    }
    fn from_cache(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Records(v) => Some(v.as_ref().clone()),
            _ => None,
        }
    }
}

impl Cacheable for Insights {
    fn into_cache(self) -> Option<CacheValue> {
        Some(CacheValue::Insights(Arc::new(self)))
    }
    fn from_cache(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Insights(v) => Some(v.as_ref().clone()),
            _ => None,
        }
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    if text.chars().count() > LOG_PREVIEW_CHARS {
        out.push('…');
    }
    out
}

fn normalize_subject(subject: &InsightsSubject) -> InsightsSubject {
    match subject {
        InsightsSubject::Caller(id) => InsightsSubject::Caller(id.trim().to_string()),
        InsightsSubject::Category(cat) => InsightsSubject::Category(cat.trim().to_lowercase()),
    }
}

// ── Coordinator ────────────────────────────────────────────────────────────

pub struct MemoryCoordinator {
    backends: Backends,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<CacheLayer>,
    validator: SecurityValidator,
    handler: ErrorHandler,
    pool: Option<Arc<ConnectionPool>>,
    routing: Mutex<HashMap<OperationKind, RouteStats>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started_at: String,
}

impl MemoryCoordinator {
    pub fn new(
        backends: Backends,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<CacheLayer>,
        validator: SecurityValidator,
        handler: ErrorHandler,
    ) -> Self {
        MemoryCoordinator {
            backends,
            embedder,
            cache,
            validator,
            handler,
            pool: None,
            routing: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            started_at: timestamp_now(),
        }
    }

    /// Report this pool's stats in `health()`.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Wire the SQLite store, embedding provider, cache and policies from
    /// config, and start the cache sweeper and pool health check. Must be
    /// called inside a tokio runtime.
    pub async fn open(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let dims = config.embedding.dimensions;
        let embedder = build_provider(&config.embedding)?;
        if embedder.dimensions() != dims {
            return Err(MemoryError::Config(format!(
                "embedding provider yields {} dimensions, configured {}",
                embedder.dimensions(),
                dims
            )));
        }
        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = ConnectionPool::open(PoolSettings::from(&config.database)).await?;
        let backends = Backends::sqlite(Arc::clone(&pool), dims).await?;
        let cache = Arc::new(CacheLayer::new(&config.cache));
        let validator = SecurityValidator::new(config.security.clone(), dims);
        let handler = ErrorHandler::new(RetryPolicy::from(&config.retry), config.health.clone());

        let coordinator = MemoryCoordinator::new(backends, embedder, Arc::clone(&cache), validator, handler)
            .with_pool(Arc::clone(&pool));
        {
            let mut tasks = coordinator.background.lock();
            tasks.push(cache.spawn_sweeper());
            tasks.push(pool.spawn_health_check());
        }
        info!(
            "[memory::coordinator] Ready: db {:?}, pool {}, embedder {} ({} dims)",
            config.database.path,
            config.database.pool_size,
            coordinator.embedder.name(),
            dims
        );
        Ok(coordinator)
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    // ── Bookkeeping ────────────────────────────────────────────────────────

    fn bump(&self, op: OperationKind, f: impl FnOnce(&mut RouteStats)) {
        f(self.routing.lock().entry(op).or_default());
    }

    /// Count the request and run the validator.
    fn admit(&self, caller: &Caller, request: Request<'_>) -> MemoryResult<ReadScope> {
        let op = request.operation();
        self.bump(op, |s| s.requests += 1);
        self.validator.validate(caller, &request).inspect_err(|_| self.bump(op, |s| s.rejected += 1))
    }

    fn settle<T>(&self, op: OperationKind, result: MemoryResult<T>) -> MemoryResult<T> {
        match &result {
            Ok(_) => self.bump(op, |s| s.successes += 1),
            Err(e) => {
                self.bump(op, |s| s.failures += 1);
                warn!("[memory::coordinator] {} failed: {}", op, e);
            }
        }
        result
    }

    /// One fresh-cache lookup, counted once as a hit or a miss.
    fn cache_lookup<T: Cacheable>(&self, op: OperationKind, ns: Namespace, key: &str) -> Option<T> {
        match self.cache.get(ns, key).as_ref().and_then(T::from_cache) {
            Some(hit) => {
                self.bump(op, |s| {
                    s.cache_hits += 1;
                    s.successes += 1;
                });
                Some(hit)
            }
            None => {
                self.bump(op, |s| s.cache_misses += 1);
                None
            }
        }
    }

    /// Cache-aside read with stale-or-default fallback.
    async fn cached_read<T, F, Fut>(
        &self,
        op: OperationKind,
        ns: Namespace,
        key: String,
        default: T,
        fetch: F,
    ) -> MemoryResult<T>
    where
        T: Cacheable,
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        if let Some(hit) = self.cache_lookup(op, ns, &key) {
            return Ok(hit);
        }
        self.fetch_and_cache(op, ns, key, default, fetch).await
    }

    /// The miss half of `cached_read`; the caller has already looked up `key`.
    async fn fetch_and_cache<T, F, Fut>(
        &self,
        op: OperationKind,
        ns: Namespace,
        key: String,
        default: T,
        fetch: F,
    ) -> MemoryResult<T>
    where
        T: Cacheable,
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let component = op.component().unwrap_or(Component::Knowledge);
        let generation = self.cache.generation(ns);
        let cache = &self.cache;
        let outcome = self
            .handler
            .with_fallback(component, op.as_str(), fetch, || {
                Some(cache.get_stale(ns, &key).as_ref().and_then(T::from_cache).unwrap_or(default))
            })
            .await;

        match outcome {
            Ok((value, false)) => {
                if let Some(cached) = value.clone().into_cache() {
                    self.cache.put_if_current(ns, key, cached, generation);
                }
                self.bump(op, |s| s.successes += 1);
                Ok(value)
            }
            Ok((value, true)) => {
                self.bump(op, |s| {
                    s.successes += 1;
                    s.fallbacks += 1;
                });
                Ok(value)
            }
            Err(e) => self.settle(op, Err(e)),
        }
    }

    fn invalidate_knowledge(&self, id: &str) {
        self.cache.invalidate_prefix(Namespace::Knowledge, &keys::entry_prefix(id));
        self.cache.invalidate_prefix(Namespace::Knowledge, keys::METADATA_PREFIX);
        self.cache.clear(Namespace::Similarity);
    }

    fn invalidate_history(&self, caller_id: &str, thread_id: Option<&str>) {
        if let Some(tid) = thread_id {
            self.cache.invalidate_prefix(Namespace::History, &keys::thread_prefix(tid));
        }
        self.cache.invalidate_prefix(Namespace::History, &keys::caller_prefix(caller_id));
    }

    fn invalidate_analytics(&self, task_category: &str) {
        // Every caller's insights carry peer benchmarks, so all of them go.
        self.cache.invalidate_prefix(Namespace::Analytics, keys::CALLER_INSIGHTS_PREFIX);
        self.cache
            .invalidate(Namespace::Analytics, &keys::category_insights_prefix(task_category.trim()));
    }

    // ── Caller registry ────────────────────────────────────────────────────

    /// Provision `target`. Callers may register themselves; admin
    /// departments may register anyone.
    pub async fn register_caller(&self, caller: &Caller, target: &Caller) -> MemoryResult<CallerRecord> {
        let op = OperationKind::RegisterCaller;
        self.admit(caller, Request::RegisterCaller(target))?;
        let result = self
            .handler
            .retry(op.as_str(), || self.backends.callers.register(target))
            .await;
        self.settle(op, result)
    }

    pub async fn retire_caller(&self, caller: &Caller, caller_id: &str) -> MemoryResult<bool> {
        let op = OperationKind::RetireCaller;
        self.admit(caller, Request::RetireCaller { caller_id })?;
        let result = self
            .handler
            .retry(op.as_str(), || self.backends.callers.retire(caller_id))
            .await;
        if matches!(result, Ok(true)) {
            info!("[memory::coordinator] '{}' retired '{}'", caller.id, caller_id);
        }
        self.settle(op, result)
    }

    // ── Knowledge ──────────────────────────────────────────────────────────

    /// Embed once (unless a vector was supplied), with retries. `None` when
    /// the generator keeps failing; callers fall back to metadata paths.
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.handler.retry("embed", || self.embedder.embed(text)).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                warn!("[memory::coordinator] Embedding unavailable, using metadata only: {}", e);
                None
            }
        }
    }

    pub async fn store_knowledge(&self, caller: &Caller, entry: NewKnowledge) -> MemoryResult<KnowledgeEntry> {
        let op = OperationKind::StoreKnowledge;
        self.admit(caller, Request::StoreKnowledge(&entry))?;

        let mut entry = entry;
        // A fixed id makes a retried insert an idempotent upsert.
        let id = entry
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .trim()
            .to_string();
        let embedding = match (entry.embedding.take(), entry.kind()) {
            (Some(vec), _) => Some(vec),
            (None, ContentKind::Unstructured) => self.embed(&entry.content).await,
            (None, ContentKind::Structured) => None,
        };

        let result = self
            .handler
            .with_retry(Component::Knowledge, op.as_str(), || {
                self.backends.knowledge.store(caller, &entry, embedding.clone())
            })
            .await;
        self.invalidate_knowledge(&id);
        if let Ok(stored) = &result {
            info!(
                "[memory::coordinator] {} stored {} '{}'",
                caller.id,
                stored.id,
                preview(&stored.content)
            );
        }
        self.settle(op, result)
    }

    /// Similarity search. Falls back to keyword ranking when the query
    /// cannot be embedded, and to stale-or-empty results when the store
    /// keeps failing.
    pub async fn search_knowledge(&self, caller: &Caller, request: &SearchRequest) -> MemoryResult<Vec<ScoredEntry>> {
        let op = OperationKind::SearchKnowledge;
        let scope = self.admit(caller, Request::SearchKnowledge(request))?;
        let key = keys::similarity(&scope, &request.query, request.k, &request.filter, request.min_score);
        if let Some(hit) = self.cache_lookup(op, Namespace::Similarity, &key) {
            return Ok(hit);
        }

        match self.embed(&request.query).await {
            Some(vector) => {
                self.fetch_and_cache(op, Namespace::Similarity, key, Vec::new(), || {
                    self.backends.knowledge.search_similar(
                        &vector,
                        &request.filter,
                        &scope,
                        request.k,
                        request.min_score,
                    )
                })
                .await
            }
            None => {
                // Keyword results are not cached under the similarity key.
                let result = self
                    .handler
                    .with_fallback(
                        Component::Knowledge,
                        "search_keywords",
                        || self.backends.knowledge.search_keywords(&request.query, &request.filter, &scope, request.k),
                        || Some(Vec::new()),
                    )
                    .await;
                match result {
                    Ok((hits, fell_back)) => {
                        self.bump(op, |s| {
                            s.successes += 1;
                            s.fallbacks += 1 + u64::from(fell_back);
                        });
                        debug!("[memory::coordinator] Keyword fallback returned {} hits", hits.len());
                        Ok(hits)
                    }
                    Err(e) => self.settle(op, Err(e)),
                }
            }
        }
    }

    pub async fn get_knowledge(&self, caller: &Caller, id: &str) -> MemoryResult<Option<KnowledgeEntry>> {
        let op = OperationKind::GetKnowledge;
        let scope = self.admit(caller, Request::GetKnowledge { id })?;
        let key = keys::entry(id, &scope);
        self.cached_read(op, Namespace::Knowledge, key, None, || {
            self.backends.knowledge.get_by_id(id, &scope)
        })
        .await
    }

    pub async fn query_knowledge(&self, caller: &Caller, filter: &KnowledgeFilter) -> MemoryResult<Vec<KnowledgeEntry>> {
        let op = OperationKind::QueryKnowledge;
        let scope = self.admit(caller, Request::QueryKnowledge(filter))?;
        let key = keys::metadata(&scope, filter);
        self.cached_read(op, Namespace::Knowledge, key, Vec::new(), || {
            self.backends.knowledge.query_by_metadata(filter, &scope)
        })
        .await
    }

    // ── History ────────────────────────────────────────────────────────────

    /// Append a record. Action records with an outcome also feed analytics,
    /// best-effort: an analytics failure does not fail the append.
    pub async fn log_history(&self, caller: &Caller, record: &NewHistoryRecord) -> MemoryResult<HistoryRecord> {
        let op = OperationKind::LogHistory;
        self.admit(caller, Request::LogHistory(record))?;
        let result = self
            .handler
            .with_retry(Component::History, op.as_str(), || self.backends.history.append(caller, record))
            .await;
        self.invalidate_history(&caller.id, record.thread_id.as_deref());
        let result = self.settle(op, result)?;

        if let Some(outcome) = &record.outcome {
            let event = OutcomeEvent::new(outcome.task_category.clone(), outcome.success, outcome.latency_ms)
                .with_event_id(format!("history:{}", result.id));
            let applied = self
                .handler
                .with_retry(Component::Analytics, "record_outcome", || {
                    self.backends.analytics.record_outcome(caller, &event)
                })
                .await;
            self.invalidate_analytics(&event.task_category);
            if let Err(e) = applied {
                warn!("[memory::coordinator] Outcome for record {} not recorded: {}", result.id, e);
            }
        }
        Ok(result)
    }

    pub async fn read_thread(
        &self,
        caller: &Caller,
        thread_id: &str,
        since: Option<u64>,
        limit: usize,
    ) -> MemoryResult<Vec<HistoryRecord>> {
        let op = OperationKind::ReadHistory;
        self.admit(caller, Request::ReadThread { thread_id, since, limit })?;
        let key = keys::thread(thread_id, since, limit);
        self.cached_read(op, Namespace::History, key, Vec::new(), || {
            self.backends.history.read_thread(thread_id, since, limit)
        })
        .await
    }

    pub async fn read_caller_history(
        &self,
        caller: &Caller,
        caller_id: &str,
        limit: usize,
    ) -> MemoryResult<Vec<HistoryRecord>> {
        let op = OperationKind::ReadHistory;
        self.admit(caller, Request::ReadCallerHistory { caller_id, limit })?;
        let key = keys::caller_history(caller_id, limit);
        self.cached_read(op, Namespace::History, key, Vec::new(), || {
            self.backends.history.read_caller_history(caller_id, limit)
        })
        .await
    }

    // ── Analytics ──────────────────────────────────────────────────────────

    /// Returns false when the event id had already been applied.
    pub async fn record_outcome(&self, caller: &Caller, event: &OutcomeEvent) -> MemoryResult<bool> {
        let op = OperationKind::RecordOutcome;
        self.admit(caller, Request::RecordOutcome(event))?;
        let result = self
            .handler
            .with_retry(Component::Analytics, op.as_str(), || {
                self.backends.analytics.record_outcome(caller, event)
            })
            .await;
        self.invalidate_analytics(&event.task_category);
        self.settle(op, result)
    }

    pub async fn get_insights(&self, caller: &Caller, subject: &InsightsSubject) -> MemoryResult<Insights> {
        let op = OperationKind::GetInsights;
        self.admit(caller, Request::GetInsights(subject))?;
        let subject = normalize_subject(subject);
        let key = keys::insights(&subject);
        let default = Insights::empty(subject.clone());
        self.cached_read(op, Namespace::Analytics, key, default, || {
            self.backends.analytics.get_insights(&subject)
        })
        .await
    }

    // ── Health ─────────────────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        let routing = self
            .routing
            .lock()
            .iter()
            .map(|(op, stats)| (op.as_str().to_string(), stats.clone()))
            .collect();
        HealthReport {
            status: self.handler.overall(),
            components: Component::ALL.iter().map(|c| self.handler.report(*c)).collect(),
            routing,
            cache: self.cache.stats(),
            pool: self.pool.as_ref().map(|p| p.stats()),
            retry: self.handler.stats(),
            security: self.validator.stats(),
            embedder: format!("{} ({} dims)", self.embedder.name(), self.embedder.dimensions()),
            started_at: self.started_at.clone(),
            generated_at: timestamp_now(),
        }
    }

    pub fn component_status(&self, component: Component) -> HealthStatus {
        self.handler.status(component)
    }

    pub fn route_stats(&self, op: OperationKind) -> RouteStats {
        self.routing.lock().get(&op).cloned().unwrap_or_default()
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::HistoryRole;
    use crate::engine::pool::tests::temp_db_path;

    async fn open_temp() -> MemoryCoordinator {
        let mut config = MemoryConfig::default();
        config.database.path = temp_db_path("coordinator");
        config.database.pool_size = 4;
        config.embedding.dimensions = 64;
        MemoryCoordinator::open(config).await.unwrap()
    }

    async fn member(memory: &MemoryCoordinator, id: &str, dept: &str) -> Caller {
        let caller = Caller::new(id, dept);
        memory.register_caller(&caller, &caller).await.unwrap();
        caller
    }

    #[tokio::test]
    async fn store_search_and_get() {
        let memory = open_temp().await;
        let sales = member(&memory, "sales-agent-1", "sales").await;
        let stored = memory
            .store_knowledge(&sales, NewKnowledge::unstructured("Lead X qualified for enterprise pricing"))
            .await
            .unwrap();
        memory
            .store_knowledge(&sales, NewKnowledge::unstructured("Quarterly invoice reconciliation"))
            .await
            .unwrap();
        assert!(stored.embedding.as_ref().is_some_and(|v| v.len() == 64));

        let hits = memory
            .search_knowledge(&sales, &SearchRequest::new("qualified lead pricing", 5))
            .await
            .unwrap();
        assert_eq!(hits[0].entry.id, stored.id);

        let fetched = memory.get_knowledge(&sales, &stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, stored.content);
        assert!(memory.get_knowledge(&sales, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_read_is_a_cache_hit() {
        let memory = open_temp().await;
        let sales = member(&memory, "sales-agent-1", "sales").await;
        memory
            .log_history(&sales, &NewHistoryRecord::message("t1", HistoryRole::Caller, "hello"))
            .await
            .unwrap();
        memory.read_thread(&sales, "t1", None, 50).await.unwrap();
        memory.read_thread(&sales, "t1", None, 50).await.unwrap();
        let stats = memory.route_stats(OperationKind::ReadHistory);
        assert_eq!((stats.cache_misses, stats.cache_hits), (1, 1));
        assert_eq!(stats.successes, 2);
    }

    #[tokio::test]
    async fn cold_search_counts_one_miss() {
        let memory = open_temp().await;
        let sales = member(&memory, "sales-agent-1", "sales").await;
        memory
            .store_knowledge(&sales, NewKnowledge::unstructured("Lead X qualified"))
            .await
            .unwrap();
        let request = SearchRequest::new("qualified lead", 5);
        memory.search_knowledge(&sales, &request).await.unwrap();
        memory.search_knowledge(&sales, &request).await.unwrap();

        let route = memory.route_stats(OperationKind::SearchKnowledge);
        assert_eq!((route.cache_misses, route.cache_hits), (1, 1));
        let similarity = memory
            .cache()
            .stats()
            .into_iter()
            .find(|s| s.namespace == Namespace::Similarity)
            .unwrap();
        assert_eq!((similarity.misses, similarity.hits), (1, 1));
    }

    #[tokio::test]
    async fn action_records_feed_analytics() {
        let memory = open_temp().await;
        let sales = member(&memory, "sales-agent-1", "sales").await;
        let outcome = crate::atoms::types::ActionOutcome {
            task_category: "lead_scoring".into(),
            success: true,
            latency_ms: 120,
        };
        memory
            .log_history(&sales, &NewHistoryRecord::action("scored lead X", outcome))
            .await
            .unwrap();
        let insights = memory
            .get_insights(&sales, &InsightsSubject::Caller("sales-agent-1".into()))
            .await
            .unwrap();
        assert_eq!(insights.total_success, 1);
        assert_eq!(insights.avg_latency_ms, Some(120.0));
    }

    #[tokio::test]
    async fn rejected_requests_are_counted() {
        let memory = open_temp().await;
        let sales = member(&memory, "sales-agent-1", "sales").await;
        let err = memory
            .read_caller_history(&sales, "someone-else", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Authorization(_)));
        let stats = memory.route_stats(OperationKind::ReadHistory);
        assert_eq!((stats.requests, stats.rejected), (1, 1));
        let report = memory.health();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.security.rejected_authorization, 1);
        assert!(report.pool.is_some());
    }
}
