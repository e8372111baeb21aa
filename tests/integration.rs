// Colony Memory — end-to-end tests through the coordinator.
// SQLite-backed wiring on temp files, with counting and fault-injecting
// doubles swapped in where a test needs to observe downstream calls.

use async_trait::async_trait;
use colony_memory::atoms::traits::{EmbeddingProvider, KnowledgeBackend};
use colony_memory::engine::cache::Namespace;
use colony_memory::engine::config::{CacheConfig, HealthConfig, SecurityConfig};
use colony_memory::engine::store::LocalEmbedder;
use colony_memory::engine::{
    Backends, CacheLayer, ConnectionPool, ErrorHandler, MemoryCoordinator, PoolSettings, RetryPolicy,
    SecurityValidator,
};
use colony_memory::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DIMS: usize = 64;

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("colony-memory-it-{}-{}.db", tag, uuid::Uuid::new_v4()))
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

// ── Doubles ────────────────────────────────────────────────────────────────

/// Counts every call that reaches the knowledge store; optionally fails reads
/// with a timeout.
struct CountingKnowledge {
    inner: Arc<dyn KnowledgeBackend>,
    calls: AtomicUsize,
    fail_reads: AtomicBool,
}

impl CountingKnowledge {
    fn wrap(inner: Arc<dyn KnowledgeBackend>) -> Arc<Self> {
        Arc::new(CountingKnowledge { inner, calls: AtomicUsize::new(0), fail_reads: AtomicBool::new(false) })
    }

    fn read_gate(&self, op: &str) -> MemoryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MemoryError::timeout(op, Duration::from_millis(10_000)));
        }
        Ok(())
    }
}

#[async_trait]
impl KnowledgeBackend for CountingKnowledge {
    async fn store(
        &self,
        caller: &Caller,
        entry: &NewKnowledge,
        embedding: Option<Vec<f32>>,
    ) -> MemoryResult<KnowledgeEntry> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.store(caller, entry, embedding).await
    }

    async fn get_by_id(&self, id: &str, scope: &ReadScope) -> MemoryResult<Option<KnowledgeEntry>> {
        self.read_gate("get_knowledge")?;
        self.inner.get_by_id(id, scope).await
    }

    async fn search_similar(
        &self,
        embedding: &[f32],
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
        min_score: Option<f64>,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        self.read_gate("search_knowledge")?;
        self.inner.search_similar(embedding, filter, scope, k, min_score).await
    }

    async fn search_keywords(
        &self,
        query: &str,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        self.read_gate("search_keywords")?;
        self.inner.search_keywords(query, filter, scope, k).await
    }

    async fn query_by_metadata(
        &self,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
    ) -> MemoryResult<Vec<KnowledgeEntry>> {
        self.read_gate("query_knowledge")?;
        self.inner.query_by_metadata(filter, scope).await
    }
}

/// An embedding service that is always down.
struct OfflineEmbedder;

#[async_trait]
impl EmbeddingProvider for OfflineEmbedder {
    fn name(&self) -> &str {
        "offline"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _text: &str) -> MemoryResult<Vec<f32>> {
        Err(MemoryError::Embedding("connection refused".into()))
    }
}

struct Harness {
    memory: MemoryCoordinator,
    knowledge: Arc<CountingKnowledge>,
}

async fn harness(security: SecurityConfig, embedder: Arc<dyn EmbeddingProvider>) -> Harness {
    let pool = ConnectionPool::open(PoolSettings::new(temp_db("harness")).with_max_size(4))
        .await
        .unwrap();
    let mut backends = Backends::sqlite(Arc::clone(&pool), DIMS).await.unwrap();
    let knowledge = CountingKnowledge::wrap(Arc::clone(&backends.knowledge));
    backends.knowledge = Arc::clone(&knowledge) as Arc<dyn KnowledgeBackend>;
    let memory = MemoryCoordinator::new(
        backends,
        embedder,
        Arc::new(CacheLayer::new(&CacheConfig::default())),
        SecurityValidator::new(security, DIMS),
        ErrorHandler::new(fast_retries(), HealthConfig::default()),
    )
    .with_pool(pool);
    Harness { memory, knowledge }
}

async fn open_memory(tag: &str) -> MemoryCoordinator {
    let mut config = MemoryConfig::default();
    config.database.path = temp_db(tag);
    config.database.pool_size = 4;
    config.embedding.dimensions = DIMS;
    MemoryCoordinator::open(config).await.unwrap()
}

async fn join(memory: &MemoryCoordinator, id: &str, department: &str) -> Caller {
    let caller = Caller::new(id, department);
    memory.register_caller(&caller, &caller).await.unwrap();
    caller
}

// ── Knowledge ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn stored_entry_reads_back_identically() {
    let memory = open_memory("roundtrip").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;

    let stored = memory
        .store_knowledge(
            &sales,
            NewKnowledge::unstructured("Lead X qualified").with_metadata("lead_id", "X"),
        )
        .await
        .unwrap();
    assert_eq!(stored.owner_id, "sales-agent-1");
    assert_eq!(stored.department, "sales");
    assert_eq!(stored.content_kind, ContentKind::Unstructured);

    let fetched = memory.get_knowledge(&sales, &stored.id).await.unwrap().unwrap();
    assert_eq!(fetched.content, "Lead X qualified");
    assert_eq!(fetched.metadata.get("lead_id"), Some(&json!("X")));
    assert_eq!(fetched, stored);
}

#[tokio::test]
async fn departments_are_isolated_unless_shared() {
    let memory = open_memory("isolation").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    let finance = join(&memory, "finance-agent-1", "finance").await;
    let exec = join(&memory, "exec-agent-1", "executive").await;

    let private = memory
        .store_knowledge(&sales, NewKnowledge::unstructured("Pipeline notes for lead X"))
        .await
        .unwrap();
    let shared = memory
        .store_knowledge(&sales, NewKnowledge::unstructured("Pricing sheet for lead X").shared())
        .await
        .unwrap();

    assert!(memory.get_knowledge(&finance, &private.id).await.unwrap().is_none());
    assert!(memory.get_knowledge(&finance, &shared.id).await.unwrap().is_some());
    assert!(memory.get_knowledge(&exec, &private.id).await.unwrap().is_some());

    let hits = memory
        .search_knowledge(&finance, &SearchRequest::new("lead X", 10))
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.entry.id != private.id));
    assert!(hits.iter().any(|h| h.entry.id == shared.id));

    let err = memory
        .store_knowledge(
            &finance,
            NewKnowledge::structured(&json!({"q3": 120})).with_department("sales"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    // Overwriting another department's entry by id is refused too.
    let err = memory
        .store_knowledge(&finance, NewKnowledge::unstructured("mine now").with_id(private.id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    let untouched = memory.get_knowledge(&sales, &private.id).await.unwrap().unwrap();
    assert_eq!(untouched.content, "Pipeline notes for lead X");
}

#[tokio::test]
async fn writes_invalidate_cached_reads() {
    let memory = open_memory("invalidate").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    let filter = KnowledgeFilter::default().with_metadata("topic", "pricing");

    assert!(memory.query_knowledge(&sales, &filter).await.unwrap().is_empty());
    let search = SearchRequest::new("enterprise pricing tiers", 5);
    assert!(memory.search_knowledge(&sales, &search).await.unwrap().is_empty());

    let stored = memory
        .store_knowledge(
            &sales,
            NewKnowledge::unstructured("Enterprise pricing tiers updated").with_metadata("topic", "pricing"),
        )
        .await
        .unwrap();

    let listed = memory.query_knowledge(&sales, &filter).await.unwrap();
    assert_eq!(listed.len(), 1);
    let hits = memory.search_knowledge(&sales, &search).await.unwrap();
    assert_eq!(hits[0].entry.id, stored.id);

    let updated = memory
        .store_knowledge(
            &sales,
            NewKnowledge::unstructured("Enterprise pricing tiers frozen")
                .with_id(stored.id.clone())
                .with_metadata("topic", "pricing"),
        )
        .await
        .unwrap();
    let fetched = memory.get_knowledge(&sales, &stored.id).await.unwrap().unwrap();
    assert_eq!(fetched.content, updated.content);
    assert_eq!(fetched.created_at, stored.created_at);
}

#[tokio::test]
async fn cold_and_warm_cache_return_the_same_results() {
    let memory = open_memory("coldwarm").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    for text in ["Lead X qualified", "Lead Y churned", "Invoice batch closed", "Lead X renewal"] {
        memory.store_knowledge(&sales, NewKnowledge::unstructured(text)).await.unwrap();
    }
    let request = SearchRequest::new("lead X", 3);

    let cold = memory.search_knowledge(&sales, &request).await.unwrap();
    let warm = memory.search_knowledge(&sales, &request).await.unwrap();
    assert_eq!(cold, warm);
    assert_eq!(memory.route_stats(OperationKind::SearchKnowledge).cache_hits, 1);

    for ns in Namespace::ALL {
        memory.cache().clear(ns);
    }
    let recomputed = memory.search_knowledge(&sales, &request).await.unwrap();
    assert_eq!(cold, recomputed);
}

#[tokio::test]
async fn search_falls_back_to_keywords_when_embedding_is_down() {
    let h = harness(SecurityConfig::default(), Arc::new(OfflineEmbedder)).await;
    let sales = join(&h.memory, "sales-agent-1", "sales").await;

    let stored = h
        .memory
        .store_knowledge(&sales, NewKnowledge::unstructured("Renewal call with Acme scheduled"))
        .await
        .unwrap();
    assert!(stored.embedding.is_none());

    let hits = h
        .memory
        .search_knowledge(&sales, &SearchRequest::new("acme renewal", 5))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.id, stored.id);
    assert!(h.memory.route_stats(OperationKind::SearchKnowledge).fallbacks >= 1);
}

// ── Resilience and limits ──────────────────────────────────────────────────

#[tokio::test]
async fn repeated_timeouts_degrade_to_empty_results() {
    let h = harness(SecurityConfig::default(), Arc::new(LocalEmbedder::new(DIMS))).await;
    let sales = join(&h.memory, "sales-agent-1", "sales").await;
    h.knowledge.fail_reads.store(true, Ordering::SeqCst);

    let found = h
        .memory
        .query_knowledge(&sales, &KnowledgeFilter::default().with_metadata("lead_id", "X"))
        .await
        .unwrap();
    assert!(found.is_empty());
    assert_eq!(h.knowledge.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.memory.component_status(Component::Knowledge), HealthStatus::Degraded);

    let stats = h.memory.route_stats(OperationKind::QueryKnowledge);
    assert_eq!(stats.fallbacks, 1);
    let report = h.memory.health();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.retry.fallbacks, 1);
    assert_eq!(report.retry.exhausted, 1);
}

#[tokio::test]
async fn search_timeouts_degrade_to_empty_results() {
    let h = harness(SecurityConfig::default(), Arc::new(LocalEmbedder::new(DIMS))).await;
    let sales = join(&h.memory, "sales-agent-1", "sales").await;
    h.memory
        .store_knowledge(&sales, NewKnowledge::unstructured("Lead X qualified"))
        .await
        .unwrap();
    h.knowledge.calls.store(0, Ordering::SeqCst);
    h.knowledge.fail_reads.store(true, Ordering::SeqCst);

    let hits = h
        .memory
        .search_knowledge(&sales, &SearchRequest::new("qualified lead", 5))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(h.knowledge.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.memory.component_status(Component::Knowledge), HealthStatus::Degraded);

    let stats = h.memory.route_stats(OperationKind::SearchKnowledge);
    assert_eq!((stats.fallbacks, stats.cache_misses), (1, 1));
    assert_eq!(h.memory.health().retry.exhausted, 1);
}

#[tokio::test]
async fn rate_limited_requests_never_reach_the_store() {
    let security = SecurityConfig { rate_limit_requests: 4, ..SecurityConfig::default() };
    let h = harness(security, Arc::new(LocalEmbedder::new(DIMS))).await;
    let sales = join(&h.memory, "sales-agent-1", "sales").await;

    let mut admitted = 0;
    let mut limited = 0;
    for i in 0..10 {
        match h
            .memory
            .store_knowledge(&sales, NewKnowledge::structured(&json!({ "n": i })))
            .await
        {
            Ok(_) => admitted += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::RateLimited);
                assert!(e.retry_after().is_some());
                limited += 1;
            }
        }
    }
    assert!(limited > 0);
    assert_eq!(h.knowledge.calls.load(Ordering::SeqCst), admitted);
    assert_eq!(h.memory.health().security.rejected_rate_limited, limited as u64);
}

#[tokio::test]
async fn pool_caps_concurrent_connections() {
    let pool = ConnectionPool::open(PoolSettings::new(temp_db("pool")).with_max_size(2))
        .await
        .unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let reads = (0..5).map(|_| {
        let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
        pool.with_conn("slow_read", move |conn| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(one)
        })
    });
    let results = futures::future::join_all(reads).await;

    assert!(results.iter().all(|r| matches!(r, Ok(1))));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(pool.stats().created <= 2);
}

// ── History ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_appends_to_one_thread_are_totally_ordered() {
    let memory = open_memory("thread").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;

    let records: Vec<NewHistoryRecord> = (0..25)
        .map(|i| NewHistoryRecord::message("deal-42", HistoryRole::Caller, format!("msg {}", i)))
        .collect();
    let appends = records.iter().map(|r| memory.log_history(&sales, r));
    let results = futures::future::join_all(appends).await;
    let mut seqs: Vec<u64> = results.into_iter().map(|r| r.unwrap().sequence).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=25).collect::<Vec<u64>>());

    let thread = memory.read_thread(&sales, "deal-42", None, 100).await.unwrap();
    assert_eq!(thread.len(), 25);
    assert!(thread.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let tail = memory.read_thread(&sales, "deal-42", Some(20), 100).await.unwrap();
    assert_eq!(tail.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![21, 22, 23, 24, 25]);
}

#[tokio::test]
async fn thread_ids_cannot_reach_a_callers_private_timeline() {
    let memory = open_memory("private-key").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    let finance = join(&memory, "finance-agent-1", "finance").await;
    let outcome = ActionOutcome { task_category: "lead_scoring".into(), success: true, latency_ms: 30 };

    let first = memory.log_history(&sales, &NewHistoryRecord::action("scored", outcome.clone())).await.unwrap();
    let squatter = memory
        .log_history(&finance, &NewHistoryRecord::message("@sales-agent-1", HistoryRole::Caller, "hi"))
        .await
        .unwrap();
    let second = memory.log_history(&sales, &NewHistoryRecord::action("scored", outcome)).await.unwrap();
    assert_eq!(squatter.sequence, 1);
    assert_eq!((first.sequence, second.sequence), (1, 2));

    let err = memory
        .log_history(&finance, &NewHistoryRecord::message("caller:sales-agent-1", HistoryRole::Caller, "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn retired_callers_cannot_write() {
    let memory = open_memory("retire").await;
    let admin = join(&memory, "memory-admin", "memory").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;

    let err = memory.retire_caller(&sales, "sales-agent-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(memory.retire_caller(&admin, "sales-agent-1").await.unwrap());

    let err = memory
        .log_history(&sales, &NewHistoryRecord::message("t1", HistoryRole::Caller, "still here?"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let impostor = Caller::new("ghost", "sales");
    let err = memory
        .store_knowledge(&impostor, NewKnowledge::unstructured("hello"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

// ── Analytics ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_event_ids_count_once() {
    let memory = open_memory("events").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    let event = OutcomeEvent::new("lead_scoring", true, 200).with_event_id("evt-1");

    assert!(memory.record_outcome(&sales, &event).await.unwrap());
    assert!(!memory.record_outcome(&sales, &event).await.unwrap());
    memory
        .record_outcome(&sales, &OutcomeEvent::new("Lead_Scoring", false, 400))
        .await
        .unwrap();

    let insights = memory
        .get_insights(&sales, &InsightsSubject::Caller("sales-agent-1".into()))
        .await
        .unwrap();
    assert_eq!((insights.total_success, insights.total_failure), (1, 1));
    assert_eq!(insights.breakdown.len(), 1);
    assert_eq!(insights.avg_latency_ms, Some(300.0));

    let by_category = memory
        .get_insights(&sales, &InsightsSubject::Category(" LEAD_SCORING ".into()))
        .await
        .unwrap();
    assert_eq!(by_category.total_runs(), 2);
}

#[tokio::test]
async fn insights_reflect_new_outcomes_after_caching() {
    let memory = open_memory("insights").await;
    let sales = join(&memory, "sales-agent-1", "sales").await;
    let subject = InsightsSubject::Caller("sales-agent-1".into());

    let empty = memory.get_insights(&sales, &subject).await.unwrap();
    assert_eq!(empty.total_runs(), 0);

    for ok in [false, false, false] {
        memory
            .record_outcome(&sales, &OutcomeEvent::new("proposal_drafting", ok, 100))
            .await
            .unwrap();
    }
    let insights = memory.get_insights(&sales, &subject).await.unwrap();
    assert_eq!(insights.total_failure, 3);
    assert!(insights
        .recommendations
        .iter()
        .any(|r| r.priority == Priority::High && r.task_category == "proposal_drafting"));
}
