// ── Colony Atoms: Injected Interfaces ──────────────────────────────────────
// The coordinator talks to every downstream component through these traits.
// Production wiring uses the SQLite-backed implementations in engine::store;
// tests swap in counting or fault-injecting doubles.

use crate::atoms::error::MemoryResult;
use crate::atoms::types::{
    Caller, CallerRecord, HistoryRecord, Insights, InsightsSubject,
    KnowledgeEntry, KnowledgeFilter, NewHistoryRecord, NewKnowledge, OutcomeEvent, ReadScope,
    ScoredEntry,
};
use async_trait::async_trait;

// ── Embedding generator ────────────────────────────────────────────────────

/// Converts raw content into a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider label for logs ("ollama", "openai", "local").
    fn name(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;
}

// ── Caller registry ────────────────────────────────────────────────────────

#[async_trait]
pub trait CallerRegistry: Send + Sync {
    /// Idempotent: re-registering an active caller returns the existing row.
    async fn register(&self, caller: &Caller) -> MemoryResult<CallerRecord>;

    /// Soft delete. Returns false when the caller was unknown or already retired.
    async fn retire(&self, caller_id: &str) -> MemoryResult<bool>;

    async fn get(&self, caller_id: &str) -> MemoryResult<Option<CallerRecord>>;
}

// ── Knowledge store ────────────────────────────────────────────────────────

#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Insert or overwrite an entry. `embedding` has already been generated
    /// (or is `None` for metadata-only storage).
    async fn store(
        &self,
        caller: &Caller,
        entry: &NewKnowledge,
        embedding: Option<Vec<f32>>,
    ) -> MemoryResult<KnowledgeEntry>;

    async fn get_by_id(&self, id: &str, scope: &ReadScope) -> MemoryResult<Option<KnowledgeEntry>>;

    /// Cosine ranking over embedded entries visible to `scope`.
    async fn search_similar(
        &self,
        embedding: &[f32],
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
        min_score: Option<f64>,
    ) -> MemoryResult<Vec<ScoredEntry>>;

    /// Metadata-only fallback used when the query cannot be embedded.
    async fn search_keywords(
        &self,
        query: &str,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
    ) -> MemoryResult<Vec<ScoredEntry>>;

    async fn query_by_metadata(
        &self,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
    ) -> MemoryResult<Vec<KnowledgeEntry>>;
}

// ── History log ────────────────────────────────────────────────────────────

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Append and return the stored record with its store-assigned sequence.
    async fn append(&self, caller: &Caller, record: &NewHistoryRecord) -> MemoryResult<HistoryRecord>;

    /// Records of one thread in sequence order, strictly after `since`.
    async fn read_thread(
        &self,
        thread_id: &str,
        since: Option<u64>,
        limit: usize,
    ) -> MemoryResult<Vec<HistoryRecord>>;

    /// Most recent records written by one caller across all threads, newest first.
    async fn read_caller_history(&self, caller_id: &str, limit: usize) -> MemoryResult<Vec<HistoryRecord>>;
}

// ── Analytics engine ───────────────────────────────────────────────────────

#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    /// Atomic increment. Returns false when `event_id` was already applied.
    async fn record_outcome(&self, caller: &Caller, event: &OutcomeEvent) -> MemoryResult<bool>;

    async fn get_insights(&self, subject: &InsightsSubject) -> MemoryResult<Insights>;
}
