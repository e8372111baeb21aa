// Colony Memory — SQLite Store
// The three storage components plus the caller registry, all backed by one
// pooled SQLite database. Every call takes exactly one lease from the pool
// for its duration; writes run inside BEGIN IMMEDIATE transactions.
//
// Module layout:
//   schema       idempotent DDL
//   vector       BLOB <-> f32, cosine similarity, normalisation
//   embedding    EmbeddingProvider implementations (HTTP + local)
//   callers      caller registry + the active-caller guard used by writes
//   knowledge    Knowledge Store (entries, similarity, metadata query)
//   history      History Log (per-thread sequences, caller timeline)
//   analytics    Analytics Engine (atomic counters, insights)

pub(crate) mod analytics;
pub(crate) mod callers;
pub mod embedding;
pub(crate) mod history;
pub(crate) mod knowledge;
pub(crate) mod schema;
pub mod vector;

pub use analytics::{build_insights, AnalyticsEngine};
pub use callers::CallerDirectory;
pub use embedding::{build_provider, EmbeddingClient, LocalEmbedder};
pub use history::HistoryLog;
pub use knowledge::KnowledgeStore;

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::{AnalyticsBackend, CallerRegistry, HistoryBackend, KnowledgeBackend};
use crate::engine::pool::ConnectionPool;
use std::sync::Arc;

/// The injected downstream components the coordinator routes to.
#[derive(Clone)]
pub struct Backends {
    pub callers: Arc<dyn CallerRegistry>,
    pub knowledge: Arc<dyn KnowledgeBackend>,
    pub history: Arc<dyn HistoryBackend>,
    pub analytics: Arc<dyn AnalyticsBackend>,
}

impl Backends {
    /// Run migrations on the pool's database and wire the SQLite components.
    pub async fn sqlite(pool: Arc<ConnectionPool>, vector_dimension: usize) -> MemoryResult<Self> {
        pool.with_conn("migrate", |conn| schema::run_migrations(conn)).await?;
        Ok(Backends {
            callers: Arc::new(CallerDirectory::new(Arc::clone(&pool))),
            knowledge: Arc::new(KnowledgeStore::new(Arc::clone(&pool), vector_dimension)),
            history: Arc::new(HistoryLog::new(Arc::clone(&pool))),
            analytics: Arc::new(AnalyticsEngine::new(pool)),
        })
    }
}

// ── Row helpers ────────────────────────────────────────────────────────────

/// Wrap a decode failure so it can be returned from a row-mapping closure.
pub(crate) fn conversion_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into().into(),
    )
}

pub(crate) fn metadata_from_column(raw: &str, column: usize) -> rusqlite::Result<crate::atoms::types::Metadata> {
    serde_json::from_str(raw).map_err(|e| conversion_error(column, format!("metadata: {}", e)))
}

/// Re-render a caller-supplied RFC 3339 bound in the store's canonical form
/// so text comparison matches chronological order.
pub(crate) fn normalize_timestamp(raw: &str) -> MemoryResult<String> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| {
            dt.with_timezone(&chrono::Utc)
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        })
        .map_err(|_| MemoryError::validation(format!("'{}' is not an RFC 3339 timestamp", raw)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::atoms::types::Caller;
    use crate::engine::pool::{tests::temp_db_path, PoolSettings};

    pub(crate) async fn sqlite_backends(dimension: usize) -> (Arc<ConnectionPool>, Backends) {
        let pool = ConnectionPool::open(PoolSettings::new(temp_db_path("store")).with_max_size(4))
            .await
            .unwrap();
        let backends = Backends::sqlite(Arc::clone(&pool), dimension).await.unwrap();
        (pool, backends)
    }

    pub(crate) async fn registered(backends: &Backends, id: &str, dept: &str) -> Caller {
        let caller = Caller::new(id, dept);
        backends.callers.register(&caller).await.unwrap();
        caller
    }
}
