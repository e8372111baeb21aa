// Colony Memory — Knowledge Store
// Shared facts and documents, optionally embedded for similarity search.
//
// Read scope and the cheap filters (kind, department, time bounds) are pushed
// into SQL so rows the caller may not see never leave the store. Metadata
// equality and cosine scoring run in Rust over the surviving rows.
//
// Ranking is deterministic: score desc, created_at desc, id asc.

use super::callers::require_active_caller;
use super::vector::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use super::{conversion_error, metadata_from_column, normalize_timestamp};
use crate::atoms::constants::KEYWORD_SCAN_LIMIT;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::KnowledgeBackend;
use crate::atoms::types::{
    timestamp_now, Caller, ContentKind, KnowledgeEntry, KnowledgeFilter, NewKnowledge, ReadScope,
    ScoredEntry,
};
use crate::engine::pool::ConnectionPool;
use crate::engine::security::policy::{authorize, Target};
use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::cmp::Ordering;
use std::sync::Arc;

const ENTRY_COLUMNS: &str = "id, owner_id, department, content_kind, content, metadata, shared, \
                             embedding, created_at, updated_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    let kind: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    let blob: Option<Vec<u8>> = row.get(7)?;
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        department: row.get(2)?,
        content_kind: ContentKind::parse(&kind)
            .ok_or_else(|| conversion_error(3, format!("unknown content kind '{}'", kind)))?,
        content: row.get(4)?,
        metadata: metadata_from_column(&metadata, 5)?,
        shared: row.get(6)?,
        embedding: blob.map(|b| bytes_to_f32_vec(&b)),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn load_entry(conn: &Connection, id: &str) -> MemoryResult<Option<KnowledgeEntry>> {
    let sql = format!("SELECT {} FROM knowledge_entries WHERE id = ?1", ENTRY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], entry_from_row).optional()?)
}

/// Lowercase the department and re-render time bounds so SQL text
/// comparison and `KnowledgeFilter::matches` agree with stored values.
fn normalize_filter(filter: &KnowledgeFilter) -> MemoryResult<KnowledgeFilter> {
    let mut out = filter.clone();
    out.department = filter.department.as_deref().map(|d| d.trim().to_lowercase());
    out.created_after = filter.created_after.as_deref().map(normalize_timestamp).transpose()?;
    out.created_before = filter.created_before.as_deref().map(normalize_timestamp).transpose()?;
    Ok(out)
}

/// Newest-first scan of visible rows. `embedded_dim` restricts to rows
/// carrying a vector of that length; `limit` is pushed to SQL only when the
/// caller guarantees no further filtering happens in Rust.
fn select_visible(
    conn: &Connection,
    filter: &KnowledgeFilter,
    scope: &ReadScope,
    embedded_dim: Option<usize>,
    limit: Option<usize>,
) -> MemoryResult<Vec<KnowledgeEntry>> {
    let sql = format!(
        "SELECT {} FROM knowledge_entries
         WHERE (?1 IS NULL OR department = ?1 OR shared = 1)
           AND (?2 IS NULL OR content_kind = ?2)
           AND (?3 IS NULL OR department = ?3)
           AND (?4 IS NULL OR created_at >= ?4)
           AND (?5 IS NULL OR created_at <= ?5)
           AND (?6 IS NULL OR (embedding IS NOT NULL AND embedding_dim = ?6))
         ORDER BY created_at DESC, id ASC
         LIMIT ?7",
        ENTRY_COLUMNS
    );
    let scope_dept = match scope {
        ReadScope::All => None,
        ReadScope::Department(d) => Some(d.to_lowercase()),
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![
            scope_dept,
            filter.content_kind.map(|k| k.as_str()),
            filter.department,
            filter.created_after,
            filter.created_before,
            embedded_dim.map(|d| d as i64),
            limit.map(|l| l as i64).unwrap_or(-1),
        ],
        entry_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Sort hits by score desc, created_at desc, id asc.
pub(crate) fn rank(hits: &mut [ScoredEntry]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
}

fn keyword_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Fraction of query tokens that appear in the entry's content or metadata.
fn keyword_score(tokens: &[String], entry: &KnowledgeEntry) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let mut haystack = entry.content.to_lowercase();
    for (key, value) in &entry.metadata {
        haystack.push(' ');
        haystack.push_str(&key.to_lowercase());
        haystack.push(' ');
        match value {
            serde_json::Value::String(s) => haystack.push_str(&s.to_lowercase()),
            other => haystack.push_str(&other.to_string().to_lowercase()),
        }
    }
    let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / tokens.len() as f64
}

pub struct KnowledgeStore {
    pool: Arc<ConnectionPool>,
    dimensions: usize,
}

impl KnowledgeStore {
    pub fn new(pool: Arc<ConnectionPool>, dimensions: usize) -> Self {
        KnowledgeStore { pool, dimensions }
    }
}

#[async_trait]
impl KnowledgeBackend for KnowledgeStore {
    async fn store(
        &self,
        caller: &Caller,
        entry: &NewKnowledge,
        embedding: Option<Vec<f32>>,
    ) -> MemoryResult<KnowledgeEntry> {
        if let Some(vec) = &embedding {
            if vec.len() != self.dimensions {
                return Err(MemoryError::validation(format!(
                    "embedding has {} dimensions, store expects {}",
                    vec.len(),
                    self.dimensions
                )));
            }
        }
        let caller = caller.clone();
        let entry = entry.clone();
        self.pool
            .with_conn("store_knowledge", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                require_active_caller(&tx, &caller)?;

                let kind = entry.kind();
                let department = entry
                    .department
                    .as_deref()
                    .unwrap_or(&caller.department)
                    .trim()
                    .to_lowercase();
                authorize(&caller, Target::KnowledgeWrite { department: &department, kind })
                    .map_err(MemoryError::authorization)?;

                let id = match entry.id.as_deref() {
                    Some(id) => id.trim().to_string(),
                    None => uuid::Uuid::new_v4().to_string(),
                };

                // Overwrite guard: the current owner must also permit the write.
                let existing: Option<(String, String)> = tx
                    .query_row(
                        "SELECT department, content_kind FROM knowledge_entries WHERE id = ?1",
                        params![id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((owner_dept, owner_kind)) = &existing {
                    let guarded = if owner_kind == ContentKind::Structured.as_str() {
                        ContentKind::Structured
                    } else {
                        kind
                    };
                    authorize(&caller, Target::KnowledgeWrite { department: owner_dept, kind: guarded })
                        .map_err(MemoryError::authorization)?;
                }

                let now = timestamp_now();
                let metadata = serde_json::to_string(&entry.metadata)?;
                let blob = embedding.as_deref().map(f32_vec_to_bytes);
                let dim = embedding.as_ref().map(|v| v.len() as i64);
                tx.execute(
                    "INSERT INTO knowledge_entries
                        (id, owner_id, department, content_kind, content, metadata, shared,
                         embedding, embedding_dim, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        department = excluded.department,
                        content_kind = excluded.content_kind,
                        content = excluded.content,
                        metadata = excluded.metadata,
                        shared = excluded.shared,
                        embedding = excluded.embedding,
                        embedding_dim = excluded.embedding_dim,
                        updated_at = excluded.updated_at",
                    params![
                        id,
                        caller.id,
                        department,
                        kind.as_str(),
                        entry.content,
                        metadata,
                        entry.shared,
                        blob,
                        dim,
                        now,
                    ],
                )?;
                let stored = load_entry(&tx, &id)?
                    .ok_or_else(|| MemoryError::Internal(format!("entry {} missing after write", id)))?;
                tx.commit()?;

                info!(
                    "[memory::knowledge] {} {} entry {} for {} (embedded: {})",
                    if existing.is_some() { "Updated" } else { "Stored" },
                    kind,
                    stored.id,
                    stored.department,
                    stored.embedding.is_some()
                );
                Ok(stored)
            })
            .await
    }

    async fn get_by_id(&self, id: &str, scope: &ReadScope) -> MemoryResult<Option<KnowledgeEntry>> {
        let id = id.to_string();
        let scope = scope.clone();
        self.pool
            .with_conn("get_knowledge", move |conn| {
                Ok(load_entry(conn, &id)?.filter(|entry| scope.permits(entry)))
            })
            .await
    }

    async fn search_similar(
        &self,
        embedding: &[f32],
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
        min_score: Option<f64>,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        if embedding.len() != self.dimensions {
            return Err(MemoryError::validation(format!(
                "query embedding has {} dimensions, store expects {}",
                embedding.len(),
                self.dimensions
            )));
        }
        let filter = normalize_filter(filter)?;
        let scope = scope.clone();
        let query = embedding.to_vec();
        let dims = self.dimensions;
        self.pool
            .with_conn("search_knowledge", move |conn| {
                let candidates = select_visible(conn, &filter, &scope, Some(dims), None)?;
                let scanned = candidates.len();
                let mut hits: Vec<ScoredEntry> = candidates
                    .into_iter()
                    .filter(|entry| filter.matches(entry))
                    .filter_map(|entry| {
                        let score = entry
                            .embedding
                            .as_deref()
                            .map(|v| cosine_similarity(&query, v))
                            .unwrap_or(0.0);
                        match min_score {
                            Some(min) if score < min => None,
                            _ => Some(ScoredEntry { entry, score }),
                        }
                    })
                    .collect();
                rank(&mut hits);
                hits.truncate(k);
                debug!(
                    "[memory::knowledge] Similarity scan: {} candidates, {} hits",
                    scanned,
                    hits.len()
                );
                Ok(hits)
            })
            .await
    }

    async fn search_keywords(
        &self,
        query: &str,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
        k: usize,
    ) -> MemoryResult<Vec<ScoredEntry>> {
        let tokens = keyword_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let filter = normalize_filter(filter)?;
        let scope = scope.clone();
        self.pool
            .with_conn("search_keywords", move |conn| {
                let candidates = select_visible(conn, &filter, &scope, None, Some(KEYWORD_SCAN_LIMIT))?;
                let mut hits: Vec<ScoredEntry> = candidates
                    .into_iter()
                    .filter(|entry| filter.matches(entry))
                    .filter_map(|entry| {
                        let score = keyword_score(&tokens, &entry);
                        (score > 0.0).then_some(ScoredEntry { entry, score })
                    })
                    .collect();
                rank(&mut hits);
                hits.truncate(k);
                Ok(hits)
            })
            .await
    }

    async fn query_by_metadata(
        &self,
        filter: &KnowledgeFilter,
        scope: &ReadScope,
    ) -> MemoryResult<Vec<KnowledgeEntry>> {
        let filter = normalize_filter(filter)?;
        let scope = scope.clone();
        self.pool
            .with_conn("query_knowledge", move |conn| {
                if filter.metadata.is_empty() {
                    return select_visible(conn, &filter, &scope, None, Some(filter.limit));
                }
                let mut rows = select_visible(conn, &filter, &scope, None, None)?;
                rows.retain(|entry| filter.matches(entry));
                rows.truncate(filter.limit);
                Ok(rows)
            })
            .await
    }
}
