// Colony Memory — History Log
// Append-only conversation and action records.
//
// Sequence numbers are allocated per thread by an upsert on
// history_sequences inside the same IMMEDIATE transaction as the insert, so
// concurrent appends to one thread serialize on the write lock and never
// collide; UNIQUE(thread_key, seq) backs this up. Records without a thread
// go to the caller's private key `caller:{caller_id}`. The colon is outside
// the identifier alphabet, so no accepted thread id can share that key.

use super::callers::require_active_caller;
use super::{conversion_error, metadata_from_column};
use crate::atoms::error::MemoryResult;
use crate::atoms::traits::HistoryBackend;
use crate::atoms::types::{timestamp_now, Caller, HistoryRecord, HistoryRole, NewHistoryRecord, RecordKind};
use crate::engine::pool::ConnectionPool;
use async_trait::async_trait;
use log::debug;
use rusqlite::{params, Row, TransactionBehavior};
use std::sync::Arc;

const RECORD_COLUMNS: &str = "id, caller_id, thread_id, seq, role, kind, payload, metadata, created_at";

fn thread_key(caller_id: &str, thread_id: Option<&str>) -> String {
    match thread_id {
        Some(tid) => tid.to_string(),
        None => format!("caller:{}", caller_id),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let role: String = row.get(4)?;
    let kind: String = row.get(5)?;
    let metadata: String = row.get(7)?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        caller_id: row.get(1)?,
        thread_id: row.get(2)?,
        sequence: row.get::<_, i64>(3)?.max(0) as u64,
        role: HistoryRole::parse(&role).ok_or_else(|| conversion_error(4, format!("unknown role '{}'", role)))?,
        kind: RecordKind::parse(&kind).ok_or_else(|| conversion_error(5, format!("unknown kind '{}'", kind)))?,
        payload: row.get(6)?,
        metadata: metadata_from_column(&metadata, 7)?,
        created_at: row.get(8)?,
    })
}

pub struct HistoryLog {
    pool: Arc<ConnectionPool>,
}

impl HistoryLog {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        HistoryLog { pool }
    }
}

#[async_trait]
impl HistoryBackend for HistoryLog {
    async fn append(&self, caller: &Caller, record: &NewHistoryRecord) -> MemoryResult<HistoryRecord> {
        let caller = caller.clone();
        let record = record.clone();
        self.pool
            .with_conn("log_history", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                require_active_caller(&tx, &caller)?;

                let key = thread_key(&caller.id, record.thread_id.as_deref());
                let seq: i64 = tx.query_row(
                    "INSERT INTO history_sequences (thread_key, last_seq) VALUES (?1, 1)
                     ON CONFLICT(thread_key) DO UPDATE SET last_seq = last_seq + 1
                     RETURNING last_seq",
                    params![key],
                    |r| r.get(0),
                )?;

                let stored = HistoryRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    caller_id: caller.id.clone(),
                    thread_id: record.thread_id.clone(),
                    sequence: seq as u64,
                    role: record.role,
                    kind: record.kind,
                    payload: record.payload.clone(),
                    metadata: record.metadata.clone(),
                    created_at: timestamp_now(),
                };
                tx.execute(
                    "INSERT INTO history_records
                        (id, caller_id, thread_id, thread_key, seq, kind, role, payload, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        stored.id,
                        stored.caller_id,
                        stored.thread_id,
                        key,
                        seq,
                        stored.kind.as_str(),
                        stored.role.as_str(),
                        stored.payload,
                        serde_json::to_string(&stored.metadata)?,
                        stored.created_at,
                    ],
                )?;
                tx.commit()?;
                debug!("[memory::history] Appended {}#{} ({})", key, seq, stored.kind.as_str());
                Ok(stored)
            })
            .await
    }

    async fn read_thread(
        &self,
        thread_id: &str,
        since: Option<u64>,
        limit: usize,
    ) -> MemoryResult<Vec<HistoryRecord>> {
        let thread_id = thread_id.to_string();
        self.pool
            .with_conn("read_thread", move |conn| {
                // thread_id IS NOT NULL keeps callers' private keys out of reach.
                let sql = format!(
                    "SELECT {} FROM history_records
                     WHERE thread_key = ?1 AND thread_id IS NOT NULL AND seq > ?2
                     ORDER BY seq ASC LIMIT ?3",
                    RECORD_COLUMNS
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(
                    params![thread_id, since.unwrap_or(0) as i64, limit as i64],
                    record_from_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    async fn read_caller_history(&self, caller_id: &str, limit: usize) -> MemoryResult<Vec<HistoryRecord>> {
        let caller_id = caller_id.to_string();
        self.pool
            .with_conn("read_caller_history", move |conn| {
                let sql = format!(
                    "SELECT {} FROM history_records
                     WHERE caller_id = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT ?2",
                    RECORD_COLUMNS
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![caller_id, limit as i64], record_from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}
