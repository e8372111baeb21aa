// Database schema and migrations for the colony memory store.
// Called once when the store is opened, on a pooled connection.
// Adding a table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN (errors swallowed) at the end of
// run_migrations(). Never edit existing DDL.
//
// Timestamps are RFC 3339 text with microseconds, UTC, so lexical order is
// chronological. Rows referencing a caller are never deleted; callers are
// retired, not removed.

use crate::atoms::error::MemoryResult;
use log::info;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> MemoryResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS callers (
            id TEXT PRIMARY KEY,
            department TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            retired_at TEXT
        );

        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL REFERENCES callers(id) ON DELETE RESTRICT,
            department TEXT NOT NULL,
            content_kind TEXT NOT NULL CHECK (content_kind IN ('structured', 'unstructured')),
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            shared INTEGER NOT NULL DEFAULT 0,
            embedding BLOB,
            embedding_dim INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_knowledge_department
            ON knowledge_entries(department, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_knowledge_embedded
            ON knowledge_entries(embedding_dim) WHERE embedding IS NOT NULL;

        CREATE TABLE IF NOT EXISTS history_sequences (
            thread_key TEXT PRIMARY KEY,
            last_seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history_records (
            id TEXT PRIMARY KEY,
            caller_id TEXT NOT NULL REFERENCES callers(id) ON DELETE RESTRICT,
            thread_id TEXT,
            thread_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('message', 'action')),
            role TEXT NOT NULL CHECK (role IN ('caller', 'system', 'peer')),
            payload TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE (thread_key, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_history_caller
            ON history_records(caller_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS analytics_aggregates (
            caller_id TEXT NOT NULL REFERENCES callers(id) ON DELETE RESTRICT,
            task_category TEXT NOT NULL,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            total_latency_ms INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (caller_id, task_category)
        );

        CREATE INDEX IF NOT EXISTS idx_analytics_category
            ON analytics_aggregates(task_category);

        CREATE TABLE IF NOT EXISTS outcome_events (
            event_id TEXT PRIMARY KEY,
            caller_id TEXT NOT NULL,
            task_category TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        ",
    )?;

    info!("[memory::store] Schema ready");
    Ok(())
}
