// Colony Memory — Caller Registry
// Callers are provisioned once and retired (soft-deleted), never removed.
// `require_active_caller` is the guard every write transaction runs first.

use super::conversion_error;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::CallerRegistry;
use crate::atoms::types::{timestamp_now, Caller, CallerRecord};
use crate::engine::pool::ConnectionPool;
use async_trait::async_trait;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

fn load(conn: &Connection, caller_id: &str) -> MemoryResult<Option<CallerRecord>> {
    let row = conn
        .query_row(
            "SELECT id, department, role, created_at, retired_at FROM callers WHERE id = ?1",
            params![caller_id],
            |row| {
                Ok(CallerRecord {
                    caller: Caller {
                        id: row.get(0)?,
                        department: row.get(1)?,
                        role: row.get(2)?,
                    },
                    created_at: row.get(3)?,
                    retired_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// The caller must exist, be active, and still belong to the department it
/// claims. Runs inside the write transaction.
pub(crate) fn require_active_caller(conn: &Connection, caller: &Caller) -> MemoryResult<()> {
    match load(conn, &caller.id)? {
        None => Err(MemoryError::authorization(format!("caller '{}' is not registered", caller.id))),
        Some(record) if record.retired_at.is_some() => {
            Err(MemoryError::authorization(format!("caller '{}' has been retired", caller.id)))
        }
        Some(record) if !record.caller.department.eq_ignore_ascii_case(caller.department.trim()) => {
            Err(MemoryError::authorization(format!(
                "caller '{}' is registered to a different department",
                caller.id
            )))
        }
        Some(_) => Ok(()),
    }
}

pub struct CallerDirectory {
    pool: Arc<ConnectionPool>,
}

impl CallerDirectory {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        CallerDirectory { pool }
    }
}

#[async_trait]
impl CallerRegistry for CallerDirectory {
    async fn register(&self, caller: &Caller) -> MemoryResult<CallerRecord> {
        let caller = Caller {
            id: caller.id.trim().to_string(),
            department: caller.department.trim().to_lowercase(),
            role: caller.role.trim().to_string(),
        };
        self.pool
            .with_conn("register_caller", move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                if let Some(existing) = load(&tx, &caller.id)? {
                    if !existing.caller.department.eq_ignore_ascii_case(&caller.department) {
                        return Err(MemoryError::authorization(format!(
                            "caller '{}' is already registered to another department",
                            caller.id
                        )));
                    }
                    if existing.retired_at.is_some() {
                        tx.execute("UPDATE callers SET retired_at = NULL WHERE id = ?1", params![caller.id])?;
                        info!("[memory::callers] Reactivated caller '{}'", caller.id);
                    }
                } else {
                    tx.execute(
                        "INSERT INTO callers (id, department, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                        params![caller.id, caller.department, caller.role, timestamp_now()],
                    )?;
                    info!(
                        "[memory::callers] Registered '{}' ({})",
                        caller.id, caller.department
                    );
                }
                let record = load(&tx, &caller.id)?
                    .ok_or_else(|| MemoryError::Database(conversion_error(0, "caller vanished")))?;
                tx.commit()?;
                Ok(record)
            })
            .await
    }

    async fn retire(&self, caller_id: &str) -> MemoryResult<bool> {
        let caller_id = caller_id.to_string();
        self.pool
            .with_conn("retire_caller", move |conn| {
                let changed = conn.execute(
                    "UPDATE callers SET retired_at = ?2 WHERE id = ?1 AND retired_at IS NULL",
                    params![caller_id, timestamp_now()],
                )?;
                if changed > 0 {
                    info!("[memory::callers] Retired '{}'", caller_id);
                }
                Ok(changed > 0)
            })
            .await
    }

    async fn get(&self, caller_id: &str) -> MemoryResult<Option<CallerRecord>> {
        let caller_id = caller_id.to_string();
        self.pool.with_conn("get_caller", move |conn| load(conn, &caller_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::test_support::sqlite_backends;

    #[tokio::test]
    async fn register_is_idempotent_and_normalizes() {
        let (_pool, b) = sqlite_backends(8).await;
        let first = b.callers.register(&Caller::new("sales-agent-1", " Sales ")).await.unwrap();
        let again = b.callers.register(&Caller::new("sales-agent-1", "sales")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.caller.department, "sales");
    }

    #[tokio::test]
    async fn department_cannot_change_on_reregistration() {
        let (_pool, b) = sqlite_backends(8).await;
        b.callers.register(&Caller::new("a", "sales")).await.unwrap();
        let err = b.callers.register(&Caller::new("a", "finance")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Authorization(_)));
    }

    #[tokio::test]
    async fn retire_is_soft_and_reversible() {
        let (pool, b) = sqlite_backends(8).await;
        let caller = Caller::new("a", "sales");
        b.callers.register(&caller).await.unwrap();
        assert!(b.callers.retire("a").await.unwrap());
        assert!(!b.callers.retire("a").await.unwrap());
        assert!(!b.callers.retire("ghost").await.unwrap());
        let record = b.callers.get("a").await.unwrap().unwrap();
        assert!(record.retired_at.is_some());

        let guard = caller.clone();
        let err = pool
            .with_conn("guard", move |conn| require_active_caller(conn, &guard))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("retired"));

        b.callers.register(&caller).await.unwrap();
        assert!(b.callers.get("a").await.unwrap().unwrap().retired_at.is_none());
    }

    #[tokio::test]
    async fn unknown_caller_fails_guard() {
        let (pool, _b) = sqlite_backends(8).await;
        let err = pool
            .with_conn("guard", |conn| require_active_caller(conn, &Caller::new("ghost", "sales")))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Authorization(_)));
    }
}
