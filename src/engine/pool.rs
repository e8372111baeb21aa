// Colony Memory — Connection Pool
// Bounded set of rusqlite connections to the backing store.
//
//   acquire()    waits (FIFO, via a fair tokio semaphore) up to the acquire
//                timeout, then fails with PoolExhausted
//   Lease        exclusive handle; runs blocking SQLite work on the blocking
//                thread pool under the query timeout
//   release()    returns the connection (healthy) or closes it (unhealthy)
//
// Drop on Lease always gives the permit back, so a cancelled or panicking
// operation never leaks a slot. While blocking work runs, the permit travels
// with it: a query that times out is interrupted, but its slot stays taken
// until the blocking task has actually finished and closed the connection.
// Live connections therefore never exceed `max_size`.

use crate::atoms::constants::{PRE_PING_IDLE_SECS, SQLITE_BUSY_TIMEOUT_MS};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::engine::config::DatabaseConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub path: PathBuf,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub query_timeout: Duration,
    pub recycle_after: Duration,
    pub health_check_interval: Duration,
}

impl PoolSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PoolSettings::from(&DatabaseConfig { path: path.into(), ..DatabaseConfig::default() })
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_recycle_after(mut self, age: Duration) -> Self {
        self.recycle_after = age;
        self
    }
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(db: &DatabaseConfig) -> Self {
        PoolSettings {
            path: db.path.clone(),
            max_size: db.pool_size.max(1),
            acquire_timeout: db.acquire_timeout(),
            query_timeout: db.query_timeout(),
            recycle_after: Duration::from_secs(db.connection_recycle_secs),
            health_check_interval: Duration::from_secs(db.health_check_interval_secs.max(1)),
        }
    }
}

// ── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    acquire_timeouts: AtomicU64,
    query_timeouts: AtomicU64,
    health_checks: AtomicU64,
    replaced: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub acquire_timeouts: u64,
    pub query_timeouts: u64,
    pub health_checks: u64,
    pub replaced: u64,
}

// ── Pooled connection ──────────────────────────────────────────────────────

struct PooledConn {
    conn: Connection,
    created_at: Instant,
    last_used: Instant,
}

fn open_connection(path: &PathBuf) -> MemoryResult<PooledConn> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    let now = Instant::now();
    Ok(PooledConn { conn, created_at: now, last_used: now })
}

fn ping(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
}

// ── Pool ───────────────────────────────────────────────────────────────────

pub struct ConnectionPool {
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConn>>,
    counters: PoolCounters,
}

impl ConnectionPool {
    /// Create the pool and verify the database is reachable. Connections are
    /// otherwise opened lazily, up to `max_size`.
    pub async fn open(settings: PoolSettings) -> MemoryResult<Arc<Self>> {
        if settings.max_size == 0 {
            return Err(MemoryError::Config("pool size must be at least 1".into()));
        }
        info!(
            "[memory::pool] Opening pool at {:?} (max {} connections)",
            settings.path, settings.max_size
        );
        let pool = Arc::new(ConnectionPool {
            permits: Arc::new(Semaphore::new(settings.max_size)),
            idle: Mutex::new(VecDeque::with_capacity(settings.max_size)),
            counters: PoolCounters::default(),
            settings,
        });
        pool.with_conn("open", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await?;
        Ok(pool)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Wait for a lease. Waiters are served in arrival order.
    pub async fn acquire(self: &Arc<Self>) -> MemoryResult<Lease> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(MemoryError::Internal("connection pool closed".into())),
            Err(_) => {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let waited = started.elapsed();
                warn!("[memory::pool] Acquire timed out after {}ms", waited.as_millis());
                return Err(MemoryError::PoolExhausted { waited });
            }
        };
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        let conn = self.idle.lock().pop_back();
        Ok(Lease { conn, pool: Arc::clone(self), healthy: true, permit: Some(permit) })
    }

    /// Acquire, run one unit of blocking work, release. The lease is always
    /// released; transient failures close the connection instead of
    /// returning it.
    pub async fn with_conn<T, F>(self: &Arc<Self>, op: &str, f: F) -> MemoryResult<T>
    where
        F: FnOnce(&mut Connection) -> MemoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut lease = self.acquire().await?;
        let result = lease.run(op, f).await;
        let healthy = !matches!(&result, Err(e) if e.is_transient());
        lease.release(healthy);
        result
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            max_size: self.settings.max_size,
            in_use: self.settings.max_size - self.permits.available_permits(),
            idle: self.idle.lock().len(),
            created: c.created.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            acquire_timeouts: c.acquire_timeouts.load(Ordering::Relaxed),
            query_timeouts: c.query_timeouts.load(Ordering::Relaxed),
            health_checks: c.health_checks.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
        }
    }

    fn checkin(&self, mut pooled: PooledConn) {
        pooled.last_used = Instant::now();
        let mut idle = self.idle.lock();
        if idle.len() < self.settings.max_size {
            idle.push_back(pooled);
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand back a usable connection: open a new one, or ping an idle one
    /// that has been sitting longer than the pre-ping threshold.
    fn prepare(&self, pooled: Option<PooledConn>) -> MemoryResult<PooledConn> {
        if let Some(pooled) = pooled {
            let stale = pooled.last_used.elapsed() > Duration::from_secs(PRE_PING_IDLE_SECS);
            if !stale || ping(&pooled.conn) {
                return Ok(pooled);
            }
            warn!("[memory::pool] Idle connection failed pre-ping, reopening");
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
        let fresh = open_connection(&self.settings.path)?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(fresh)
    }

    /// Probe every idle connection once. Failed or over-age connections are
    /// closed and replaced. Returns how many were replaced.
    pub async fn run_health_check(self: &Arc<Self>) -> MemoryResult<usize> {
        let drained: Vec<PooledConn> = self.idle.lock().drain(..).collect();
        if drained.is_empty() {
            self.counters.health_checks.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }
        let pool = Arc::clone(self);
        let (survivors, replaced) = tokio::task::spawn_blocking(move || {
            let mut survivors = Vec::with_capacity(drained.len());
            let mut replaced = 0usize;
            for pooled in drained {
                let expired = pooled.created_at.elapsed() >= pool.settings.recycle_after;
                if !expired && ping(&pooled.conn) {
                    survivors.push(pooled);
                    continue;
                }
                drop(pooled);
                match open_connection(&pool.settings.path) {
                    Ok(fresh) => {
                        pool.counters.created.fetch_add(1, Ordering::Relaxed);
                        survivors.push(fresh);
                        replaced += 1;
                    }
                    Err(e) => warn!("[memory::pool] Replacement connection failed: {}", e),
                }
            }
            (survivors, replaced)
        })
        .await
        .map_err(|e| MemoryError::Internal(format!("health check task failed: {}", e)))?;

        {
            let mut idle = self.idle.lock();
            for pooled in survivors {
                if idle.len() < self.settings.max_size {
                    idle.push_back(pooled);
                }
            }
        }
        self.counters.health_checks.fetch_add(1, Ordering::Relaxed);
        self.counters.replaced.fetch_add(replaced as u64, Ordering::Relaxed);
        if replaced > 0 {
            info!("[memory::pool] Health check replaced {} connection(s)", replaced);
        }
        Ok(replaced)
    }

    /// Periodic health check. Holds only a weak reference; the task ends
    /// when the pool is dropped.
    pub fn spawn_health_check(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if let Err(e) = pool.run_health_check().await {
                    warn!("[memory::pool] Health check failed: {}", e);
                }
            }
            debug!("[memory::pool] Health check task stopped");
        })
    }
}

// ── Lease ──────────────────────────────────────────────────────────────────

/// Exclusive handle on one pool slot.
pub struct Lease {
    conn: Option<PooledConn>,
    pool: Arc<ConnectionPool>,
    healthy: bool,
    /// `None` once a timed-out task has taken the slot with it.
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Run blocking SQLite work on this lease's connection under the pool's
    /// query timeout. A timeout interrupts the running statement and is
    /// reported as `MemoryError::Timeout`; the lease is spent afterwards.
    pub async fn run<T, F>(&mut self, op: &str, f: F) -> MemoryResult<T>
    where
        F: FnOnce(&mut Connection) -> MemoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let Some(permit) = self.permit.take() else {
            return Err(MemoryError::Internal(format!("{}: lease already spent", op)));
        };
        let pooled = self.conn.take();
        let pool = Arc::clone(&self.pool);
        let interrupt: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));
        let handle_slot = Arc::clone(&interrupt);
        let started = Instant::now();

        // Output fields drop in order: the connection closes before the
        // permit is returned.
        let task = tokio::task::spawn_blocking(move || match pool.prepare(pooled) {
            Ok(mut pooled) => {
                *handle_slot.lock() = Some(pooled.conn.get_interrupt_handle());
                let result = f(&mut pooled.conn);
                handle_slot.lock().take();
                (Some(pooled), permit, result)
            }
            Err(e) => (None, permit, Err(e)),
        });

        match tokio::time::timeout(self.pool.settings.query_timeout, task).await {
            Ok(Ok((conn, permit, result))) => {
                self.conn = conn;
                self.permit = Some(permit);
                if matches!(&result, Err(e) if e.is_transient()) {
                    self.healthy = false;
                }
                result
            }
            Ok(Err(join_err)) => {
                self.healthy = false;
                Err(MemoryError::Internal(format!("storage task failed: {}", join_err)))
            }
            Err(_) => {
                self.healthy = false;
                if let Some(handle) = interrupt.lock().take() {
                    handle.interrupt();
                }
                self.pool.counters.query_timeouts.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                warn!("[memory::pool] {} timed out after {}ms", op, elapsed.as_millis());
                Err(MemoryError::timeout(op, elapsed))
            }
        }
    }

    /// Return the lease. Unhealthy connections are closed, not reused.
    pub fn release(mut self, healthy: bool) {
        self.healthy = self.healthy && healthy;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(pooled) if self.healthy => self.pool.checkin(pooled),
            Some(_) => {
                self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!("[memory::pool] Discarded unhealthy connection");
            }
            None => {
                self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temp_db_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("colony-{}-{}.db", tag, uuid::Uuid::new_v4()))
    }

    async fn small_pool(size: usize) -> Arc<ConnectionPool> {
        let settings = PoolSettings::new(temp_db_path("pool"))
            .with_max_size(size)
            .with_acquire_timeout(Duration::from_millis(200))
            .with_query_timeout(Duration::from_millis(500));
        ConnectionPool::open(settings).await.unwrap()
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let pool = small_pool(2).await;
        for _ in 0..5 {
            let n: i64 = pool
                .with_conn("ping", |c| Ok(c.query_row("SELECT 41 + 1", [], |r| r.get(0))?))
                .await
                .unwrap();
            assert_eq!(n, 42);
        }
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let pool = small_pool(1).await;
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, MemoryError::PoolExhausted { .. }));
        assert!(err.is_transient());
        assert_eq!(pool.stats().acquire_timeouts, 1);
        held.release(true);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_release_discards_connection() {
        let pool = small_pool(1).await;
        let mut lease = pool.acquire().await.unwrap();
        lease.run("touch", |c| Ok(ping(c))).await.unwrap();
        lease.release(false);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert!(stats.discarded >= 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn dropped_lease_frees_slot() {
        let pool = small_pool(1).await;
        {
            let _lease = pool.acquire().await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn timed_out_query_keeps_its_slot_until_it_finishes() {
        let settings = PoolSettings::new(temp_db_path("pool-timeout"))
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_query_timeout(Duration::from_millis(100));
        let pool = ConnectionPool::open(settings).await.unwrap();
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let track = |active: Arc<AtomicU64>, peak: Arc<AtomicU64>, hold: Duration| {
            move |_: &mut Connection| -> MemoryResult<()> {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(hold);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        };

        let err = pool
            .with_conn("slow", track(Arc::clone(&active), Arc::clone(&peak), Duration::from_millis(400)))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Timeout { .. }));
        assert_eq!(pool.stats().query_timeouts, 1);
        assert_eq!(pool.stats().in_use, 1);

        // Waits for the abandoned work, then runs alone.
        pool.with_conn("after", track(Arc::clone(&active), Arc::clone(&peak), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn timeout_interrupts_running_statement() {
        let settings = PoolSettings::new(temp_db_path("pool-interrupt"))
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_query_timeout(Duration::from_millis(100));
        let pool = ConnectionPool::open(settings).await.unwrap();
        let started = Instant::now();
        let err = pool
            .with_conn("runaway", |c| {
                // Unbounded recursive CTE: only an interrupt stops it.
                let n: i64 = c.query_row(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Timeout { .. }));
        assert!(pool.with_conn("after", |c| Ok(ping(c))).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spent_lease_refuses_more_work() {
        let settings = PoolSettings::new(temp_db_path("pool-spent"))
            .with_max_size(1)
            .with_query_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::open(settings).await.unwrap();
        let mut lease = pool.acquire().await.unwrap();
        let slow = lease.run("slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        assert!(matches!(slow.await, Err(MemoryError::Timeout { .. })));
        let again = lease.run("again", |c| Ok(ping(c))).await;
        assert!(matches!(again, Err(MemoryError::Internal(_))));
    }

    #[tokio::test]
    async fn health_check_recycles_old_connections() {
        let settings = PoolSettings::new(temp_db_path("pool-recycle"))
            .with_max_size(2)
            .with_recycle_after(Duration::from_millis(0));
        let pool = ConnectionPool::open(settings).await.unwrap();
        assert_eq!(pool.stats().idle, 1);
        let replaced = pool.run_health_check().await.unwrap();
        assert_eq!(replaced, 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.health_checks, 1);
    }
}
