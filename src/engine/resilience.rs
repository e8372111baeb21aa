// Colony Memory — Error Handler
// Retry + fallback policy wrapped around every storage call, and the
// per-component health tracker the coordinator reports from.
//
//   • Exponential backoff with ±25% jitter, capped, small attempt count
//   • Only transient kinds (timeouts, busy/locked, pool exhaustion) retry
//   • One health sample per call after retries, not per attempt
//   • Fallback substitution is opt-in and used by read paths only

use crate::atoms::error::{ErrorKind, MemoryError, MemoryResult};
use crate::atoms::types::{timestamp_now, Component, HealthStatus};
use crate::engine::config::{HealthConfig, RetryConfig};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

// ── Backoff ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base · 2^attempt,
    /// capped, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
        let capped = exp_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(apply_jitter(capped))
    }
}

/// ±25% jitter so concurrent retries do not line up.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms;
    }
    let offset = (rand_jitter() % (2 * jitter_range + 1)) - jitter_range;
    (base_ms as i64 + offset).max(1) as u64
}

/// Jitter source from the clock's sub-second nanos.
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

/// Failures that say something about the component's health. Validation,
/// authorization and rate-limit rejections are the caller's problem.
fn counts_against_component(err: &MemoryError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TransientStorage | ErrorKind::PoolExhausted | ErrorKind::Storage | ErrorKind::Internal
    )
}

// ── Component health ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ComponentHealth {
    recent: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    last_error: Option<String>,
    last_failure_at: Option<String>,
}

impl ComponentHealth {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while self.recent.front().is_some_and(|(t, _)| now.duration_since(*t) > window) {
            self.recent.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.recent.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentReport {
    pub component: Component,
    pub status: HealthStatus,
    pub failure_rate: f64,
    pub recent_calls: usize,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub retries: u64,
    pub exhausted: u64,
    pub fallbacks: u64,
}

// ── Handler ────────────────────────────────────────────────────────────────

pub struct ErrorHandler {
    policy: RetryPolicy,
    health: HealthConfig,
    components: Mutex<HashMap<Component, ComponentHealth>>,
    retries: AtomicU64,
    exhausted: AtomicU64,
    fallbacks: AtomicU64,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy, health: HealthConfig) -> Self {
        ErrorHandler {
            policy,
            health,
            components: Mutex::new(HashMap::new()),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `f`, retrying transient failures. Terminal failures return at once.
    pub async fn retry<T, F, Fut>(&self, op: &str, mut f: F) -> MemoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("[memory::retry] {} succeeded on attempt {}", op, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "[memory::retry] {} attempt {}/{} failed ({}), retrying in {}ms",
                        op,
                        attempt + 1,
                        self.policy.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "[memory::retry] {} gave up after {} attempt(s): {}",
                            op,
                            attempt + 1,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `retry` plus one health sample for `component`.
    pub async fn with_retry<T, F, Fut>(&self, component: Component, op: &str, f: F) -> MemoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let result = self.retry(op, f).await;
        match &result {
            Ok(_) => self.record_success(component),
            Err(e) if counts_against_component(e) => self.record_failure(component, e),
            Err(_) => {}
        }
        result
    }

    /// Read-path variant: when the component fails after retries,
    /// `fallback` may supply a substitute value. Returns the value and
    /// whether it came from the fallback.
    pub async fn with_fallback<T, F, Fut, B>(
        &self,
        component: Component,
        op: &str,
        f: F,
        fallback: B,
    ) -> MemoryResult<(T, bool)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
        B: FnOnce() -> Option<T>,
    {
        match self.with_retry(component, op, f).await {
            Ok(value) => Ok((value, false)),
            Err(e) if counts_against_component(&e) => match fallback() {
                Some(value) => {
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!("[memory::retry] {} served fallback after failure: {}", op, e);
                    Ok((value, true))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub fn record_success(&self, component: Component) {
        let mut components = self.components.lock();
        let health = components.entry(component).or_default();
        health.recent.push_back((Instant::now(), true));
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.prune(Duration::from_secs(self.health.window_secs));
    }

    pub fn record_failure(&self, component: Component, err: &MemoryError) {
        let mut components = self.components.lock();
        let health = components.entry(component).or_default();
        health.recent.push_back((Instant::now(), false));
        health.consecutive_failures += 1;
        health.total_failures += 1;
        health.last_error = Some(format!("{}: {}", err.kind().as_str(), err));
        health.last_failure_at = Some(timestamp_now());
        health.prune(Duration::from_secs(self.health.window_secs));
    }

    pub fn status(&self, component: Component) -> HealthStatus {
        self.report(component).status
    }

    pub fn report(&self, component: Component) -> ComponentReport {
        let mut components = self.components.lock();
        let health = components.entry(component).or_default();
        health.prune(Duration::from_secs(self.health.window_secs));
        let failure_rate = health.failure_rate();
        let status = if health.consecutive_failures >= self.health.unavailable_consecutive_failures {
            HealthStatus::Unavailable
        } else if !health.recent.is_empty() && failure_rate >= self.health.degraded_failure_rate {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        ComponentReport {
            component,
            status,
            failure_rate,
            recent_calls: health.recent.len(),
            consecutive_failures: health.consecutive_failures,
            total_successes: health.total_successes,
            total_failures: health.total_failures,
            last_error: health.last_error.clone(),
            last_failure_at: health.last_failure_at.clone(),
        }
    }

    /// Unavailable only when every component is; degraded when any one is
    /// not healthy.
    pub fn overall(&self) -> HealthStatus {
        let statuses: Vec<HealthStatus> = Component::ALL.iter().map(|c| self.status(*c)).collect();
        if statuses.iter().all(|s| *s == HealthStatus::Unavailable) {
            HealthStatus::Unavailable
        } else if statuses.iter().any(|s| *s != HealthStatus::Healthy) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}
