// ── Colony Atoms: Constants ────────────────────────────────────────────────
// Named constants shared by every layer. Tunable values live in
// `engine::config`; these are either hard protocol limits or the defaults
// the config layer falls back to.

// ── Payload bounds ─────────────────────────────────────────────────────────
// Enforced by the security validator before any cache or storage access.
pub const MAX_CONTENT_LENGTH: usize = 100_000;
pub const MAX_METADATA_SIZE: usize = 10_000;
pub const MAX_METADATA_KEY_LENGTH: usize = 100;
pub const MAX_NESTED_METADATA_SIZE: usize = 1_000;
pub const MAX_QUERY_LENGTH: usize = 1_000;
pub const MAX_CALLER_ID_LENGTH: usize = 255;
pub const MAX_DEPARTMENT_LENGTH: usize = 100;
pub const MAX_TASK_CATEGORY_LENGTH: usize = 100;
pub const MAX_THREAD_ID_LENGTH: usize = 255;
pub const MAX_SEARCH_K: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1_000;

// ── Embeddings ─────────────────────────────────────────────────────────────
pub const DEFAULT_VECTOR_DIMENSION: usize = 1536;

// ── Cache defaults (seconds / entries) ─────────────────────────────────────
pub const KNOWLEDGE_CACHE_TTL_SECS: u64 = 3_600;
pub const HISTORY_CACHE_TTL_SECS: u64 = 1_800;
pub const ANALYTICS_CACHE_TTL_SECS: u64 = 7_200;
pub const SIMILARITY_CACHE_TTL_SECS: u64 = 900;
pub const KNOWLEDGE_CACHE_MAX_ENTRIES: usize = 500;
pub const HISTORY_CACHE_MAX_ENTRIES: usize = 300;
pub const ANALYTICS_CACHE_MAX_ENTRIES: usize = 200;
pub const SIMILARITY_CACHE_MAX_ENTRIES: usize = 100;
pub const CACHE_SWEEP_INTERVAL_SECS: u64 = 300;

// ── Connection pool defaults ───────────────────────────────────────────────
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CONNECTION_RECYCLE_SECS: u64 = 300;
// Idle connections older than this are pinged before being handed out.
pub const PRE_PING_IDLE_SECS: u64 = 30;
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

// ── Retry defaults ─────────────────────────────────────────────────────────
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;

// ── Rate limiting defaults ─────────────────────────────────────────────────
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 120;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// ── Health rollup defaults ─────────────────────────────────────────────────
pub const DEFAULT_HEALTH_WINDOW_SECS: u64 = 300;
pub const DEFAULT_DEGRADED_FAILURE_RATE: f64 = 0.5;
pub const DEFAULT_UNAVAILABLE_CONSECUTIVE: u32 = 5;

// ── Insight thresholds ─────────────────────────────────────────────────────
pub(crate) const SLOW_TASK_LATENCY_MS: f64 = 5_000.0;
pub(crate) const BENCHMARK_GAP: f64 = 0.2;

// Log previews never exceed this many characters.
pub(crate) const LOG_PREVIEW_CHARS: usize = 60;

// Keyword fallback scans at most this many of the newest visible entries.
pub(crate) const KEYWORD_SCAN_LIMIT: usize = 5_000;
