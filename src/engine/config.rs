// Colony Memory — Service Configuration
// One serde model for every tunable. Values come from (lowest to highest
// priority): built-in defaults, an optional TOML file, environment overrides.
// `validate()` runs last and reports every problem at once.
//
// All numeric defaults are tuning defaults, not invariants.

use crate::atoms::constants::*;
use crate::atoms::error::{MemoryError, MemoryResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Created on first open.
    pub path: PathBuf,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    /// Connections older than this are closed and reopened by the health check.
    pub connection_recycle_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("colony-memory.db"),
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            connection_recycle_secs: DEFAULT_CONNECTION_RECYCLE_SECS,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl NamespaceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub knowledge: NamespaceConfig,
    pub history: NamespaceConfig,
    pub analytics: NamespaceConfig,
    pub similarity: NamespaceConfig,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            knowledge: NamespaceConfig { ttl_secs: KNOWLEDGE_CACHE_TTL_SECS, max_entries: KNOWLEDGE_CACHE_MAX_ENTRIES },
            history: NamespaceConfig { ttl_secs: HISTORY_CACHE_TTL_SECS, max_entries: HISTORY_CACHE_MAX_ENTRIES },
            analytics: NamespaceConfig { ttl_secs: ANALYTICS_CACHE_TTL_SECS, max_entries: ANALYTICS_CACHE_MAX_ENTRIES },
            similarity: NamespaceConfig { ttl_secs: SIMILARITY_CACHE_TTL_SECS, max_entries: SIMILARITY_CACHE_MAX_ENTRIES },
            sweep_interval_secs: CACHE_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_content_length: usize,
    pub max_metadata_size: usize,
    pub max_query_length: usize,
    /// Requests allowed per caller within `rate_limit_window_secs`.
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            max_content_length: MAX_CONTENT_LENGTH,
            max_metadata_size: MAX_METADATA_SIZE,
            max_query_length: MAX_QUERY_LENGTH,
            rate_limit_requests: DEFAULT_RATE_LIMIT_REQUESTS,
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Offline deterministic feature hashing. No network.
    Local,
    Ollama,
    /// Any OpenAI-compatible `/v1/embeddings` endpoint.
    Openai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    /// Name of the environment variable holding the bearer key. The key itself
    /// never lives in the config file.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: EmbeddingProviderKind::Local,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            dimensions: DEFAULT_VECTOR_DIMENSION,
            api_key_env: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Outcomes older than this no longer count toward the failure rate.
    pub window_secs: u64,
    pub degraded_failure_rate: f64,
    pub unavailable_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            window_secs: DEFAULT_HEALTH_WINDOW_SECS,
            degraded_failure_rate: DEFAULT_DEGRADED_FAILURE_RATE,
            unavailable_consecutive_failures: DEFAULT_UNAVAILABLE_CONSECUTIVE,
        }
    }
}

// ── Root ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub security: SecurityConfig,
    pub embedding: EmbeddingConfig,
    pub health: HealthConfig,
    pub log_level: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            security: SecurityConfig::default(),
            embedding: EmbeddingConfig::default(),
            health: HealthConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl MemoryConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(raw: &str) -> MemoryResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML file, apply process environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!("[memory::config] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> MemoryResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Override hook with an injectable lookup so tests never touch the
    /// process environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("COLONY_MEMORY_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(size) = parse_override::<usize>(&lookup, "DB_POOL_SIZE") {
            self.database.pool_size = size;
        }
        if let Some(size) = parse_override::<usize>(&lookup, "MEMORY_CACHE_SIZE") {
            // One knob scales every namespace, keeping their relative sizes.
            let base = self.cache.knowledge.max_entries.max(1);
            let scale = |n: usize| ((n as f64 * size as f64 / base as f64).round() as usize).max(1);
            self.cache.history.max_entries = scale(self.cache.history.max_entries);
            self.cache.analytics.max_entries = scale(self.cache.analytics.max_entries);
            self.cache.similarity.max_entries = scale(self.cache.similarity.max_entries);
            self.cache.knowledge.max_entries = size;
        }
        if let Some(dim) = parse_override::<usize>(&lookup, "MEMORY_VECTOR_DIMENSION") {
            self.embedding.dimensions = dim;
        }
        if let Some(model) = lookup("MEMORY_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
    }

    /// Reject configurations that would make the service misbehave.
    pub fn validate(&self) -> MemoryResult<()> {
        let mut problems = Vec::new();

        if self.database.pool_size == 0 {
            problems.push("database.pool_size must be at least 1".to_string());
        }
        if self.database.acquire_timeout_ms == 0 {
            problems.push("database.acquire_timeout_ms must be positive".to_string());
        }
        if self.database.query_timeout_ms == 0 {
            problems.push("database.query_timeout_ms must be positive".to_string());
        }
        for (name, ns) in [
            ("knowledge", &self.cache.knowledge),
            ("history", &self.cache.history),
            ("analytics", &self.cache.analytics),
            ("similarity", &self.cache.similarity),
        ] {
            if ns.max_entries == 0 {
                problems.push(format!("cache.{}.max_entries must be at least 1", name));
            }
            if ns.ttl_secs == 0 {
                problems.push(format!("cache.{}.ttl_secs must be positive", name));
            }
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            problems.push("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if self.security.rate_limit_requests == 0 || self.security.rate_limit_window_secs == 0 {
            problems.push("security rate limit requests and window must be positive".to_string());
        }
        if self.security.max_content_length == 0 || self.security.max_content_length > MAX_CONTENT_LENGTH {
            problems.push(format!("security.max_content_length must be in 1..={}", MAX_CONTENT_LENGTH));
        }
        if self.embedding.dimensions == 0 {
            problems.push("embedding.dimensions must be positive".to_string());
        }
        if self.embedding.provider != EmbeddingProviderKind::Local && self.embedding.base_url.trim().is_empty() {
            problems.push("embedding.base_url is required for remote providers".to_string());
        }
        if !(0.0..=1.0).contains(&self.health.degraded_failure_rate) {
            problems.push("health.degraded_failure_rate must be within 0.0..=1.0".to_string());
        }
        if self.health.unavailable_consecutive_failures == 0 {
            problems.push("health.unavailable_consecutive_failures must be at least 1".to_string());
        }
        if !matches!(self.log_level.as_str(), "error" | "warn" | "info" | "debug" | "trace" | "off") {
            problems.push(format!("log_level '{}' is not a recognised level", self.log_level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MemoryError::Config(problems.join("; ")))
        }
    }
}

fn parse_override<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[memory::config] Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}
