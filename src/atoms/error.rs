// ── Colony Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the memory service, built with `thiserror`.
//
// Design rules:
//   • Every variant classifies into exactly one `ErrorKind`; retry and
//     fallback decisions are made on the kind, never on message text.
//   • `#[from]` wires external error conversions; rusqlite busy/locked
//     conditions are reclassified as transient at conversion time.
//   • "Not found" is not an error: lookups return `Option` / empty vectors.
//   • No variant carries record content or credentials in its message.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

// ── Classification ─────────────────────────────────────────────────────────

/// Coarse classification used by the retry policy and the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    RateLimited,
    TransientStorage,
    PoolExhausted,
    /// Non-transient storage failure (constraint violation, corrupt row…).
    Storage,
    Internal,
}

impl ErrorKind {
    /// Transient kinds are retried by the error handler; all others are terminal.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientStorage | ErrorKind::PoolExhausted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Authorization => "authorization_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientStorage => "transient_storage_error",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Storage => "storage_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed or out-of-bounds payload. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks access to the requested operation or record. Never retried.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Caller exceeded its request quota for the sliding window.
    #[error("Rate limited: retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// Connection failure, timeout or lock contention on the backing store.
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// A backing-store call exceeded its deadline.
    #[error("Timed out after {}ms: {operation}", elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },

    /// No connection lease became available within the acquire timeout.
    #[error("Connection pool exhausted after waiting {}ms", waited.as_millis())]
    PoolExhausted { waited: Duration },

    /// Embedding generator failure (network, bad response). Treated as transient.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Non-transient SQLite failure.
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file is unreadable or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant broken inside the service (task panicked, pool closed…).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout { operation: operation.into(), elapsed }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Validation(_) => ErrorKind::Validation,
            MemoryError::Authorization(_) => ErrorKind::Authorization,
            MemoryError::RateLimited { .. } => ErrorKind::RateLimited,
            MemoryError::Transient(_) | MemoryError::Timeout { .. } | MemoryError::Embedding(_) => {
                ErrorKind::TransientStorage
            }
            MemoryError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            MemoryError::Database(_) | MemoryError::Serialization(_) => ErrorKind::Storage,
            MemoryError::Config(_) => ErrorKind::Validation,
            MemoryError::Io(_) | MemoryError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Retry-after hint for `rate_limited` failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MemoryError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

// ── External conversions ───────────────────────────────────────────────────

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(ffi, _)
                if matches!(
                    ffi.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                MemoryError::Transient(e.to_string())
            }
            _ => MemoryError::Database(e),
        }
    }
}

impl From<reqwest::Error> for MemoryError {
    fn from(e: reqwest::Error) -> Self {
        MemoryError::Embedding(e.to_string())
    }
}

impl From<toml::de::Error> for MemoryError {
    fn from(e: toml::de::Error) -> Self {
        MemoryError::Config(e.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All service operations return this type.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(MemoryError::transient("conn reset").is_transient());
        assert!(MemoryError::timeout("search", Duration::from_millis(5)).is_transient());
        assert!(MemoryError::Embedding("503".into()).is_transient());
        assert!(MemoryError::PoolExhausted { waited: Duration::from_secs(1) }.is_transient());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!MemoryError::validation("too long").is_transient());
        assert!(!MemoryError::authorization("denied").is_transient());
        assert!(!MemoryError::RateLimited { retry_after: Duration::from_secs(3) }.is_transient());
    }

    #[test]
    fn sqlite_busy_maps_to_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err: MemoryError = busy.into();
        assert_eq!(err.kind(), ErrorKind::TransientStorage);
    }

    #[test]
    fn sqlite_constraint_maps_to_storage() {
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let err: MemoryError = constraint.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn rate_limited_exposes_hint() {
        let err = MemoryError::RateLimited { retry_after: Duration::from_millis(1500) };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(err.kind().as_str(), "rate_limited");
    }
}
