// Colony Memory Engine — pooled SQLite store behind a single coordinator.
// Requests flow security → cache → resilience → store; nothing below the
// coordinator is reachable by agents directly.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod pool;
pub mod resilience;
pub mod security;
pub mod store;

pub use cache::{CacheLayer, CacheValue, Namespace, NamespaceStats};
pub use config::MemoryConfig;
pub use coordinator::{HealthReport, MemoryCoordinator, RouteStats};
pub use pool::{ConnectionPool, PoolSettings, PoolStats};
pub use resilience::{ErrorHandler, RetryPolicy};
pub use security::SecurityValidator;
pub use store::Backends;
