// Colony Memory — shared knowledge, conversation history and performance
// analytics for a fleet of agents.
//
//   atoms/   pure types, errors, constants and backend traits
//   engine/  pool, cache, security, resilience, stores, coordinator

pub mod atoms;
pub mod engine;

pub use atoms::error::{ErrorKind, MemoryError, MemoryResult};
pub use atoms::types::*;
pub use engine::{HealthReport, MemoryConfig, MemoryCoordinator};
