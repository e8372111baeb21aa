// Colony Memory — Security Validator
// Gate in front of every coordinator operation. Runs, in order:
//
//   1. shape / size bounds
//   2. content screening (reject, never strip)
//   3. access policy (department table, pure)
//   4. per-caller sliding-window rate limit
//
// Synchronous and storage-free: it runs before any cache lookup, so a
// rejected request never reaches the backing store.

pub mod policy;
pub mod rate_limit;
pub mod sanitize;

use crate::atoms::constants::*;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{
    Caller, ContentKind, InsightsSubject, KnowledgeFilter, NewHistoryRecord, NewKnowledge,
    OperationKind, OutcomeEvent, ReadScope, SearchRequest,
};
use crate::engine::config::SecurityConfig;
use log::warn;
use policy::Target;
use rate_limit::RateLimiter;
use sanitize::{check_identifier, screen_metadata, screen_text, TextKind};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// Largest latency accepted for an outcome: one day.
const MAX_OUTCOME_LATENCY_MS: u64 = 86_400_000;

/// One inbound request, borrowed from the coordinator's arguments.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    StoreKnowledge(&'a NewKnowledge),
    SearchKnowledge(&'a SearchRequest),
    GetKnowledge { id: &'a str },
    QueryKnowledge(&'a KnowledgeFilter),
    LogHistory(&'a NewHistoryRecord),
    ReadThread { thread_id: &'a str, since: Option<u64>, limit: usize },
    ReadCallerHistory { caller_id: &'a str, limit: usize },
    RecordOutcome(&'a OutcomeEvent),
    GetInsights(&'a InsightsSubject),
    RegisterCaller(&'a Caller),
    RetireCaller { caller_id: &'a str },
}

impl Request<'_> {
    pub fn operation(&self) -> OperationKind {
        match self {
            Request::StoreKnowledge(_) => OperationKind::StoreKnowledge,
            Request::SearchKnowledge(_) => OperationKind::SearchKnowledge,
            Request::GetKnowledge { .. } => OperationKind::GetKnowledge,
            Request::QueryKnowledge(_) => OperationKind::QueryKnowledge,
            Request::LogHistory(_) => OperationKind::LogHistory,
            Request::ReadThread { .. } | Request::ReadCallerHistory { .. } => OperationKind::ReadHistory,
            Request::RecordOutcome(_) => OperationKind::RecordOutcome,
            Request::GetInsights(_) => OperationKind::GetInsights,
            Request::RegisterCaller(_) => OperationKind::RegisterCaller,
            Request::RetireCaller { .. } => OperationKind::RetireCaller,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub validated: u64,
    pub rejected_validation: u64,
    pub rejected_authorization: u64,
    pub rejected_rate_limited: u64,
}

#[derive(Default)]
struct Counters {
    validated: AtomicU64,
    validation: AtomicU64,
    authorization: AtomicU64,
    rate_limited: AtomicU64,
}

pub struct SecurityValidator {
    limits: SecurityConfig,
    vector_dimension: usize,
    limiter: RateLimiter,
    counters: Counters,
}

impl SecurityValidator {
    pub fn new(limits: SecurityConfig, vector_dimension: usize) -> Self {
        let limiter = RateLimiter::new(
            limits.rate_limit_requests,
            Duration::from_secs(limits.rate_limit_window_secs),
        );
        SecurityValidator { limits, vector_dimension, limiter, counters: Counters::default() }
    }

    /// Accept or reject one request. On success returns the caller's read
    /// scope, which downstream queries use to filter visibility.
    pub fn validate(&self, caller: &Caller, request: &Request<'_>) -> MemoryResult<ReadScope> {
        let op = request.operation();
        let outcome = self
            .check_shape(caller, request)
            .and_then(|_| self.check_policy(caller, request))
            .and_then(|_| {
                self.limiter
                    .check(&caller.id)
                    .map_err(|retry_after| MemoryError::RateLimited { retry_after })
            });

        match outcome {
            Ok(()) => {
                self.counters.validated.fetch_add(1, Ordering::Relaxed);
                Ok(policy::read_scope(caller))
            }
            Err(e) => {
                let counter = match &e {
                    MemoryError::Authorization(_) => &self.counters.authorization,
                    MemoryError::RateLimited { .. } => &self.counters.rate_limited,
                    _ => &self.counters.validation,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                warn!("[memory::security] Rejected {} from '{}': {}", op, caller.id, e);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> SecurityStats {
        SecurityStats {
            validated: self.counters.validated.load(Ordering::Relaxed),
            rejected_validation: self.counters.validation.load(Ordering::Relaxed),
            rejected_authorization: self.counters.authorization.load(Ordering::Relaxed),
            rejected_rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    // ── Steps 1 + 2: bounds and screening ──────────────────────────────────

    fn check_caller(&self, caller: &Caller) -> MemoryResult<()> {
        check_identifier("caller_id", &caller.id, MAX_CALLER_ID_LENGTH)?;
        check_identifier("department", &caller.department, MAX_DEPARTMENT_LENGTH)?;
        if !caller.role.is_empty() {
            check_identifier("role", &caller.role, MAX_DEPARTMENT_LENGTH)?;
        }
        Ok(())
    }

    fn check_limit(&self, limit: usize) -> MemoryResult<()> {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(MemoryError::validation(format!("limit must be within 1..={}", MAX_QUERY_LIMIT)));
        }
        Ok(())
    }

    fn check_filter(&self, filter: &KnowledgeFilter) -> MemoryResult<()> {
        self.check_limit(filter.limit)?;
        if let Some(dept) = &filter.department {
            check_identifier("filter.department", dept, MAX_DEPARTMENT_LENGTH)?;
        }
        for bound in [&filter.created_after, &filter.created_before].into_iter().flatten() {
            if chrono::DateTime::parse_from_rfc3339(bound).is_err() {
                return Err(MemoryError::validation("time filters must be RFC 3339 timestamps"));
            }
        }
        screen_metadata(&filter.metadata, self.limits.max_metadata_size)
    }

    fn check_content(&self, field: &str, text: &str, kind: TextKind) -> MemoryResult<()> {
        if text.trim().is_empty() {
            return Err(MemoryError::validation(format!("{} is required", field)));
        }
        if text.chars().count() > self.limits.max_content_length {
            return Err(MemoryError::validation(format!(
                "{} exceeds {} characters",
                field, self.limits.max_content_length
            )));
        }
        screen_text(field, text, kind)
    }

    fn check_shape(&self, caller: &Caller, request: &Request<'_>) -> MemoryResult<()> {
        self.check_caller(caller)?;
        match request {
            Request::StoreKnowledge(entry) => {
                self.check_content("content", &entry.content, TextKind::Knowledge)?;
                if entry.kind() == ContentKind::Structured {
                    let parsed: serde_json::Value = serde_json::from_str(&entry.content)
                        .map_err(|_| MemoryError::validation("structured content must be valid JSON"))?;
                    if !parsed.is_object() {
                        return Err(MemoryError::validation("structured content must be a JSON object"));
                    }
                }
                if let Some(id) = &entry.id {
                    check_identifier("id", id, MAX_CALLER_ID_LENGTH)?;
                }
                if let Some(dept) = &entry.department {
                    check_identifier("department", dept, MAX_DEPARTMENT_LENGTH)?;
                }
                if let Some(embedding) = &entry.embedding {
                    if embedding.len() != self.vector_dimension {
                        return Err(MemoryError::validation(format!(
                            "embedding must have {} dimensions, got {}",
                            self.vector_dimension,
                            embedding.len()
                        )));
                    }
                    if embedding.iter().any(|v| !v.is_finite()) {
                        return Err(MemoryError::validation("embedding contains non-finite values"));
                    }
                }
                screen_metadata(&entry.metadata, self.limits.max_metadata_size)
            }
            Request::SearchKnowledge(search) => {
                if search.query.trim().is_empty() {
                    return Err(MemoryError::validation("query is required"));
                }
                if search.query.chars().count() > self.limits.max_query_length {
                    return Err(MemoryError::validation(format!(
                        "query exceeds {} characters",
                        self.limits.max_query_length
                    )));
                }
                screen_text("query", &search.query, TextKind::Query)?;
                if search.k == 0 || search.k > MAX_SEARCH_K {
                    return Err(MemoryError::validation(format!("k must be within 1..={}", MAX_SEARCH_K)));
                }
                if let Some(min) = search.min_score {
                    if !min.is_finite() || !(-1.0..=1.0).contains(&min) {
                        return Err(MemoryError::validation("min_score must be within -1.0..=1.0"));
                    }
                }
                self.check_filter(&search.filter)
            }
            Request::GetKnowledge { id } => check_identifier("id", id, MAX_CALLER_ID_LENGTH),
            Request::QueryKnowledge(filter) => self.check_filter(filter),
            Request::LogHistory(record) => {
                self.check_content("payload", &record.payload, TextKind::Record)?;
                if let Some(thread) = &record.thread_id {
                    check_identifier("thread_id", thread, MAX_THREAD_ID_LENGTH)?;
                }
                if let Some(outcome) = &record.outcome {
                    check_identifier("task_category", &outcome.task_category, MAX_TASK_CATEGORY_LENGTH)?;
                    if outcome.latency_ms > MAX_OUTCOME_LATENCY_MS {
                        return Err(MemoryError::validation("latency_ms is out of range"));
                    }
                }
                screen_metadata(&record.metadata, self.limits.max_metadata_size)
            }
            Request::ReadThread { thread_id, limit, .. } => {
                check_identifier("thread_id", thread_id, MAX_THREAD_ID_LENGTH)?;
                self.check_limit(*limit)
            }
            Request::ReadCallerHistory { caller_id, limit } => {
                check_identifier("caller_id", caller_id, MAX_CALLER_ID_LENGTH)?;
                self.check_limit(*limit)
            }
            Request::RecordOutcome(event) => {
                check_identifier("task_category", &event.task_category, MAX_TASK_CATEGORY_LENGTH)?;
                if event.latency_ms > MAX_OUTCOME_LATENCY_MS {
                    return Err(MemoryError::validation("latency_ms is out of range"));
                }
                if let Some(event_id) = &event.event_id {
                    check_identifier("event_id", event_id, MAX_CALLER_ID_LENGTH)?;
                }
                Ok(())
            }
            Request::GetInsights(subject) => match subject {
                InsightsSubject::Caller(id) => check_identifier("caller_id", id, MAX_CALLER_ID_LENGTH),
                InsightsSubject::Category(cat) => {
                    check_identifier("task_category", cat, MAX_TASK_CATEGORY_LENGTH)
                }
            },
            Request::RegisterCaller(target) => self.check_caller(target),
            Request::RetireCaller { caller_id } => check_identifier("caller_id", caller_id, MAX_CALLER_ID_LENGTH),
        }
    }

    // ── Step 3: policy ─────────────────────────────────────────────────────

    fn check_policy(&self, caller: &Caller, request: &Request<'_>) -> MemoryResult<()> {
        let target = match request {
            Request::StoreKnowledge(entry) => Target::KnowledgeWrite {
                department: entry.department.as_deref().unwrap_or(&caller.department),
                kind: entry.kind(),
            },
            Request::SearchKnowledge(_) | Request::GetKnowledge { .. } | Request::QueryKnowledge(_) => {
                Target::KnowledgeRead
            }
            Request::LogHistory(_) | Request::RecordOutcome(_) => Target::OwnActivity,
            Request::ReadThread { .. } => Target::ThreadRead,
            Request::ReadCallerHistory { caller_id, .. } => Target::CallerTimeline { caller_id: *caller_id },
            Request::GetInsights(subject) => Target::Insights(*subject),
            Request::RegisterCaller(target) => Target::Registry {
                caller_id: &target.id,
                department: Some(&target.department),
            },
            Request::RetireCaller { .. } => Target::Retire,
        };
        policy::authorize(caller, target).map_err(MemoryError::Authorization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ActionOutcome, HistoryRole};
    use serde_json::json;

    fn validator() -> SecurityValidator {
        SecurityValidator::new(SecurityConfig::default(), 4)
    }

    fn sales() -> Caller {
        Caller::new("sales-agent-1", "sales")
    }

    #[test]
    fn valid_store_returns_scope() {
        let entry = NewKnowledge::unstructured("Lead X qualified").with_metadata("department", "Sales");
        let scope = validator().validate(&sales(), &Request::StoreKnowledge(&entry)).unwrap();
        assert_eq!(scope, ReadScope::Department("sales".into()));
    }

    #[test]
    fn empty_and_oversized_content_rejected() {
        let v = validator();
        let empty = NewKnowledge::unstructured("   ");
        assert!(matches!(v.validate(&sales(), &Request::StoreKnowledge(&empty)), Err(MemoryError::Validation(_))));
        let huge = NewKnowledge::unstructured("x".repeat(MAX_CONTENT_LENGTH + 1));
        assert!(matches!(v.validate(&sales(), &Request::StoreKnowledge(&huge)), Err(MemoryError::Validation(_))));
    }

    #[test]
    fn structured_content_must_be_object() {
        let v = validator();
        let mut entry = NewKnowledge::structured(&json!({"lead": "X"}));
        assert!(v.validate(&sales(), &Request::StoreKnowledge(&entry)).is_ok());
        entry.content = "[1,2]".into();
        assert!(v.validate(&sales(), &Request::StoreKnowledge(&entry)).is_err());
    }

    #[test]
    fn embedding_dimension_enforced() {
        let entry = NewKnowledge::unstructured("x").with_embedding(vec![0.1, 0.2]);
        let err = validator().validate(&sales(), &Request::StoreKnowledge(&entry)).unwrap_err();
        assert!(err.to_string().contains("4 dimensions"));
    }

    #[test]
    fn cross_department_authoritative_write_denied() {
        let finance = Caller::new("finance-agent-1", "finance");
        let entry = NewKnowledge::structured(&json!({"status": "void"}))
            .with_id("k1")
            .with_department("sales");
        let v = validator();
        let err = v.validate(&finance, &Request::StoreKnowledge(&entry)).unwrap_err();
        assert!(matches!(err, MemoryError::Authorization(_)));
        assert_eq!(v.stats().rejected_authorization, 1);
    }

    #[test]
    fn search_bounds() {
        let v = validator();
        assert!(v.validate(&sales(), &Request::SearchKnowledge(&SearchRequest::new("leads", 5))).is_ok());
        assert!(v.validate(&sales(), &Request::SearchKnowledge(&SearchRequest::new("leads", 0))).is_err());
        assert!(v.validate(&sales(), &Request::SearchKnowledge(&SearchRequest::new("a' UNION SELECT 1", 5))).is_err());
        let bad_min = SearchRequest::new("leads", 5).with_min_score(2.0);
        assert!(v.validate(&sales(), &Request::SearchKnowledge(&bad_min)).is_err());
    }

    #[test]
    fn history_payload_and_outcome_checked() {
        let v = validator();
        let ok = NewHistoryRecord::message("t-1", HistoryRole::Caller, "hello");
        assert!(v.validate(&sales(), &Request::LogHistory(&ok)).is_ok());
        let bad_thread = NewHistoryRecord::message("t:1", HistoryRole::Caller, "hello");
        assert!(v.validate(&sales(), &Request::LogHistory(&bad_thread)).is_err());
        let private_key = NewHistoryRecord::message("caller:sales-agent-1", HistoryRole::Caller, "hello");
        assert!(v.validate(&sales(), &Request::LogHistory(&private_key)).is_err());
        let read = Request::ReadThread { thread_id: "caller:sales-agent-1", since: None, limit: 10 };
        assert!(v.validate(&sales(), &read).is_err());
        let action = NewHistoryRecord::action(
            "scored lead",
            ActionOutcome { task_category: "lead scoring!".into(), success: true, latency_ms: 10 },
        );
        assert!(v.validate(&sales(), &Request::LogHistory(&action)).is_err());
    }

    #[test]
    fn rate_limit_runs_last() {
        let limits = SecurityConfig { rate_limit_requests: 2, ..SecurityConfig::default() };
        let v = SecurityValidator::new(limits, 4);
        let event = OutcomeEvent::new("lead_scoring", true, 10);
        // Invalid requests do not consume quota.
        let bad = OutcomeEvent::new("", true, 10);
        assert!(v.validate(&sales(), &Request::RecordOutcome(&bad)).is_err());
        assert!(v.validate(&sales(), &Request::RecordOutcome(&event)).is_ok());
        assert!(v.validate(&sales(), &Request::RecordOutcome(&event)).is_ok());
        let err = v.validate(&sales(), &Request::RecordOutcome(&event)).unwrap_err();
        assert!(err.retry_after().is_some());
        let stats = v.stats();
        assert_eq!(stats.validated, 2);
        assert_eq!(stats.rejected_rate_limited, 1);
        assert_eq!(stats.rejected_validation, 1);
    }
}
