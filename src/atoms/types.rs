// ── Colony Atoms: Domain Types ─────────────────────────────────────────────
// Plain data shared by every component. No I/O, no locking.
//
//   Caller              the agent identity every operation is attributed to
//   KnowledgeEntry      shared fact/document, optionally embedded
//   HistoryRecord       ordered conversation/action record within a thread
//   AnalyticsAggregate  per (caller, task category) outcome counters
//   Insights            rollup view returned by get_insights

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Free-form key → value metadata. `serde_json::Map` is ordered, so the
/// serialized form is deterministic (cache keys depend on it).
pub type Metadata = serde_json::Map<String, Value>;

/// Server-assigned timestamp: RFC 3339, microsecond precision, UTC.
/// Lexicographic order equals chronological order.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ── Caller ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub department: String,
    #[serde(default)]
    pub role: String,
}

impl Caller {
    pub fn new(id: impl Into<String>, department: impl Into<String>) -> Self {
        Caller { id: id.into(), department: department.into(), role: String::new() }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// A registered caller row, including its soft-delete marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerRecord {
    pub caller: Caller,
    pub created_at: String,
    pub retired_at: Option<String>,
}

// ── Knowledge ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// JSON object content. Authoritative: only the owning department may write it.
    Structured,
    /// Free text. Embedded for similarity search.
    Unstructured,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Structured => "structured",
            ContentKind::Unstructured => "unstructured",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structured" => Some(ContentKind::Structured),
            "unstructured" => Some(ContentKind::Unstructured),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    /// Caller that created the entry.
    pub owner_id: String,
    /// Department that owns the entry (authoritative writer).
    pub department: String,
    pub content_kind: ContentKind,
    pub content: String,
    pub metadata: Metadata,
    /// Readable by every department when set.
    pub shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

/// Write payload for store-knowledge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewKnowledge {
    /// Target id to overwrite. `None` creates a new entry.
    pub id: Option<String>,
    pub content_kind: Option<ContentKind>,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub shared: bool,
    /// Owning department; defaults to the caller's department.
    pub department: Option<String>,
    /// Pre-computed embedding. Must match the store's vector dimension.
    pub embedding: Option<Vec<f32>>,
}

impl NewKnowledge {
    pub fn unstructured(content: impl Into<String>) -> Self {
        NewKnowledge {
            content_kind: Some(ContentKind::Unstructured),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn structured(content: &Value) -> Self {
        NewKnowledge {
            content_kind: Some(ContentKind::Structured),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn kind(&self) -> ContentKind {
        self.content_kind.unwrap_or(ContentKind::Unstructured)
    }
}

/// A similarity hit. Ranking: score desc, then created_at desc, then id asc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f64,
}

/// Filters shared by similarity search and metadata queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFilter {
    pub content_kind: Option<ContentKind>,
    pub department: Option<String>,
    /// Every key must be present with an equal value.
    #[serde(default)]
    pub metadata: Metadata,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub limit: usize,
}

impl Default for KnowledgeFilter {
    fn default() -> Self {
        KnowledgeFilter {
            content_kind: None,
            department: None,
            metadata: Metadata::new(),
            created_after: None,
            created_before: None,
            limit: 100,
        }
    }
}

impl KnowledgeFilter {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: ContentKind) -> Self {
        self.content_kind = Some(kind);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Pure predicate over everything except read scope (applied separately).
    pub fn matches(&self, entry: &KnowledgeEntry) -> bool {
        if let Some(kind) = self.content_kind {
            if entry.content_kind != kind {
                return false;
            }
        }
        if let Some(dept) = &self.department {
            if !entry.department.eq_ignore_ascii_case(dept) {
                return false;
            }
        }
        if let Some(after) = &self.created_after {
            if entry.created_at.as_str() < after.as_str() {
                return false;
            }
        }
        if let Some(before) = &self.created_before {
            if entry.created_at.as_str() > before.as_str() {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| entry.metadata.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub k: usize,
    #[serde(default)]
    pub filter: KnowledgeFilter,
    pub min_score: Option<f64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        SearchRequest { query: query.into(), k, filter: KnowledgeFilter::default(), min_score: None }
    }

    pub fn with_filter(mut self, filter: KnowledgeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// Which entries a caller may read. Produced by the access policy, consumed
/// by storage queries so invisible rows never leave the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadScope {
    /// Every entry (admin/system departments).
    All,
    /// Entries owned by this department plus every shared entry.
    Department(String),
}

impl ReadScope {
    pub fn permits(&self, entry: &KnowledgeEntry) -> bool {
        match self {
            ReadScope::All => true,
            ReadScope::Department(dept) => entry.shared || entry.department.eq_ignore_ascii_case(dept),
        }
    }

    pub fn cache_tag(&self) -> String {
        match self {
            ReadScope::All => "*".to_string(),
            ReadScope::Department(d) => d.to_lowercase(),
        }
    }
}

// ── History ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    Caller,
    System,
    Peer,
}

impl HistoryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryRole::Caller => "caller",
            HistoryRole::System => "system",
            HistoryRole::Peer => "peer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "caller" => Some(HistoryRole::Caller),
            "system" => Some(HistoryRole::System),
            "peer" => Some(HistoryRole::Peer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Message,
    Action,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Message => "message",
            RecordKind::Action => "action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(RecordKind::Message),
            "action" => Some(RecordKind::Action),
            _ => None,
        }
    }
}

/// Result of an action record; forwarded to analytics when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub task_category: String,
    pub success: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryRecord {
    pub thread_id: Option<String>,
    pub role: HistoryRole,
    pub kind: RecordKind,
    pub payload: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub outcome: Option<ActionOutcome>,
}

impl NewHistoryRecord {
    pub fn message(thread_id: impl Into<String>, role: HistoryRole, payload: impl Into<String>) -> Self {
        NewHistoryRecord {
            thread_id: Some(thread_id.into()),
            role,
            kind: RecordKind::Message,
            payload: payload.into(),
            metadata: Metadata::new(),
            outcome: None,
        }
    }

    pub fn action(payload: impl Into<String>, outcome: ActionOutcome) -> Self {
        NewHistoryRecord {
            thread_id: None,
            role: HistoryRole::Caller,
            kind: RecordKind::Action,
            payload: payload.into(),
            metadata: Metadata::new(),
            outcome: Some(outcome),
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub caller_id: String,
    pub thread_id: Option<String>,
    /// Store-assigned, strictly increasing within a thread.
    pub sequence: u64,
    pub role: HistoryRole,
    pub kind: RecordKind,
    pub payload: String,
    pub metadata: Metadata,
    pub created_at: String,
}

// ── Analytics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub task_category: String,
    pub success: bool,
    pub latency_ms: u64,
    /// Optional idempotency key; replays with the same id are ignored.
    pub event_id: Option<String>,
}

impl OutcomeEvent {
    pub fn new(task_category: impl Into<String>, success: bool, latency_ms: u64) -> Self {
        OutcomeEvent { task_category: task_category.into(), success, latency_ms, event_id: None }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsAggregate {
    pub caller_id: String,
    pub task_category: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_latency_ms: u64,
    pub updated_at: String,
}

impl AnalyticsAggregate {
    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Streaming average: total latency over total runs.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            None
        } else {
            Some(self.total_latency_ms as f64 / total as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "id", rename_all = "snake_case")]
pub enum InsightsSubject {
    Caller(String),
    Category(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ImprovementNeeded,
    OptimizationOpportunity,
    BestPractice,
    PerformanceOptimization,
    BenchmarkComparison,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub task_category: String,
    pub message: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub subject: InsightsSubject,
    pub total_success: u64,
    pub total_failure: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub breakdown: Vec<AnalyticsAggregate>,
    pub recommendations: Vec<Recommendation>,
    pub summary: Vec<String>,
}

impl Insights {
    /// The view returned when no data exists (or analytics is unavailable).
    pub fn empty(subject: InsightsSubject) -> Self {
        Insights {
            subject,
            total_success: 0,
            total_failure: 0,
            success_rate: 0.0,
            avg_latency_ms: None,
            breakdown: Vec::new(),
            recommendations: Vec::new(),
            summary: Vec::new(),
        }
    }

    pub fn total_runs(&self) -> u64 {
        self.total_success + self.total_failure
    }
}

// ── Routing / health ───────────────────────────────────────────────────────

/// Downstream components tracked by the health rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Knowledge,
    History,
    Analytics,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Knowledge, Component::History, Component::Analytics];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Knowledge => "knowledge",
            Component::History => "history",
            Component::Analytics => "analytics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// One variant per coordinator capability; used for routing stats and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    StoreKnowledge,
    SearchKnowledge,
    GetKnowledge,
    QueryKnowledge,
    LogHistory,
    ReadHistory,
    RecordOutcome,
    GetInsights,
    RegisterCaller,
    RetireCaller,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::StoreKnowledge => "store_knowledge",
            OperationKind::SearchKnowledge => "search_knowledge",
            OperationKind::GetKnowledge => "get_knowledge",
            OperationKind::QueryKnowledge => "query_knowledge",
            OperationKind::LogHistory => "log_history",
            OperationKind::ReadHistory => "read_history",
            OperationKind::RecordOutcome => "record_outcome",
            OperationKind::GetInsights => "get_insights",
            OperationKind::RegisterCaller => "register_caller",
            OperationKind::RetireCaller => "retire_caller",
        }
    }

    /// Read operations may degrade to cached/default data; writes never do.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            OperationKind::SearchKnowledge
                | OperationKind::GetKnowledge
                | OperationKind::QueryKnowledge
                | OperationKind::ReadHistory
                | OperationKind::GetInsights
        )
    }

    pub fn component(self) -> Option<Component> {
        match self {
            OperationKind::StoreKnowledge
            | OperationKind::SearchKnowledge
            | OperationKind::GetKnowledge
            | OperationKind::QueryKnowledge => Some(Component::Knowledge),
            OperationKind::LogHistory | OperationKind::ReadHistory => Some(Component::History),
            OperationKind::RecordOutcome | OperationKind::GetInsights => Some(Component::Analytics),
            OperationKind::RegisterCaller | OperationKind::RetireCaller => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(dept: &str, shared: bool) -> KnowledgeEntry {
        KnowledgeEntry {
            id: "k1".into(),
            owner_id: "sales-agent-1".into(),
            department: dept.into(),
            content_kind: ContentKind::Unstructured,
            content: "Lead X qualified".into(),
            metadata: json!({"department": "Sales", "stage": 2}).as_object().cloned().unwrap_or_default(),
            shared,
            embedding: None,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            updated_at: "2026-01-01T00:00:00.000000Z".into(),
        }
    }

    #[test]
    fn read_scope_department_sees_own_and_shared() {
        let scope = ReadScope::Department("finance".into());
        assert!(!scope.permits(&entry("sales", false)));
        assert!(scope.permits(&entry("sales", true)));
        assert!(scope.permits(&entry("Finance", false)));
        assert!(ReadScope::All.permits(&entry("sales", false)));
    }

    #[test]
    fn filter_matches_metadata_and_kind() {
        let e = entry("sales", false);
        assert!(KnowledgeFilter::default().with_metadata("department", "Sales").matches(&e));
        assert!(!KnowledgeFilter::default().with_metadata("stage", 3).matches(&e));
        assert!(!KnowledgeFilter::default().with_kind(ContentKind::Structured).matches(&e));
    }

    #[test]
    fn filter_respects_time_bounds() {
        let e = entry("sales", false);
        let mut f = KnowledgeFilter::default();
        f.created_after = Some("2026-06-01T00:00:00Z".into());
        assert!(!f.matches(&e));
        f.created_after = None;
        f.created_before = Some("2026-06-01T00:00:00Z".into());
        assert!(f.matches(&e));
    }

    #[test]
    fn aggregate_rates() {
        let agg = AnalyticsAggregate {
            caller_id: "a".into(),
            task_category: "t".into(),
            success_count: 3,
            failure_count: 1,
            total_latency_ms: 400,
            updated_at: String::new(),
        };
        assert_eq!(agg.total(), 4);
        assert!((agg.success_rate() - 0.75).abs() < 1e-9);
        assert_eq!(agg.avg_latency_ms(), Some(100.0));
    }

    #[test]
    fn operation_read_write_split() {
        assert!(OperationKind::SearchKnowledge.is_read());
        assert!(!OperationKind::StoreKnowledge.is_read());
        assert_eq!(OperationKind::RecordOutcome.component(), Some(Component::Analytics));
        assert_eq!(OperationKind::RegisterCaller.component(), None);
    }

    #[test]
    fn timestamps_sort_chronologically() {
        let a = timestamp_now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = timestamp_now();
        assert!(a < b);
    }
}
