// Colony Memory — Analytics Engine
// Per (caller, task category) outcome counters and the insights built on them.
//
// Increments are a single upsert (`count = count + excluded.count`), so
// concurrent outcomes never lose updates. An optional event id is claimed in
// outcome_events inside the same transaction; a replayed id changes nothing.

use super::callers::require_active_caller;
use crate::atoms::constants::{BENCHMARK_GAP, SLOW_TASK_LATENCY_MS};
use crate::atoms::error::MemoryResult;
use crate::atoms::traits::AnalyticsBackend;
use crate::atoms::types::{
    timestamp_now, AnalyticsAggregate, Caller, Insights, InsightsSubject, OutcomeEvent, Priority,
    Recommendation, RecommendationKind,
};
use crate::engine::pool::ConnectionPool;
use async_trait::async_trait;
use log::debug;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::collections::HashMap;
use std::sync::Arc;

const AGGREGATE_COLUMNS: &str =
    "caller_id, task_category, success_count, failure_count, total_latency_ms, updated_at";

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<AnalyticsAggregate> {
    Ok(AnalyticsAggregate {
        caller_id: row.get(0)?,
        task_category: row.get(1)?,
        success_count: row.get::<_, i64>(2)?.max(0) as u64,
        failure_count: row.get::<_, i64>(3)?.max(0) as u64,
        total_latency_ms: row.get::<_, i64>(4)?.max(0) as u64,
        updated_at: row.get(5)?,
    })
}

fn load_aggregates(conn: &Connection, subject: &InsightsSubject) -> MemoryResult<Vec<AnalyticsAggregate>> {
    let (sql, key) = match subject {
        InsightsSubject::Caller(id) => (
            format!(
                "SELECT {} FROM analytics_aggregates WHERE caller_id = ?1 ORDER BY task_category",
                AGGREGATE_COLUMNS
            ),
            id.clone(),
        ),
        InsightsSubject::Category(cat) => (
            format!(
                "SELECT {} FROM analytics_aggregates WHERE task_category = ?1 ORDER BY caller_id",
                AGGREGATE_COLUMNS
            ),
            cat.trim().to_lowercase(),
        ),
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![key], aggregate_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// (successes, failures) of every other caller, per category the subject uses.
fn peer_totals(conn: &Connection, caller_id: &str) -> MemoryResult<HashMap<String, (u64, u64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT task_category, SUM(success_count), SUM(failure_count)
         FROM analytics_aggregates
         WHERE caller_id != ?1
           AND task_category IN (SELECT task_category FROM analytics_aggregates WHERE caller_id = ?1)
         GROUP BY task_category",
    )?;
    let rows = stmt.query_map(params![caller_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?.max(0) as u64,
            row.get::<_, i64>(2)?.max(0) as u64,
        ))
    })?;
    let mut out = HashMap::new();
    for row in rows {
        let (cat, s, f) = row?;
        out.insert(cat, (s, f));
    }
    Ok(out)
}

// ── Insights ───────────────────────────────────────────────────────────────

fn pct(rate: f64) -> String {
    format!("{:.0}%", rate * 100.0)
}

fn rate_of(success: u64, failure: u64) -> Option<f64> {
    let total = success + failure;
    (total > 0).then(|| success as f64 / total as f64)
}

fn recommend(agg: &AnalyticsAggregate, label: &str, out: &mut Vec<Recommendation>) {
    let runs = agg.total();
    let rate = agg.success_rate();
    let push = |out: &mut Vec<Recommendation>, kind, priority, message: String| {
        out.push(Recommendation { kind, task_category: agg.task_category.clone(), message, priority });
    };
    if rate < 0.5 && runs >= 3 {
        push(
            out,
            RecommendationKind::ImprovementNeeded,
            Priority::High,
            format!("{} succeeds {} of the time over {} runs; review failure causes", label, pct(rate), runs),
        );
    } else if rate < 0.7 && runs >= 5 {
        push(
            out,
            RecommendationKind::OptimizationOpportunity,
            Priority::Medium,
            format!("{} succeeds {} of the time; there is room to optimise", label, pct(rate)),
        );
    } else if rate >= 0.9 && runs >= 5 {
        push(
            out,
            RecommendationKind::BestPractice,
            Priority::Low,
            format!("{} succeeds {} of the time; worth sharing as a best practice", label, pct(rate)),
        );
    }
    if let Some(avg) = agg.avg_latency_ms() {
        if avg > SLOW_TASK_LATENCY_MS {
            push(
                out,
                RecommendationKind::PerformanceOptimization,
                Priority::Medium,
                format!("{} averages {:.0}ms per run", label, avg),
            );
        }
    }
}

fn summarize(insights: &Insights, units: usize, noun: (&str, &str)) -> Vec<String> {
    let mut lines = Vec::new();
    let runs = insights.total_runs();
    let rate = insights.success_rate;
    let tier = if rate >= 0.9 {
        "Excellent"
    } else if rate >= 0.7 {
        "Good"
    } else if rate >= 0.5 {
        "Moderate"
    } else {
        "Low"
    };
    lines.push(format!("{} overall success rate ({} over {} runs)", tier, pct(rate), runs));
    lines.push(format!("{} {} active", units, if units == 1 { noun.0 } else { noun.1 }));
    let urgent = insights
        .recommendations
        .iter()
        .filter(|r| r.priority == Priority::High)
        .count();
    if urgent > 0 {
        lines.push(format!("{} high-priority item(s) need attention", urgent));
    }
    lines
}

/// Build the insights view from stored aggregates. `peers` maps each task
/// category to the (successes, failures) of every other caller and is only
/// used for caller subjects.
pub fn build_insights(
    subject: InsightsSubject,
    aggregates: Vec<AnalyticsAggregate>,
    peers: &HashMap<String, (u64, u64)>,
) -> Insights {
    let mut insights = Insights::empty(subject);
    if aggregates.iter().all(|a| a.total() == 0) {
        let what = match &insights.subject {
            InsightsSubject::Caller(id) => format!("caller '{}'", id),
            InsightsSubject::Category(cat) => format!("category '{}'", cat),
        };
        insights.recommendations.push(Recommendation {
            kind: RecommendationKind::InsufficientData,
            task_category: match &insights.subject {
                InsightsSubject::Category(cat) => cat.clone(),
                InsightsSubject::Caller(_) => String::new(),
            },
            message: format!("No outcomes recorded yet for {}", what),
            priority: Priority::Info,
        });
        insights.summary.push("No activity recorded".to_string());
        return insights;
    }

    let mut latency = 0u64;
    for agg in &aggregates {
        insights.total_success += agg.success_count;
        insights.total_failure += agg.failure_count;
        latency += agg.total_latency_ms;
    }
    let runs = insights.total_runs();
    insights.success_rate = insights.total_success as f64 / runs as f64;
    insights.avg_latency_ms = Some(latency as f64 / runs as f64);

    let mut recs = Vec::new();
    match &insights.subject {
        InsightsSubject::Caller(_) => {
            for agg in &aggregates {
                let label = format!("'{}'", agg.task_category);
                recommend(agg, &label, &mut recs);
                let Some(&(ps, pf)) = peers.get(&agg.task_category) else { continue };
                let Some(peer_rate) = rate_of(ps, pf) else { continue };
                let rate = agg.success_rate();
                if rate > peer_rate + BENCHMARK_GAP {
                    recs.push(Recommendation {
                        kind: RecommendationKind::BenchmarkComparison,
                        task_category: agg.task_category.clone(),
                        message: format!("{} at {} outperforms peers at {}", label, pct(rate), pct(peer_rate)),
                        priority: Priority::Info,
                    });
                } else if rate + BENCHMARK_GAP < peer_rate {
                    recs.push(Recommendation {
                        kind: RecommendationKind::BenchmarkComparison,
                        task_category: agg.task_category.clone(),
                        message: format!("{} at {} trails peers at {}", label, pct(rate), pct(peer_rate)),
                        priority: Priority::Medium,
                    });
                }
            }
        }
        InsightsSubject::Category(_) => {
            for agg in &aggregates {
                let label = format!("Caller '{}'", agg.caller_id);
                recommend(agg, &label, &mut recs);
            }
        }
    }
    recs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.task_category.cmp(&b.task_category)));
    insights.recommendations = recs;

    let noun = match &insights.subject {
        InsightsSubject::Caller(_) => ("task category", "task categories"),
        InsightsSubject::Category(_) => ("caller", "callers"),
    };
    let units = aggregates.len();
    insights.breakdown = aggregates;
    insights.summary = summarize(&insights, units, noun);
    insights
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct AnalyticsEngine {
    pool: Arc<ConnectionPool>,
}

impl AnalyticsEngine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        AnalyticsEngine { pool }
    }
}

#[async_trait]
impl AnalyticsBackend for AnalyticsEngine {
    async fn record_outcome(&self, caller: &Caller, event: &OutcomeEvent) -> MemoryResult<bool> {
        let caller = caller.clone();
        let event = event.clone();
        self.pool
            .with_conn("record_outcome", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                require_active_caller(&tx, &caller)?;

                let category = event.task_category.trim().to_lowercase();
                let now = timestamp_now();
                if let Some(event_id) = &event.event_id {
                    let claimed = tx.execute(
                        "INSERT OR IGNORE INTO outcome_events (event_id, caller_id, task_category, applied_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![event_id, caller.id, category, now],
                    )?;
                    if claimed == 0 {
                        debug!("[memory::analytics] Duplicate event {} ignored", event_id);
                        return Ok(false);
                    }
                }

                let (success, failure) = if event.success { (1i64, 0i64) } else { (0, 1) };
                tx.execute(
                    "INSERT INTO analytics_aggregates
                        (caller_id, task_category, success_count, failure_count, total_latency_ms, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(caller_id, task_category) DO UPDATE SET
                        success_count = success_count + excluded.success_count,
                        failure_count = failure_count + excluded.failure_count,
                        total_latency_ms = total_latency_ms + excluded.total_latency_ms,
                        updated_at = excluded.updated_at",
                    params![caller.id, category, success, failure, event.latency_ms as i64, now],
                )?;
                tx.commit()?;
                debug!(
                    "[memory::analytics] {} {} ({}ms) for {}",
                    category,
                    if event.success { "success" } else { "failure" },
                    event.latency_ms,
                    caller.id
                );
                Ok(true)
            })
            .await
    }

    async fn get_insights(&self, subject: &InsightsSubject) -> MemoryResult<Insights> {
        let subject = subject.clone();
        self.pool
            .with_conn("get_insights", move |conn| {
                let aggregates = load_aggregates(conn, &subject)?;
                let peers = match &subject {
                    InsightsSubject::Caller(id) => peer_totals(conn, id)?,
                    InsightsSubject::Category(_) => HashMap::new(),
                };
                Ok(build_insights(subject, aggregates, &peers))
            })
            .await
    }
}
