// Colony Memory CLI
// Every command runs through the coordinator as the caller named by
// --caller / --department, exactly like an agent would.

use clap::{Parser, Subcommand};
use colony_memory::{
    ActionOutcome, Caller, ContentKind, HistoryRole, InsightsSubject, KnowledgeEntry, KnowledgeFilter,
    MemoryConfig, MemoryCoordinator, MemoryError, MemoryResult, NewHistoryRecord, NewKnowledge,
    OutcomeEvent, ScoredEntry, SearchRequest,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "colony-memory")]
#[command(about = "Shared knowledge, history and analytics for agent fleets")]
#[command(version)]
struct Cli {
    /// TOML config file. Defaults plus environment overrides when omitted.
    #[arg(short, long, env = "COLONY_MEMORY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Caller id to act as
    #[arg(long = "caller", env = "COLONY_CALLER_ID", global = true, default_value = "cli")]
    caller_id: String,

    /// Department of the acting caller
    #[arg(long, env = "COLONY_DEPARTMENT", global = true, default_value = "memory")]
    department: String,

    /// Print compact JSON instead of pretty JSON
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the acting caller (or --id in --target-department)
    Register {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        target_department: Option<String>,
        #[arg(long, default_value = "")]
        role: String,
    },

    /// Retire a caller (admin departments only)
    Retire { caller_id: String },

    /// Store a knowledge entry
    Store {
        /// Text, or a JSON document with --structured
        content: String,
        #[arg(long)]
        structured: bool,
        #[arg(long)]
        id: Option<String>,
        /// Owning department (defaults to the caller's)
        #[arg(long)]
        owner_department: Option<String>,
        /// Visible to every department
        #[arg(long)]
        shared: bool,
        /// key=value, repeatable. Values parse as JSON when they can.
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },

    /// Similarity search
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },

    /// Fetch one entry by id
    Get { id: String },

    /// List entries matching exact metadata
    Query {
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Append a message to a thread, or an action with --category
    Log {
        payload: String,
        #[arg(long)]
        thread: Option<String>,
        /// caller | system | peer
        #[arg(long, default_value = "caller")]
        role: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        failed: bool,
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },

    /// Read a thread in order
    Thread {
        thread_id: String,
        #[arg(long)]
        since: Option<u64>,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// A caller's most recent records (defaults to the acting caller)
    History {
        caller_id: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Record a task outcome
    Record {
        category: String,
        #[arg(long)]
        failed: bool,
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Insights for a caller, or for a task category with --category
    Insights {
        subject: Option<String>,
        #[arg(long)]
        category: bool,
    },

    /// Component health, routing, cache and pool stats
    Health,
}

fn parse_metadata(pairs: &[String]) -> MemoryResult<Vec<(String, Value)>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| MemoryError::validation(format!("metadata '{}' is not key=value", pair)))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn filter_from(pairs: &[String]) -> MemoryResult<KnowledgeFilter> {
    let mut filter = KnowledgeFilter::default();
    for (key, value) in parse_metadata(pairs)? {
        filter = filter.with_metadata(key, value);
    }
    Ok(filter)
}

/// Vectors are noise on a terminal.
fn strip(mut entry: KnowledgeEntry) -> KnowledgeEntry {
    entry.embedding = None;
    entry
}

fn print<T: Serialize>(value: &T, compact: bool) -> MemoryResult<()> {
    let out = if compact { serde_json::to_string(value)? } else { serde_json::to_string_pretty(value)? };
    println!("{}", out);
    Ok(())
}

fn load_config(cli: &Cli) -> MemoryResult<MemoryConfig> {
    match &cli.config {
        Some(path) => MemoryConfig::load(path),
        None => MemoryConfig::from_env(),
    }
}

async fn run(cli: Cli, config: MemoryConfig) -> MemoryResult<()> {
    let memory = MemoryCoordinator::open(config).await?;
    let me = Caller::new(cli.caller_id.clone(), cli.department.clone());
    log::debug!("[memory::cli] Acting as '{}' ({})", me.id, me.department);
    let compact = cli.compact;

    match cli.command {
        Commands::Register { id, target_department, role } => {
            let target = Caller::new(
                id.unwrap_or_else(|| me.id.clone()),
                target_department.unwrap_or_else(|| me.department.clone()),
            )
            .with_role(role);
            print(&memory.register_caller(&me, &target).await?, compact)
        }
        Commands::Retire { caller_id } => {
            let retired = memory.retire_caller(&me, &caller_id).await?;
            print(&serde_json::json!({ "caller_id": caller_id, "retired": retired }), compact)
        }
        Commands::Store { content, structured, id, owner_department, shared, metadata } => {
            let mut entry = if structured {
                let doc: Value = serde_json::from_str(&content)?;
                NewKnowledge::structured(&doc)
            } else {
                NewKnowledge::unstructured(content)
            };
            for (key, value) in parse_metadata(&metadata)? {
                entry = entry.with_metadata(key, value);
            }
            if let Some(id) = id {
                entry = entry.with_id(id);
            }
            if let Some(dept) = owner_department {
                entry = entry.with_department(dept);
            }
            if shared {
                entry = entry.shared();
            }
            print(&strip(memory.store_knowledge(&me, entry).await?), compact)
        }
        Commands::Search { query, k, min_score, metadata } => {
            let mut request = SearchRequest::new(query, k).with_filter(filter_from(&metadata)?);
            if let Some(min) = min_score {
                request = request.with_min_score(min);
            }
            let hits: Vec<ScoredEntry> = memory
                .search_knowledge(&me, &request)
                .await?
                .into_iter()
                .map(|hit| ScoredEntry { entry: strip(hit.entry), score: hit.score })
                .collect();
            print(&hits, compact)
        }
        Commands::Get { id } => print(&memory.get_knowledge(&me, &id).await?.map(strip), compact),
        Commands::Query { metadata, kind, since, until, limit } => {
            let mut filter = filter_from(&metadata)?.with_limit(limit);
            if let Some(kind) = kind {
                let parsed = ContentKind::parse(&kind)
                    .ok_or_else(|| MemoryError::validation(format!("unknown content kind '{}'", kind)))?;
                filter = filter.with_kind(parsed);
            }
            filter.created_after = since;
            filter.created_before = until;
            let entries: Vec<KnowledgeEntry> =
                memory.query_knowledge(&me, &filter).await?.into_iter().map(strip).collect();
            print(&entries, compact)
        }
        Commands::Log { payload, thread, role, category, failed, latency_ms } => {
            let mut record = match category {
                Some(task_category) => NewHistoryRecord::action(
                    payload,
                    ActionOutcome { task_category, success: !failed, latency_ms },
                ),
                None => {
                    let role = HistoryRole::parse(&role)
                        .ok_or_else(|| MemoryError::validation(format!("unknown role '{}'", role)))?;
                    let thread = thread
                        .clone()
                        .ok_or_else(|| MemoryError::validation("messages need --thread"))?;
                    NewHistoryRecord::message(thread, role, payload)
                }
            };
            if record.thread_id.is_none() {
                if let Some(tid) = thread {
                    record = record.in_thread(tid);
                }
            }
            print(&memory.log_history(&me, &record).await?, compact)
        }
        Commands::Thread { thread_id, since, limit } => {
            print(&memory.read_thread(&me, &thread_id, since, limit).await?, compact)
        }
        Commands::History { caller_id, limit } => {
            let target = caller_id.unwrap_or_else(|| me.id.clone());
            print(&memory.read_caller_history(&me, &target, limit).await?, compact)
        }
        Commands::Record { category, failed, latency_ms, event_id } => {
            let mut event = OutcomeEvent::new(category, !failed, latency_ms);
            if let Some(id) = event_id {
                event = event.with_event_id(id);
            }
            let applied = memory.record_outcome(&me, &event).await?;
            print(&serde_json::json!({ "applied": applied }), compact)
        }
        Commands::Insights { subject, category } => {
            let subject = match (subject, category) {
                (Some(cat), true) => InsightsSubject::Category(cat),
                (None, true) => return Err(MemoryError::validation("--category needs a category name")),
                (id, false) => InsightsSubject::Caller(id.unwrap_or_else(|| me.id.clone())),
            };
            print(&memory.get_insights(&me, &subject).await?, compact)
        }
        Commands::Health => print(&memory.health(), compact),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match load_config(&cli) {
        Ok(config) => {
            // RUST_LOG wins over the configured level.
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()))
                .init();
            run(cli, config).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {}", e.kind().as_str(), e);
            if let Some(wait) = e.retry_after() {
                eprintln!("retry after {}ms", wait.as_millis());
            }
            ExitCode::FAILURE
        }
    }
}
