//! CLI command definitions for jobforge.
//!
//! The worker command runs the queue consumer and the daily budget reset
//! side by side; the remaining commands are one-shot operator tools against
//! the same database.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agents::{AgentManager, GenerationOptions, RegistryStore, YamlRegistryStore};
use crate::budget::BudgetResetJob;
use crate::config::EngineConfig;
use crate::pipeline::{BaselineScorer, FilterPolicy, HttpPageFetcher, ProcessorContext};
use crate::queue::{ItemType, LineageTracker, QueueItem, QueueRepository};
use crate::storage::Database;
use crate::worker::WorkerLoop;

/// Optional path to a YAML filter policy for the job pipeline.
const FILTER_POLICY_ENV: &str = "JOBFORGE_FILTER_POLICY";

/// Job-search pipeline engine.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Persistent job-search pipeline engine with AI agent management")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker loop and the daily budget reset job.
    Worker,

    /// Enqueue a root item.
    Submit(SubmitArgs),

    /// Report queue counts, agent usage and the halt flag.
    Status,

    /// Clear the queue halt flag so the worker resumes.
    Resume,

    /// Run the daily budget reset immediately.
    #[command(name = "reset-budgets")]
    ResetBudgets,
}

/// Arguments for `jobforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Pipeline for the new item (job, company, scrape-request, source-discovery).
    pub item_type: String,

    /// Target URL, stored in the item's pipeline state.
    #[arg(long)]
    pub url: Option<String>,

    /// Initial pipeline state as a JSON object; merged over --url.
    #[arg(long)]
    pub payload: Option<String>,

    /// Maximum processing attempts before the item fails.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Parse CLI arguments without executing them.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker => run_worker_command().await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status => run_status_command().await,
        Commands::Resume => run_resume_command().await,
        Commands::ResetBudgets => run_reset_command().await,
    }
}

async fn run_worker_command() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("loading engine configuration")?;

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    db.run_migrations().await.context("running migrations")?;

    let registry = Arc::new(YamlRegistryStore::new(&config.agent_registry_path));
    // Fail loudly at startup on a broken registry rather than on the first
    // claimed item.
    let loaded = registry
        .load()
        .await
        .context("loading the agent registry")?;
    info!(
        agents = loaded.agents.len(),
        registry = %config.agent_registry_path.display(),
        "agent registry loaded"
    );

    let agents = Arc::new(
        AgentManager::new(registry, db.clone()).with_options(GenerationOptions {
            timeout: config.provider_timeout,
            ..Default::default()
        }),
    );

    let fetcher = Arc::new(
        HttpPageFetcher::new(config.provider_timeout).context("building the HTTP fetcher")?,
    );
    let ctx = ProcessorContext {
        agents,
        scraper: fetcher.clone(),
        fetcher,
        scorer: Arc::new(BaselineScorer),
        sink: db.clone(),
        lineage: LineageTracker::new(),
        filter_policy: load_filter_policy().await?,
        score_threshold: config.score_threshold,
        scope: "worker".to_string(),
    };

    let worker = WorkerLoop::new(db.clone(), ctx)
        .with_poll_interval(config.poll_interval)
        .with_processing_timeout(config.processing_timeout);
    let reset = BudgetResetJob::new(db.clone(), db.clone(), config.budget_reset_hour);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    tokio::join!(worker.run(shutdown_rx.clone()), reset.run(shutdown_rx));
    Ok(())
}

/// Reads the filter policy file named by `JOBFORGE_FILTER_POLICY`, or
/// returns the empty policy (every gate disabled) when the variable is
/// unset.
async fn load_filter_policy() -> anyhow::Result<FilterPolicy> {
    match std::env::var(FILTER_POLICY_ENV) {
        Ok(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading filter policy {path}"))?;
            let policy = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing filter policy {path}"))?;
            Ok(policy)
        }
        Err(_) => {
            warn!("no filter policy configured; all postings pass the filter stage");
            Ok(FilterPolicy::default())
        }
    }
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let item_type = parse_item_type(&args.item_type)?;

    let mut state = serde_json::Map::new();
    if let Some(url) = &args.url {
        state.insert("url".to_string(), Value::String(url.clone()));
    }
    if let Some(payload) = &args.payload {
        let value: Value = serde_json::from_str(payload).context("parsing --payload")?;
        let object = value
            .as_object()
            .context("--payload must be a JSON object")?;
        state.extend(object.clone());
    }

    let lineage = LineageTracker::new().root();
    let mut item = QueueItem::new_root(item_type, lineage.tracking_id).with_pipeline_state(state);
    if let Some(max_retries) = args.max_retries {
        item = item.with_max_retries(max_retries);
    }

    let db = connect().await?;
    db.create(&item).await?;

    println!("submitted {} item {}", item.item_type, item.id);
    println!("tracking id: {}", item.tracking_id);
    Ok(())
}

async fn run_status_command() -> anyhow::Result<()> {
    let db = connect().await?;

    match db.stop_reason().await? {
        Some(reason) => println!("queue: HALTED ({reason})"),
        None => println!("queue: running"),
    }

    println!("\nitems:");
    let counts = db.queue_counts().await?;
    if counts.is_empty() {
        println!("  (empty)");
    }
    for (status, count) in counts {
        println!("  {status:<12} {count}");
    }
    println!("matches saved: {}", db.match_count().await?);

    let usage = db.usage_counters().await?;
    if !usage.is_empty() {
        println!("\nagent usage:");
        for (agent, units) in usage {
            println!("  {agent:<24} {units:.1}");
        }
    }

    use crate::agents::AgentStateStore;
    let states = db.all_runtime_states().await?;
    let disabled: Vec<_> = states.iter().filter(|(_, _, s)| !s.enabled).collect();
    if !disabled.is_empty() {
        println!("\ndisabled agents:");
        for (agent, scope, state) in disabled {
            let reason = state
                .reason
                .as_ref()
                .map(|r| r.as_wire())
                .unwrap_or_else(|| "unknown".to_string());
            println!("  {agent} [{scope}]: {reason}");
        }
    }

    Ok(())
}

async fn run_resume_command() -> anyhow::Result<()> {
    let db = connect().await?;

    match db.stop_reason().await? {
        Some(reason) => {
            db.clear_stop_reason().await?;
            println!("halt cleared (was: {reason}); the worker resumes on its next poll");
        }
        None => println!("queue is not halted"),
    }
    Ok(())
}

async fn run_reset_command() -> anyhow::Result<()> {
    let db = Arc::new(connect().await?);

    let job = BudgetResetJob::new(db.clone(), db, 0);
    let summary = job.run_once().await?;

    println!(
        "reset {} usage counters, re-enabled {} agent scopes, cleared the halt flag",
        summary.usage_counters_reset, summary.scopes_reenabled
    );
    Ok(())
}

/// One-shot commands need the database only, not the full engine config.
async fn connect() -> anyhow::Result<Database> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect(&url)
        .await
        .context("connecting to database")?;
    db.run_migrations().await.context("running migrations")?;
    Ok(db)
}

fn parse_item_type(raw: &str) -> anyhow::Result<ItemType> {
    match raw.replace('-', "_").as_str() {
        "job" => Ok(ItemType::Job),
        "company" => Ok(ItemType::Company),
        "scrape_request" => Ok(ItemType::ScrapeRequest),
        "source_discovery" => Ok(ItemType::SourceDiscovery),
        other => anyhow::bail!(
            "unknown item type '{other}' (expected job, company, scrape-request or source-discovery)"
        ),
    }
}
