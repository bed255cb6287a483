//! Typed multi-stage pipelines and their external collaborators.
//!
//! Each processor owns exactly one stage transition per invocation: it
//! completes the current stage, then either marks the item terminal or
//! returns child items for the follow-up work, each carrying the same
//! tracking id.
//! The worker loop persists the outcome; processors never touch the
//! repository directly.

pub mod company;
pub mod fetch;
pub mod filter;
pub mod job;
pub mod source;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::agents::{AgentError, AgentManager};
use crate::queue::{ItemStatus, ItemType, LineageError, LineageTracker, QueueItem, SubTask};

pub use fetch::{BaselineScorer, HttpPageFetcher};
pub use filter::{FilterPolicy, FilterVerdict};

/// Error kind shared by the external scrape/fetch collaborators.
#[derive(Debug, Error)]
#[error("fetch failed: {0}")]
pub struct FetchError(pub String);

/// Errors raised by a stage run.
#[derive(Debug, Error)]
pub enum StageError {
    /// The agent manager could not serve the stage. `NoAgentsAvailable`
    /// reverts the item to pending and halts the queue; it is never a
    /// terminal item failure.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Spawning the next stage would exceed the lineage depth cap.
    #[error(transparent)]
    Lineage(#[from] LineageError),

    /// A stage-local failure (bad scrape, malformed extraction). Converted
    /// into a terminal `failed` status; never halts the queue.
    #[error("{0}")]
    Stage(String),
}

impl StageError {
    /// Returns whether this error must halt the whole queue instead of
    /// failing the item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Agent(_))
    }
}

/// What a stage run decided.
#[derive(Debug)]
pub enum StageOutcome {
    /// The item reached a terminal status.
    Terminal { status: ItemStatus, message: String },
    /// The stage completed and produced follow-up work. Most stages spawn
    /// exactly one child carrying the next stage; source discovery spawns
    /// one scrape request per discovered listing. The current item is
    /// marked successful once every child is persisted.
    Spawn {
        children: Vec<QueueItem>,
        message: String,
    },
}

/// Match score report from the external scoring engine. The formula and the
/// breakdown contents are opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub final_score: f64,
    pub passed: bool,
    pub breakdown: Value,
}

/// External collaborator: fetches raw listing data for the job scrape stage.
#[async_trait]
pub trait JobScraper: Send + Sync {
    /// Fetches raw job data for the scrape target described by the item's
    /// pipeline state.
    async fn scrape(&self, target: &Value) -> Result<Value, FetchError>;
}

/// External collaborator: fetches raw company pages for the company fetch
/// stage and source-discovery sampling.
#[async_trait]
pub trait CompanyFetcher: Send + Sync {
    async fn fetch(&self, target: &Value) -> Result<Value, FetchError>;
}

/// External collaborator: the deterministic match-scoring formula.
pub trait ScoringEngine: Send + Sync {
    fn score(&self, facts: &Value) -> ScoreReport;
}

/// A saved job match record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMatch {
    pub id: Uuid,
    pub tracking_id: Uuid,
    pub title: String,
    pub company: Option<String>,
    pub url: Option<String>,
    pub score: f64,
    pub breakdown: Value,
    pub facts: Value,
    pub created_at: DateTime<Utc>,
}

/// A saved company profile record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: Uuid,
    pub tracking_id: Uuid,
    pub name: String,
    pub website: Option<String>,
    pub facts: Value,
    pub analysis: Value,
    pub created_at: DateTime<Utc>,
}

/// A saved job source record from source discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSource {
    pub id: Uuid,
    pub tracking_id: Uuid,
    pub url: String,
    pub structure: Value,
    pub created_at: DateTime<Utc>,
}

/// External collaborator: persistence for pipeline end products.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn save_match(&self, record: &JobMatch) -> Result<(), FetchError>;
    async fn save_company(&self, profile: &CompanyProfile) -> Result<(), FetchError>;
    async fn save_source(&self, source: &JobSource) -> Result<(), FetchError>;
}

/// Everything a processor needs to run a stage.
pub struct ProcessorContext {
    /// Serves every AI stage.
    pub agents: Arc<AgentManager>,
    /// Scrapes job listings.
    pub scraper: Arc<dyn JobScraper>,
    /// Fetches company pages and source samples.
    pub fetcher: Arc<dyn CompanyFetcher>,
    /// Scores extracted job facts.
    pub scorer: Arc<dyn ScoringEngine>,
    /// Persists end products.
    pub sink: Arc<dyn MatchStore>,
    /// Lineage propagation and depth cap.
    pub lineage: LineageTracker,
    /// Deterministic pre-filter gates for the job filter stage.
    pub filter_policy: FilterPolicy,
    /// Minimum score for a job to be saved.
    pub score_threshold: f64,
    /// Calling scope reported to the agent manager.
    pub scope: String,
}

/// One pipeline's stage logic. Implementations are stateless; all working
/// data travels in the item's pipeline state.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Whether this processor handles the given item type.
    fn handles(&self, item_type: ItemType) -> bool;

    /// Runs the item's current stage.
    async fn run_stage(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError>;
}

/// Parses a JSON object out of an agent completion.
///
/// Models wrap payloads in markdown fences often enough that this strips a
/// leading ```/```json fence pair before parsing. Anything that still fails
/// to parse is a stage-local error, not an agent failure.
pub(crate) fn parse_json_payload(text: &str) -> Result<Value, StageError> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(inner.trim())
        .map_err(|e| StageError::Stage(format!("malformed agent payload: {e}")))
}

/// Builds the child item carrying the next stage of a pipeline.
///
/// The child inherits the parent's tracking id and pipeline state; the
/// incremented depth comes from the lineage tracker. Scrape requests
/// produce job-pipeline children.
pub(crate) fn spawn_child(
    parent: &QueueItem,
    ctx: &ProcessorContext,
    sub_task: SubTask,
) -> Result<QueueItem, StageError> {
    let lineage = ctx.lineage.child_of(parent)?;

    let item_type = match parent.item_type {
        ItemType::ScrapeRequest => ItemType::Job,
        other => other,
    };

    let mut child = QueueItem::new_root(item_type, lineage.tracking_id)
        .with_sub_task(sub_task)
        .with_pipeline_state(parent.pipeline_state.clone())
        .with_max_retries(parent.max_retries);
    child.parent_item_id = Some(parent.id);
    child.lineage_depth = lineage.depth;
    Ok(child)
}
