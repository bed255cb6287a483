//! Queue item definitions for the processing engine.
//!
//! This module defines the unit of work that moves through the pipelines:
//!
//! - `QueueItem`: A persisted unit of work
//! - `ItemType`: Which pipeline the item belongs to
//! - `ItemStatus`: Lifecycle state of the item
//! - `JobStage` / `CompanyStage`: The named sub-task within a pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default maximum number of retry attempts for an item.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Which pipeline a queue item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// A single job posting moving through scrape → filter → analyze → save.
    Job,
    /// A company profile moving through fetch → extract → analyze → save.
    Company,
    /// An order to scrape a listing source; enters the job pipeline at scrape.
    ScrapeRequest,
    /// Discovery of a new listing source.
    SourceDiscovery,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemType::Job => write!(f, "job"),
            ItemType::Company => write!(f, "company"),
            ItemType::ScrapeRequest => write!(f, "scrape_request"),
            ItemType::SourceDiscovery => write!(f, "source_discovery"),
        }
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed by the worker.
    Pending,
    /// Claimed and currently being processed.
    Processing,
    /// Completed its stage (or full pipeline) successfully.
    Success,
    /// Failed terminally after exhausting retries or on a stage error.
    Failed,
    /// Analyzed but scored below the match threshold.
    Skipped,
    /// Rejected by the deterministic pre-filter gates.
    Filtered,
    /// Cancelled by an administrative action.
    Cancelled,
}

impl ItemStatus {
    /// Returns whether this status is terminal (the item will not be
    /// dispatched again).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending | ItemStatus::Processing)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Processing => write!(f, "processing"),
            ItemStatus::Success => write!(f, "success"),
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::Skipped => write!(f, "skipped"),
            ItemStatus::Filtered => write!(f, "filtered"),
            ItemStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Stage of the job pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Scrape,
    Filter,
    Analyze,
    Save,
}

/// Stage of the company pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStage {
    Fetch,
    Extract,
    Analyze,
    Save,
}

/// The named sub-task carried by a staged item.
///
/// Legacy monolithic items carry no sub-task at all; processors must run the
/// full stage sequence in one pass for those (see the company processor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "pipeline", content = "stage")]
pub enum SubTask {
    Job(JobStage),
    Company(CompanyStage),
}

/// A persisted unit of work.
///
/// Items are created either by submission (roots, with a fresh tracking id)
/// or by a processor completing a stage (children, inheriting the parent's
/// tracking id). The worker loop owns status and timestamps; the processor
/// currently holding the item owns `pipeline_state` and the terminal status
/// decision. The engine never deletes items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Stable, opaque identifier.
    pub id: Uuid,
    /// Which pipeline this item belongs to.
    pub item_type: ItemType,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Current stage, absent for legacy monolithic items.
    #[serde(default)]
    pub sub_task: Option<SubTask>,
    /// Opaque key/value bag carrying intermediate results between stages.
    #[serde(default)]
    pub pipeline_state: Map<String, Value>,
    /// The item that spawned this one, if any.
    #[serde(default)]
    pub parent_item_id: Option<Uuid>,
    /// Lineage identifier, shared with the root ancestor and every item
    /// transitively spawned from it.
    pub tracking_id: Uuid,
    /// Number of spawns between this item and its root ancestor.
    #[serde(default)]
    pub lineage_depth: u32,
    /// Number of processing attempts so far.
    pub retry_count: u32,
    /// Maximum processing attempts before the item is failed.
    pub max_retries: u32,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// When the item was last written.
    pub updated_at: DateTime<Utc>,
    /// When processing last started.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable outcome for terminal items.
    #[serde(default)]
    pub result_message: Option<String>,
    /// Error details for failed items.
    #[serde(default)]
    pub error_details: Option<String>,
}

impl QueueItem {
    /// Creates a new root item with a fresh tracking id.
    pub fn new_root(item_type: ItemType, tracking_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            item_type,
            status: ItemStatus::Pending,
            sub_task: None,
            pipeline_state: Map::new(),
            parent_item_id: None,
            tracking_id,
            lineage_depth: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            processed_at: None,
            completed_at: None,
            result_message: None,
            error_details: None,
        }
    }

    /// Sets the initial sub-task (stage) for a staged item.
    pub fn with_sub_task(mut self, sub_task: SubTask) -> Self {
        self.sub_task = Some(sub_task);
        self
    }

    /// Sets the initial pipeline state.
    pub fn with_pipeline_state(mut self, state: Map<String, Value>) -> Self {
        self.pipeline_state = state;
        self
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Reads a value out of the pipeline state bag.
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.pipeline_state.get(key)
    }

    /// Writes a value into the pipeline state bag.
    pub fn set_state_value(&mut self, key: impl Into<String>, value: Value) {
        self.pipeline_state.insert(key.into(), value);
    }

    /// Returns whether the item should be retried after a failure.
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Marks the item terminal with the given status and message.
    pub fn finish(&mut self, status: ItemStatus, message: impl Into<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.result_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}
