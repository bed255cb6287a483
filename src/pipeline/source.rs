//! Source discovery: characterize a new listing source and queue it for
//! scraping.
//!
//! Discovery is a single-stage pipeline: fetch a sample of the source page,
//! have an analysis agent describe the listing structure, persist the source
//! record, then spawn one scrape request per listing found so the job
//! pipeline starts consuming the source.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::agents::TaskType;
use crate::queue::{ItemType, QueueItem};

use super::{
    parse_json_payload, JobSource, ProcessorContext, StageError, StageOutcome, StageProcessor,
};

/// Processor for source-discovery items.
pub struct SourceDiscoveryProcessor;

#[async_trait]
impl StageProcessor for SourceDiscoveryProcessor {
    fn handles(&self, item_type: ItemType) -> bool {
        matches!(item_type, ItemType::SourceDiscovery)
    }

    async fn run_stage(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let target = Value::Object(item.pipeline_state.clone());
        let fetched = ctx
            .fetcher
            .fetch(&target)
            .await
            .map_err(|e| StageError::Stage(format!("source fetch failed: {}", e.0)))?;

        let url = item
            .state_value("url")
            .or_else(|| fetched.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StageError::Stage("source url missing".to_string()))?;

        let prompt = structure_prompt(&url, &fetched);
        let completion = ctx
            .agents
            .execute(TaskType::Analysis, &prompt, &ctx.scope, None)
            .await?;
        let structure = parse_json_payload(&completion.text)?;

        let source = JobSource {
            id: Uuid::new_v4(),
            tracking_id: item.tracking_id,
            url: url.clone(),
            structure: structure.clone(),
            created_at: Utc::now(),
        };
        ctx.sink
            .save_source(&source)
            .await
            .map_err(|e| StageError::Stage(format!("source save failed: {}", e.0)))?;

        // One scrape request per discovered listing, all under the same
        // lineage. A source with no individual listings yet is scraped as a
        // whole page.
        let listings = listing_urls(&structure)
            .or_else(|| listing_urls(&fetched))
            .unwrap_or_else(|| vec![url.clone()]);

        let lineage = ctx.lineage.child_of(item)?;
        let children: Vec<QueueItem> = listings
            .iter()
            .map(|listing| {
                let mut state = Map::new();
                state.insert("url".to_string(), Value::String(listing.clone()));
                state.insert("source".to_string(), structure.clone());
                let mut child = QueueItem::new_root(ItemType::ScrapeRequest, lineage.tracking_id)
                    .with_pipeline_state(state)
                    .with_max_retries(item.max_retries);
                child.parent_item_id = Some(item.id);
                child.lineage_depth = lineage.depth;
                child
            })
            .collect();

        info!(
            item_id = %item.id,
            url = %url,
            listings = children.len(),
            "job source saved and queued for scraping"
        );
        Ok(StageOutcome::Spawn {
            message: format!("source {url} characterized; {} scrapes queued", children.len()),
            children,
        })
    }
}

/// Listing URLs reported in a structure or fetched-page object, if any.
fn listing_urls(value: &Value) -> Option<Vec<String>> {
    let urls: Vec<String> = value
        .get("listing_urls")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    if urls.is_empty() {
        None
    } else {
        Some(urls)
    }
}

fn structure_prompt(url: &str, fetched: &Value) -> String {
    format!(
        "This page at {url} lists job postings. Describe its listing structure as a \
         single JSON object: listing_selector, pagination, fields, listing_urls \
         (absolute URLs of the individual postings visible on the page), notes. \
         Reply with JSON only.\n\n{fetched}"
    )
}
