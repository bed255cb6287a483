//! Company pipeline: fetch → extract → analyze → save.
//!
//! Staged items run one transition per invocation like the job pipeline.
//! Legacy items submitted without a stage predate staged pipelines and still
//! exist in old queues; for those the whole sequence runs in a single pass
//! with no child items.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::TaskType;
use crate::queue::{CompanyStage, ItemStatus, ItemType, QueueItem, SubTask};

use super::{
    parse_json_payload, spawn_child, CompanyProfile, ProcessorContext, StageError, StageOutcome,
    StageProcessor,
};

/// Processor for the company pipeline.
pub struct CompanyProcessor;

impl CompanyProcessor {
    async fn do_fetch(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<(), StageError> {
        let target = Value::Object(item.pipeline_state.clone());
        let fetched = ctx
            .fetcher
            .fetch(&target)
            .await
            .map_err(|e| StageError::Stage(format!("company fetch failed: {}", e.0)))?;

        debug!(item_id = %item.id, "company fetch complete");
        item.set_state_value("fetched", fetched);
        Ok(())
    }

    async fn do_extract(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<(), StageError> {
        let fetched = item
            .state_value("fetched")
            .ok_or_else(|| StageError::Stage("extract stage without fetched page".to_string()))?;

        let prompt = extraction_prompt(fetched);
        let completion = ctx
            .agents
            .execute(TaskType::Extraction, &prompt, &ctx.scope, None)
            .await?;
        let facts = parse_json_payload(&completion.text)?;

        debug!(item_id = %item.id, agent_id = %completion.agent_id, "company extract complete");
        item.set_state_value("facts", facts);
        Ok(())
    }

    async fn do_analyze(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<(), StageError> {
        let facts = item
            .state_value("facts")
            .ok_or_else(|| StageError::Stage("analyze stage without extracted facts".to_string()))?;

        let prompt = analysis_prompt(facts);
        let completion = ctx
            .agents
            .execute(TaskType::Analysis, &prompt, &ctx.scope, None)
            .await?;
        let analysis = parse_json_payload(&completion.text)?;

        debug!(item_id = %item.id, agent_id = %completion.agent_id, "company analysis complete");
        item.set_state_value("analysis", analysis);
        Ok(())
    }

    async fn do_save(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<String, StageError> {
        let facts = item
            .state_value("facts")
            .cloned()
            .ok_or_else(|| StageError::Stage("save stage without extracted facts".to_string()))?;
        let analysis = item
            .state_value("analysis")
            .cloned()
            .ok_or_else(|| StageError::Stage("save stage without analysis".to_string()))?;

        let name = facts
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let website = facts
            .get("website")
            .or_else(|| item.state_value("fetched").and_then(|f| f.get("url")))
            .and_then(Value::as_str)
            .map(str::to_string);

        let profile = CompanyProfile {
            id: Uuid::new_v4(),
            tracking_id: item.tracking_id,
            name: name.clone(),
            website,
            facts,
            analysis,
            created_at: Utc::now(),
        };
        ctx.sink
            .save_company(&profile)
            .await
            .map_err(|e| StageError::Stage(format!("profile save failed: {}", e.0)))?;

        info!(item_id = %item.id, company = %name, "company profile saved");
        Ok(format!("profile saved for {name}"))
    }

    /// Runs every stage in one pass for a legacy item with no sub-task.
    async fn run_monolithic(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        self.do_fetch(item, ctx).await?;
        self.do_extract(item, ctx).await?;
        self.do_analyze(item, ctx).await?;
        let message = self.do_save(item, ctx).await?;

        Ok(StageOutcome::Terminal {
            status: ItemStatus::Success,
            message: format!("{message} (single pass)"),
        })
    }
}

#[async_trait]
impl StageProcessor for CompanyProcessor {
    fn handles(&self, item_type: ItemType) -> bool {
        matches!(item_type, ItemType::Company)
    }

    async fn run_stage(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let stage = match item.sub_task {
            None => return self.run_monolithic(item, ctx).await,
            Some(SubTask::Company(stage)) => stage,
            Some(SubTask::Job(_)) => {
                return Err(StageError::Stage(
                    "job stage on a company pipeline item".to_string(),
                ))
            }
        };

        match stage {
            CompanyStage::Fetch => {
                self.do_fetch(item, ctx).await?;
                let child = spawn_child(item, ctx, SubTask::Company(CompanyStage::Extract))?;
                Ok(StageOutcome::Spawn {
                    children: vec![child],
                    message: "page fetched; queued for extraction".to_string(),
                })
            }
            CompanyStage::Extract => {
                self.do_extract(item, ctx).await?;
                let child = spawn_child(item, ctx, SubTask::Company(CompanyStage::Analyze))?;
                Ok(StageOutcome::Spawn {
                    children: vec![child],
                    message: "facts extracted; queued for analysis".to_string(),
                })
            }
            CompanyStage::Analyze => {
                self.do_analyze(item, ctx).await?;
                let child = spawn_child(item, ctx, SubTask::Company(CompanyStage::Save))?;
                Ok(StageOutcome::Spawn {
                    children: vec![child],
                    message: "analysis complete; queued for save".to_string(),
                })
            }
            CompanyStage::Save => {
                let message = self.do_save(item, ctx).await?;
                Ok(StageOutcome::Terminal {
                    status: ItemStatus::Success,
                    message,
                })
            }
        }
    }
}

fn extraction_prompt(fetched: &Value) -> String {
    format!(
        "Extract company facts from this page as a single JSON object: name, website, \
         industry, size, headquarters, technologies, products. Use null for unknown \
         fields and reply with JSON only.\n\n{fetched}"
    )
}

fn analysis_prompt(facts: &Value) -> String {
    format!(
        "Analyze this company as a potential employer. Reply with a single JSON object: \
         culture_signals, growth_signals, risks, summary.\n\n{facts}"
    )
}
