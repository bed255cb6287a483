//! Job pipeline: scrape → filter → analyze → save.
//!
//! Each stage runs as its own queue item. The scrape stage pulls raw listing
//! data, the filter stage applies the deterministic gates before any AI
//! spend, the analyze stage extracts structured facts with an extraction
//! agent and scores them, and the save stage persists the match.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::TaskType;
use crate::queue::{ItemStatus, ItemType, JobStage, QueueItem, SubTask};

use super::{
    parse_json_payload, spawn_child, JobMatch, ProcessorContext, ScoreReport, StageError,
    StageOutcome, StageProcessor,
};

/// Processor for the job pipeline.
///
/// Scrape requests are served here too: they enter at the scrape stage and
/// spawn job-pipeline children.
pub struct JobProcessor;

impl JobProcessor {
    fn stage_of(item: &QueueItem) -> Result<JobStage, StageError> {
        match item.sub_task {
            // Items submitted without a stage enter the pipeline at the top.
            None => Ok(JobStage::Scrape),
            Some(SubTask::Job(stage)) => Ok(stage),
            Some(SubTask::Company(_)) => Err(StageError::Stage(
                "company stage on a job pipeline item".to_string(),
            )),
        }
    }

    async fn scrape(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let target = Value::Object(item.pipeline_state.clone());
        let scraped = ctx
            .scraper
            .scrape(&target)
            .await
            .map_err(|e| StageError::Stage(format!("scrape failed: {}", e.0)))?;

        debug!(item_id = %item.id, "scrape stage complete");
        item.set_state_value("scraped", scraped);

        let child = spawn_child(item, ctx, SubTask::Job(JobStage::Filter))?;
        Ok(StageOutcome::Spawn {
            children: vec![child],
            message: "scraped; queued for filtering".to_string(),
        })
    }

    fn filter(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let scraped = item
            .state_value("scraped")
            .ok_or_else(|| StageError::Stage("filter stage without scraped data".to_string()))?;

        let verdict = ctx.filter_policy.evaluate(scraped, Utc::now());
        if !verdict.passed() {
            info!(item_id = %item.id, "posting rejected by filter gates");
            return Ok(StageOutcome::Terminal {
                status: ItemStatus::Filtered,
                message: verdict.summary(),
            });
        }

        let child = spawn_child(item, ctx, SubTask::Job(JobStage::Analyze))?;
        Ok(StageOutcome::Spawn {
            children: vec![child],
            message: "passed all filter gates".to_string(),
        })
    }

    async fn analyze(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let scraped = item
            .state_value("scraped")
            .ok_or_else(|| StageError::Stage("analyze stage without scraped data".to_string()))?;

        let prompt = extraction_prompt(scraped);
        let completion = ctx
            .agents
            .execute(TaskType::Extraction, &prompt, &ctx.scope, None)
            .await?;
        let facts = parse_json_payload(&completion.text)?;

        let report = ctx.scorer.score(&facts);
        debug!(
            item_id = %item.id,
            agent_id = %completion.agent_id,
            score = report.final_score,
            "analyze stage complete"
        );

        item.set_state_value("facts", facts);
        item.set_state_value(
            "score",
            serde_json::to_value(&report)
                .map_err(|e| StageError::Stage(format!("unencodable score report: {e}")))?,
        );

        if !report.passed || report.final_score < ctx.score_threshold {
            return Ok(StageOutcome::Terminal {
                status: ItemStatus::Skipped,
                message: format!(
                    "score {:.1} below threshold {:.1}",
                    report.final_score, ctx.score_threshold
                ),
            });
        }

        let child = spawn_child(item, ctx, SubTask::Job(JobStage::Save))?;
        Ok(StageOutcome::Spawn {
            children: vec![child],
            message: format!("scored {:.1}; queued for save", report.final_score),
        })
    }

    async fn save(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        let facts = item
            .state_value("facts")
            .cloned()
            .ok_or_else(|| StageError::Stage("save stage without extracted facts".to_string()))?;
        let report: ScoreReport = item
            .state_value("score")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| StageError::Stage("save stage without score report".to_string()))?;

        let scraped = item.state_value("scraped");
        let title = text_of(&facts, "title")
            .or_else(|| scraped.and_then(|s| text_of(s, "title")))
            .unwrap_or_else(|| "unknown".to_string());
        let company = text_of(&facts, "company");
        let url = scraped
            .and_then(|s| text_of(s, "url"))
            .or_else(|| text_of(&facts, "url"));

        let record = JobMatch {
            id: Uuid::new_v4(),
            tracking_id: item.tracking_id,
            title,
            company,
            url,
            score: report.final_score,
            breakdown: report.breakdown,
            facts,
            created_at: Utc::now(),
        };
        ctx.sink
            .save_match(&record)
            .await
            .map_err(|e| StageError::Stage(format!("match save failed: {}", e.0)))?;

        info!(item_id = %item.id, score = record.score, "job match saved");
        Ok(StageOutcome::Terminal {
            status: ItemStatus::Success,
            message: format!("match saved with score {:.1}", record.score),
        })
    }
}

#[async_trait]
impl StageProcessor for JobProcessor {
    fn handles(&self, item_type: ItemType) -> bool {
        matches!(item_type, ItemType::Job | ItemType::ScrapeRequest)
    }

    async fn run_stage(
        &self,
        item: &mut QueueItem,
        ctx: &ProcessorContext,
    ) -> Result<StageOutcome, StageError> {
        match Self::stage_of(item)? {
            JobStage::Scrape => self.scrape(item, ctx).await,
            JobStage::Filter => self.filter(item, ctx),
            JobStage::Analyze => self.analyze(item, ctx).await,
            JobStage::Save => self.save(item, ctx).await,
        }
    }
}

fn extraction_prompt(scraped: &Value) -> String {
    format!(
        "Extract the following fields from this job posting as a single JSON object: \
         title, company, url, location, work_arrangement, employment_type, salary_min, \
         salary_max, technologies, seniority, summary. Use null for unknown fields and \
         reply with JSON only.\n\n{scraped}"
    )
}

fn text_of(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
