//! The single-consumer worker loop.
//!
//! One worker drains the queue: check the halt flag, claim the oldest
//! pending item, dispatch it to the processor for its pipeline, persist the
//! outcome. Stage-local failures cost the item a retry; agent-manager
//! failures halt the whole queue so no further AI spend happens until an
//! operator (or the daily budget reset) clears the halt.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::company::CompanyProcessor;
use crate::pipeline::job::JobProcessor;
use crate::pipeline::source::SourceDiscoveryProcessor;
use crate::pipeline::{ProcessorContext, StageOutcome, StageProcessor};
use crate::queue::{ItemStatus, QueueItem, QueueRepository, RepositoryError};

/// Default idle poll interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-item processing timeout.
const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that stop a single worker tick.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The repository failed; the loop backs off and retries.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What one tick of the loop did.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The queue is halted; nothing was claimed.
    Halted,
    /// No pending items.
    Idle,
    /// One item was claimed and its outcome written back.
    Processed(Uuid),
}

/// The queue consumer.
pub struct WorkerLoop {
    repo: Arc<dyn QueueRepository>,
    processors: Vec<Box<dyn StageProcessor>>,
    ctx: ProcessorContext,
    poll_interval: Duration,
    processing_timeout: Duration,
}

impl WorkerLoop {
    /// Creates a worker serving all three pipelines.
    pub fn new(repo: Arc<dyn QueueRepository>, ctx: ProcessorContext) -> Self {
        Self {
            repo,
            processors: vec![
                Box::new(JobProcessor),
                Box::new(CompanyProcessor),
                Box::new(SourceDiscoveryProcessor),
            ],
            ctx,
            poll_interval: DEFAULT_POLL_INTERVAL,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
        }
    }

    /// Replaces the processor set.
    pub fn with_processors(mut self, processors: Vec<Box<dyn StageProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-item processing timeout.
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Runs the loop until `shutdown` flips to `true`. The item in flight
    /// when shutdown arrives is finished and written back first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                // Drain without sleeping while work is available.
                Ok(WorkerEvent::Processed(_)) => continue,
                Ok(WorkerEvent::Idle) => {}
                Ok(WorkerEvent::Halted) => {}
                Err(e) => warn!(error = %e, "worker tick failed; backing off"),
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("worker loop stopped");
    }

    /// Runs one poll cycle: halt check, claim, dispatch, write back.
    pub async fn tick(&self) -> Result<WorkerEvent, WorkerError> {
        if let Some(reason) = self.repo.stop_reason().await? {
            debug!(reason = %reason, "queue halted; not claiming");
            return Ok(WorkerEvent::Halted);
        }

        let Some(mut item) = self.repo.claim_next().await? else {
            return Ok(WorkerEvent::Idle);
        };

        let id = item.id;
        debug!(item_id = %id, item_type = %item.item_type, "claimed item");
        self.process(&mut item).await?;
        self.repo.update(&item).await?;
        Ok(WorkerEvent::Processed(id))
    }

    /// Dispatches one claimed item and applies the outcome to it. New child
    /// items are persisted here; the caller writes the item itself back.
    async fn process(&self, item: &mut QueueItem) -> Result<(), WorkerError> {
        let Some(processor) = self.processors.iter().find(|p| p.handles(item.item_type)) else {
            item.finish(
                ItemStatus::Failed,
                format!("no processor for item type '{}'", item.item_type),
            );
            return Ok(());
        };

        let run = processor.run_stage(item, &self.ctx);
        match tokio::time::timeout(self.processing_timeout, run).await {
            Ok(Ok(StageOutcome::Terminal { status, message })) => {
                item.finish(status, message);
            }
            Ok(Ok(StageOutcome::Spawn { children, message })) => {
                for child in &children {
                    self.repo.create(child).await?;
                }
                item.finish(ItemStatus::Success, message);
            }
            Ok(Err(e)) if e.is_fatal() => {
                // Not the item's fault: put it back untouched and halt the
                // queue until the budgets reset or an operator intervenes.
                error!(item_id = %item.id, error = %e, "agent failure; halting queue");
                item.status = ItemStatus::Pending;
                self.repo.set_stop_reason(&e.to_string()).await?;
            }
            Ok(Err(e)) => self.retry_or_fail(item, e.to_string()),
            Err(_) => {
                warn!(item_id = %item.id, "item processing timed out");
                self.retry_or_fail(
                    item,
                    format!(
                        "processing timed out after {}s",
                        self.processing_timeout.as_secs()
                    ),
                );
            }
        }
        Ok(())
    }

    fn retry_or_fail(&self, item: &mut QueueItem, detail: String) {
        item.retry_count += 1;
        item.error_details = Some(detail.clone());
        if item.should_retry() {
            debug!(
                item_id = %item.id,
                attempt = item.retry_count,
                "stage failed; re-queueing"
            );
            item.status = ItemStatus::Pending;
        } else {
            item.finish(ItemStatus::Failed, detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        AgentConfig, AgentManager, AgentRegistry, AgentStateStore, GenerationOptions,
        InMemoryAgentStateStore, ProviderAdapter, ProviderError, StaticRegistryStore, TaskType,
    };
    use crate::pipeline::{
        CompanyFetcher, CompanyProfile, FetchError, FilterPolicy, JobMatch, JobScraper,
        JobSource, MatchStore, ScoreReport, ScoringEngine, StageError,
    };
    use crate::queue::{ItemType, JobStage, LineageTracker, SubTask};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Plain map-backed repository for loop tests.
    #[derive(Default)]
    struct InMemoryRepo {
        items: Mutex<HashMap<Uuid, QueueItem>>,
        stop: Mutex<Option<String>>,
    }

    #[async_trait]
    impl QueueRepository for InMemoryRepo {
        async fn claim_next(&self) -> Result<Option<QueueItem>, RepositoryError> {
            let mut items = self.items.lock().unwrap();
            let next = items
                .values()
                .filter(|i| i.status == ItemStatus::Pending)
                .min_by_key(|i| i.created_at)
                .map(|i| i.id);
            Ok(next.map(|id| {
                let item = items.get_mut(&id).unwrap();
                item.status = ItemStatus::Processing;
                item.processed_at = Some(chrono::Utc::now());
                item.clone()
            }))
        }

        async fn create(&self, item: &QueueItem) -> Result<(), RepositoryError> {
            self.items.lock().unwrap().insert(item.id, item.clone());
            Ok(())
        }

        async fn update(&self, item: &QueueItem) -> Result<(), RepositoryError> {
            let mut items = self.items.lock().unwrap();
            match items.get(&item.id) {
                Some(stored) if stored.status == ItemStatus::Cancelled => Ok(()),
                Some(_) => {
                    items.insert(item.id, item.clone());
                    Ok(())
                }
                None => Err(RepositoryError::NotFound(item.id)),
            }
        }

        async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RepositoryError> {
            Ok(self.items.lock().unwrap().get(&id).cloned())
        }

        async fn stop_reason(&self) -> Result<Option<String>, RepositoryError> {
            Ok(self.stop.lock().unwrap().clone())
        }

        async fn set_stop_reason(&self, reason: &str) -> Result<(), RepositoryError> {
            *self.stop.lock().unwrap() = Some(reason.to_string());
            Ok(())
        }

        async fn clear_stop_reason(&self) -> Result<(), RepositoryError> {
            *self.stop.lock().unwrap() = None;
            Ok(())
        }
    }

    struct FixedScraper(Value);

    #[async_trait]
    impl JobScraper for FixedScraper {
        async fn scrape(&self, _target: &Value) -> Result<Value, FetchError> {
            Ok(self.0.clone())
        }
    }

    struct FixedFetcher;

    #[async_trait]
    impl CompanyFetcher for FixedFetcher {
        async fn fetch(&self, _target: &Value) -> Result<Value, FetchError> {
            Ok(json!({"url": "https://acme.example.com"}))
        }
    }

    struct FixedScorer;

    impl ScoringEngine for FixedScorer {
        fn score(&self, _facts: &Value) -> ScoreReport {
            ScoreReport {
                final_score: 80.0,
                passed: true,
                breakdown: json!({}),
            }
        }
    }

    struct NullSink;

    #[async_trait]
    impl MatchStore for NullSink {
        async fn save_match(&self, _record: &JobMatch) -> Result<(), FetchError> {
            Ok(())
        }
        async fn save_company(&self, _profile: &CompanyProfile) -> Result<(), FetchError> {
            Ok(())
        }
        async fn save_source(&self, _source: &JobSource) -> Result<(), FetchError> {
            Ok(())
        }
    }

    struct CannedAdapter(String);

    #[async_trait]
    impl ProviderAdapter for CannedAdapter {
        async fn generate(
            &self,
            _prompt: &str,
            _model: &str,
            _options: &GenerationOptions,
        ) -> Result<String, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn manager(agent_reply: &str, with_agents: bool) -> Arc<AgentManager> {
        let registry = if with_agents {
            let mut agents = HashMap::new();
            agents.insert(
                "test.api".to_string(),
                AgentConfig {
                    provider: "test".to_string(),
                    interface: "api".to_string(),
                    default_model: "test-model".to_string(),
                    daily_budget: 100.0,
                    auth: Default::default(),
                },
            );
            let mut task_fallbacks = HashMap::new();
            task_fallbacks.insert(TaskType::Extraction, vec!["test.api".to_string()]);
            task_fallbacks.insert(TaskType::Analysis, vec!["test.api".to_string()]);
            AgentRegistry {
                agents,
                task_fallbacks,
                model_rates: HashMap::new(),
            }
        } else {
            AgentRegistry::default()
        };

        let reply = agent_reply.to_string();
        let state: Arc<dyn AgentStateStore> = Arc::new(InMemoryAgentStateStore::default());
        Arc::new(
            AgentManager::new(Arc::new(StaticRegistryStore::new(registry)), state)
                .with_adapter_factory(Arc::new(move |_: &AgentConfig| {
                    Ok(Box::new(CannedAdapter(reply.clone())) as Box<dyn ProviderAdapter>)
                })),
        )
    }

    fn context(agent_reply: &str, with_agents: bool) -> ProcessorContext {
        ProcessorContext {
            agents: manager(agent_reply, with_agents),
            scraper: Arc::new(FixedScraper(json!({"title": "Rust Engineer"}))),
            fetcher: Arc::new(FixedFetcher),
            scorer: Arc::new(FixedScorer),
            sink: Arc::new(NullSink),
            lineage: LineageTracker::new(),
            filter_policy: FilterPolicy::default(),
            score_threshold: 60.0,
            scope: "worker".to_string(),
        }
    }

    fn worker(repo: Arc<InMemoryRepo>, ctx: ProcessorContext) -> WorkerLoop {
        WorkerLoop::new(repo, ctx)
            .with_poll_interval(Duration::from_millis(10))
            .with_processing_timeout(Duration::from_secs(30))
    }

    fn facts_reply() -> &'static str {
        r#"{"title": "Rust Engineer", "company": "Acme"}"#
    }

    #[tokio::test]
    async fn test_tick_idle_on_empty_queue() {
        let repo = Arc::new(InMemoryRepo::default());
        let loop_ = worker(repo, context(facts_reply(), true));

        assert_eq!(loop_.tick().await.unwrap(), WorkerEvent::Idle);
    }

    #[tokio::test]
    async fn test_tick_does_not_claim_while_halted() {
        let repo = Arc::new(InMemoryRepo::default());
        repo.set_stop_reason("error: provider down").await.unwrap();
        repo.create(&QueueItem::new_root(ItemType::Job, Uuid::new_v4()))
            .await
            .unwrap();

        let loop_ = worker(repo.clone(), context(facts_reply(), true));
        assert_eq!(loop_.tick().await.unwrap(), WorkerEvent::Halted);

        // The pending item was not touched.
        let items = repo.items.lock().unwrap();
        assert!(items.values().all(|i| i.status == ItemStatus::Pending));
    }

    #[tokio::test]
    async fn test_spawn_persists_child_and_completes_parent() {
        let repo = Arc::new(InMemoryRepo::default());
        let parent = QueueItem::new_root(ItemType::Job, Uuid::new_v4());
        let parent_id = parent.id;
        repo.create(&parent).await.unwrap();

        let loop_ = worker(repo.clone(), context(facts_reply(), true));
        assert_eq!(
            loop_.tick().await.unwrap(),
            WorkerEvent::Processed(parent_id)
        );

        let items = repo.items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[&parent_id].status, ItemStatus::Success);

        let child = items.values().find(|i| i.id != parent_id).unwrap();
        assert_eq!(child.status, ItemStatus::Pending);
        assert_eq!(child.sub_task, Some(SubTask::Job(JobStage::Filter)));
        assert_eq!(child.parent_item_id, Some(parent_id));
    }

    #[tokio::test]
    async fn test_terminal_outcome_written_back() {
        let repo = Arc::new(InMemoryRepo::default());
        let mut item = QueueItem::new_root(ItemType::Job, Uuid::new_v4())
            .with_sub_task(SubTask::Job(JobStage::Filter));
        item.set_state_value("scraped", json!({"title": "Ops Associate"}));
        let id = item.id;
        repo.create(&item).await.unwrap();

        let mut ctx = context(facts_reply(), true);
        ctx.filter_policy.required_title_keywords = vec!["rust".to_string()];

        worker(repo.clone(), ctx).tick().await.unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Filtered);
        assert!(stored.result_message.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_halts_queue_and_requeues_item() {
        let repo = Arc::new(InMemoryRepo::default());
        let mut item = QueueItem::new_root(ItemType::Job, Uuid::new_v4())
            .with_sub_task(SubTask::Job(JobStage::Analyze));
        item.set_state_value("scraped", json!({"title": "Rust Engineer"}));
        let id = item.id;
        repo.create(&item).await.unwrap();

        // No agents configured: the chain is empty and the queue must halt.
        let loop_ = worker(repo.clone(), context(facts_reply(), false));
        loop_.tick().await.unwrap();

        let reason = repo.stop_reason().await.unwrap().expect("queue halted");
        assert!(reason.contains("no agents available"));

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        // The next tick refuses to claim the requeued item.
        assert_eq!(loop_.tick().await.unwrap(), WorkerEvent::Halted);
    }

    #[tokio::test]
    async fn test_stage_error_retries_then_fails() {
        let repo = Arc::new(InMemoryRepo::default());
        let mut item = QueueItem::new_root(ItemType::Job, Uuid::new_v4())
            .with_sub_task(SubTask::Job(JobStage::Analyze))
            .with_max_retries(1);
        item.set_state_value("scraped", json!({"title": "Rust Engineer"}));
        let id = item.id;
        repo.create(&item).await.unwrap();

        // Unparseable agent output is a stage-local failure.
        let loop_ = worker(repo.clone(), context("not json", true));

        loop_.tick().await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_details.is_some());

        loop_.tick().await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert!(repo.stop_reason().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_item_type_fails_item() {
        let repo = Arc::new(InMemoryRepo::default());
        let item = QueueItem::new_root(ItemType::Company, Uuid::new_v4());
        let id = item.id;
        repo.create(&item).await.unwrap();

        let loop_ = worker(repo.clone(), context(facts_reply(), true))
            .with_processors(vec![Box::new(JobProcessor)]);
        loop_.tick().await.unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert!(stored
            .result_message
            .as_deref()
            .unwrap()
            .contains("no processor"));
    }

    struct StalledProcessor;

    #[async_trait]
    impl StageProcessor for StalledProcessor {
        fn handles(&self, _item_type: ItemType) -> bool {
            true
        }

        async fn run_stage(
            &self,
            _item: &mut QueueItem,
            _ctx: &ProcessorContext,
        ) -> Result<StageOutcome, StageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("the worker must time this stage out");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_costs_a_retry() {
        let repo = Arc::new(InMemoryRepo::default());
        let item = QueueItem::new_root(ItemType::Job, Uuid::new_v4());
        let id = item.id;
        repo.create(&item).await.unwrap();

        let loop_ = worker(repo.clone(), context(facts_reply(), true))
            .with_processors(vec![Box::new(StalledProcessor)])
            .with_processing_timeout(Duration::from_millis(50));
        loop_.tick().await.unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_details.as_deref().unwrap().contains("timed out"));
    }

    /// Cancels the stored row while the stage is running, the way an
    /// operator racing the worker would.
    struct CancellingProcessor(Arc<InMemoryRepo>);

    #[async_trait]
    impl StageProcessor for CancellingProcessor {
        fn handles(&self, _item_type: ItemType) -> bool {
            true
        }

        async fn run_stage(
            &self,
            item: &mut QueueItem,
            _ctx: &ProcessorContext,
        ) -> Result<StageOutcome, StageError> {
            let mut items = self.0.items.lock().unwrap();
            items.get_mut(&item.id).unwrap().status = ItemStatus::Cancelled;
            drop(items);
            Ok(StageOutcome::Terminal {
                status: ItemStatus::Success,
                message: "done".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_cancellation_survives_in_flight_write_back() {
        let repo = Arc::new(InMemoryRepo::default());
        let item = QueueItem::new_root(ItemType::Job, Uuid::new_v4());
        let id = item.id;
        repo.create(&item).await.unwrap();

        let loop_ = worker(repo.clone(), context(facts_reply(), true))
            .with_processors(vec![Box::new(CancellingProcessor(repo.clone()))]);
        assert_eq!(loop_.tick().await.unwrap(), WorkerEvent::Processed(id));

        // The stage finished with success, but the cancellation wins.
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_honors_shutdown_signal() {
        let repo = Arc::new(InMemoryRepo::default());
        let loop_ = worker(repo, context(facts_reply(), true));

        let (tx, rx) = watch::channel(true);
        // Already shut down: run must return without polling forever.
        loop_.run(rx).await;
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_pipeline_to_completion() {
        let repo = Arc::new(InMemoryRepo::default());
        let root = QueueItem::new_root(ItemType::Job, Uuid::new_v4());
        let tracking = root.tracking_id;
        repo.create(&root).await.unwrap();

        let loop_ = Arc::new(worker(repo.clone(), context(facts_reply(), true)));
        let (tx, rx) = watch::channel(false);
        let runner = {
            let loop_ = loop_.clone();
            tokio::spawn(async move { loop_.run(rx).await })
        };

        // Scrape, filter, analyze and save each take one tick; give the
        // loop a few poll cycles to chew through them.
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        let items = repo.items.lock().unwrap();
        assert_eq!(items.len(), 4);
        assert!(items.values().all(|i| i.status == ItemStatus::Success));
        assert!(items.values().all(|i| i.tracking_id == tracking));
    }
}
