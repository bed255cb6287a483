//! Daily budget reset job.
//!
//! Once a day, at a configured local hour, every agent's shared usage
//! counter is zeroed, every (agent, scope) pair disabled for quota is
//! re-enabled, and the queue halt is cleared so a halted worker resumes on
//! its next poll. Provider-failure disables survive the reset; those need an
//! operator.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agents::state::{ResetSummary, StateStoreError};
use crate::agents::AgentStateStore;
use crate::queue::{QueueRepository, RepositoryError};

/// Errors that can occur during a budget reset.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// The scheduled reset job.
pub struct BudgetResetJob {
    state: Arc<dyn AgentStateStore>,
    repo: Arc<dyn QueueRepository>,
    reset_hour: u32,
}

impl BudgetResetJob {
    /// Creates a job that fires at minute zero of `reset_hour` local time.
    pub fn new(state: Arc<dyn AgentStateStore>, repo: Arc<dyn QueueRepository>, reset_hour: u32) -> Self {
        Self {
            state,
            repo,
            reset_hour,
        }
    }

    /// Performs one reset immediately.
    pub async fn run_once(&self) -> Result<ResetSummary, BudgetError> {
        let summary = self.state.reset_daily().await?;
        self.repo.clear_stop_reason().await?;

        info!(
            usage_counters_reset = summary.usage_counters_reset,
            scopes_reenabled = summary.scopes_reenabled,
            "daily budget reset complete"
        );
        Ok(summary)
    }

    /// Runs the job on its daily schedule until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = sleep_until_next(Local::now(), self.reset_hour);
            info!(seconds = wait.as_secs(), "next budget reset scheduled");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "budget reset failed; retrying next cycle");
                    }
                }
            }
        }
    }
}

/// Time until the next occurrence of `hour:00` local time, strictly in the
/// future. A reset firing exactly on the boundary waits a full day.
fn sleep_until_next(now: DateTime<Local>, hour: u32) -> std::time::Duration {
    let today = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0));

    let next = match today {
        Some(candidate) if candidate > now => candidate,
        Some(candidate) => candidate + ChronoDuration::days(1),
        // Unrepresentable local time (DST gap): try again in an hour.
        None => return std::time::Duration::from_secs(3600),
    };

    (next - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(3600))
}
