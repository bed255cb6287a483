//! PostgreSQL client for persistent engine state.
//!
//! One `Database` value backs all three storage traits: the queue
//! repository, the agent state store and the end-product sink. The claim
//! query and the usage increment are the two operations with concurrency
//! contracts; both are pushed down into single SQL statements so the
//! database serializes them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::agents::state::{
    AgentStateStore, DisableReason, ResetSummary, RuntimeState, StateStoreError, QUOTA_PREFIX,
};
use crate::pipeline::{CompanyProfile, FetchError, JobMatch, JobSource, MatchStore};
use crate::queue::{QueueItem, QueueRepository, RepositoryError};

use super::migrations::MigrationRunner;
use super::schema::STOP_REASON_KEY;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// PostgreSQL database client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new client.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Item counts per status, for status reporting.
    pub async fn queue_counts(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM queue_items GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Per-agent daily usage counters, for status reporting.
    pub async fn usage_counters(&self) -> Result<Vec<(String, f64)>, DatabaseError> {
        let counters = sqlx::query_as::<_, (String, f64)>(
            "SELECT agent_id, daily_usage FROM agent_usage ORDER BY agent_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counters)
    }

    /// Number of saved job matches.
    pub async fn match_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_matches")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

/// Maps one queue_items row back into the item model.
fn item_from_row(row: &PgRow) -> Result<QueueItem, RepositoryError> {
    let item_type: String = row.get("item_type");
    let status: String = row.get("status");
    let sub_task: Option<Value> = row.get("sub_task");
    let pipeline_state: Value = row.get("pipeline_state");

    Ok(QueueItem {
        id: row.get("id"),
        item_type: serde_json::from_value(Value::String(item_type))?,
        status: serde_json::from_value(Value::String(status))?,
        sub_task: sub_task.map(serde_json::from_value).transpose()?,
        pipeline_state: pipeline_state.as_object().cloned().unwrap_or_default(),
        parent_item_id: row.get("parent_item_id"),
        tracking_id: row.get("tracking_id"),
        lineage_depth: row.get::<i32, _>("lineage_depth") as u32,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get::<Option<DateTime<Utc>>, _>("processed_at"),
        completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
        result_message: row.get("result_message"),
        error_details: row.get("error_details"),
    })
}

fn repo_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(e.to_string())
}

#[async_trait]
impl QueueRepository for Database {
    async fn claim_next(&self) -> Result<Option<QueueItem>, RepositoryError> {
        // Single-statement compare-and-swap: the inner select takes a row
        // lock, so concurrent claimers and administrative updates cannot
        // both move the same row out of pending.
        let row = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'processing', processed_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM queue_items
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(repo_err)?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn create(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO queue_items (
                id, item_type, status, sub_task, pipeline_state, parent_item_id,
                tracking_id, lineage_depth, retry_count, max_retries,
                created_at, updated_at, processed_at, completed_at,
                result_message, error_details
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(item.id)
        .bind(item.item_type.to_string())
        .bind(item.status.to_string())
        .bind(
            item.sub_task
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(Value::Object(item.pipeline_state.clone()))
        .bind(item.parent_item_id)
        .bind(item.tracking_id)
        .bind(item.lineage_depth as i32)
        .bind(item.retry_count as i32)
        .bind(item.max_retries as i32)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.processed_at)
        .bind(item.completed_at)
        .bind(&item.result_message)
        .bind(&item.error_details)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        Ok(())
    }

    async fn update(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        // A row cancelled while the item was in flight keeps its cancel.
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = $2, sub_task = $3, pipeline_state = $4, retry_count = $5,
                updated_at = $6, processed_at = $7, completed_at = $8,
                result_message = $9, error_details = $10
            WHERE id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(item.id)
        .bind(item.status.to_string())
        .bind(
            item.sub_task
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(Value::Object(item.pipeline_state.clone()))
        .bind(item.retry_count as i32)
        .bind(Utc::now())
        .bind(item.processed_at)
        .bind(item.completed_at)
        .bind(&item.result_message)
        .bind(&item.error_details)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        if result.rows_affected() == 0 && self.get(item.id).await?.is_none() {
            return Err(RepositoryError::NotFound(item.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM queue_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(repo_err)?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn stop_reason(&self) -> Result<Option<String>, RepositoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM engine_state WHERE key = $1")
                .bind(STOP_REASON_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(repo_err)?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_stop_reason(&self, reason: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO engine_state (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(STOP_REASON_KEY)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        Ok(())
    }

    async fn clear_stop_reason(&self) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM engine_state WHERE key = $1")
            .bind(STOP_REASON_KEY)
            .execute(&self.pool)
            .await
            .map_err(repo_err)?;

        Ok(())
    }
}

fn state_err(e: sqlx::Error) -> StateStoreError {
    StateStoreError::Storage(e.to_string())
}

#[async_trait]
impl AgentStateStore for Database {
    async fn daily_usage(&self, agent_id: &str) -> Result<f64, StateStoreError> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT daily_usage FROM agent_usage WHERE agent_id = $1")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(state_err)?;

        Ok(row.map(|(usage,)| usage).unwrap_or(0.0))
    }

    async fn add_usage(&self, agent_id: &str, units: f64) -> Result<(), StateStoreError> {
        // The increment happens inside the statement; concurrent callers
        // never read-modify-write in application code.
        sqlx::query(
            r#"
            INSERT INTO agent_usage (agent_id, daily_usage) VALUES ($1, $2)
            ON CONFLICT (agent_id) DO UPDATE
            SET daily_usage = agent_usage.daily_usage + EXCLUDED.daily_usage,
                updated_at = NOW()
            "#,
        )
        .bind(agent_id)
        .bind(units)
        .execute(&self.pool)
        .await
        .map_err(state_err)?;

        Ok(())
    }

    async fn runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
    ) -> Result<RuntimeState, StateStoreError> {
        let row: Option<(bool, Option<String>)> = sqlx::query_as(
            "SELECT enabled, disable_reason FROM agent_runtime WHERE agent_id = $1 AND scope = $2",
        )
        .bind(agent_id)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(state_err)?;

        Ok(match row {
            Some((enabled, reason)) => RuntimeState {
                enabled,
                reason: reason.as_deref().and_then(DisableReason::from_wire),
            },
            None => RuntimeState::enabled(),
        })
    }

    async fn set_runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
        state: RuntimeState,
    ) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_runtime (agent_id, scope, enabled, disable_reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (agent_id, scope) DO UPDATE
            SET enabled = EXCLUDED.enabled,
                disable_reason = EXCLUDED.disable_reason,
                updated_at = NOW()
            "#,
        )
        .bind(agent_id)
        .bind(scope)
        .bind(state.enabled)
        .bind(state.reason.as_ref().map(DisableReason::as_wire))
        .execute(&self.pool)
        .await
        .map_err(state_err)?;

        Ok(())
    }

    async fn reset_daily(&self) -> Result<ResetSummary, StateStoreError> {
        let mut tx = self.pool.begin().await.map_err(state_err)?;

        let usage = sqlx::query("UPDATE agent_usage SET daily_usage = 0, updated_at = NOW() WHERE daily_usage <> 0")
            .execute(&mut *tx)
            .await
            .map_err(state_err)?;

        // Only quota disables are cleared; provider failures stay down
        // until an operator re-enables them.
        let reenabled = sqlx::query(
            r#"
            UPDATE agent_runtime
            SET enabled = TRUE, disable_reason = NULL, updated_at = NOW()
            WHERE enabled = FALSE AND disable_reason LIKE $1
            "#,
        )
        .bind(format!("{QUOTA_PREFIX}%"))
        .execute(&mut *tx)
        .await
        .map_err(state_err)?;

        tx.commit().await.map_err(state_err)?;

        Ok(ResetSummary {
            usage_counters_reset: usage.rows_affected() as usize,
            scopes_reenabled: reenabled.rows_affected() as usize,
        })
    }

    async fn all_runtime_states(
        &self,
    ) -> Result<Vec<(String, String, RuntimeState)>, StateStoreError> {
        let rows: Vec<(String, String, bool, Option<String>)> = sqlx::query_as(
            "SELECT agent_id, scope, enabled, disable_reason FROM agent_runtime ORDER BY agent_id, scope",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(state_err)?;

        Ok(rows
            .into_iter()
            .map(|(agent, scope, enabled, reason)| {
                let state = RuntimeState {
                    enabled,
                    reason: reason.as_deref().and_then(DisableReason::from_wire),
                };
                (agent, scope, state)
            })
            .collect())
    }
}

fn sink_err(e: sqlx::Error) -> FetchError {
    FetchError(e.to_string())
}

#[async_trait]
impl MatchStore for Database {
    async fn save_match(&self, record: &JobMatch) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            INSERT INTO job_matches (id, tracking_id, title, company, url, score, breakdown, facts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.tracking_id)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.url)
        .bind(record.score)
        .bind(&record.breakdown)
        .bind(&record.facts)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(sink_err)?;

        Ok(())
    }

    async fn save_company(&self, profile: &CompanyProfile) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            INSERT INTO company_profiles (id, tracking_id, name, website, facts, analysis, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(profile.id)
        .bind(profile.tracking_id)
        .bind(&profile.name)
        .bind(&profile.website)
        .bind(&profile.facts)
        .bind(&profile.analysis)
        .bind(profile.created_at)
        .execute(&self.pool)
        .await
        .map_err(sink_err)?;

        Ok(())
    }

    async fn save_source(&self, source: &JobSource) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            INSERT INTO job_sources (id, tracking_id, url, structure, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(source.id)
        .bind(source.tracking_id)
        .bind(&source.url)
        .bind(&source.structure)
        .bind(source.created_at)
        .execute(&self.pool)
        .await
        .map_err(sink_err)?;

        Ok(())
    }
}
