//! Repository interface for persisted queue items.
//!
//! The engine consumes the queue through this trait; the Postgres
//! implementation lives in `storage::database`. The claim operation is
//! required to be an atomic compare-and-swap on status (pending to
//! processing). Administrative tools may touch the same rows concurrently,
//! so a plain read-then-write claim is not acceptable even with a single
//! worker.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::item::QueueItem;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Underlying store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Item not found.
    #[error("queue item {0} not found")]
    NotFound(Uuid),

    /// Row could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// CRUD plus atomic claim over persisted queue items.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Atomically claims the oldest pending item, moving it to
    /// `Processing` and stamping `processed_at`. Returns `None` when the
    /// queue is empty. Two concurrent claims must never return the same item.
    async fn claim_next(&self) -> Result<Option<QueueItem>, RepositoryError>;

    /// Persists a new item.
    async fn create(&self, item: &QueueItem) -> Result<(), RepositoryError>;

    /// Writes back an item's current state.
    ///
    /// Implementations must not overwrite a row that reached `Cancelled`
    /// while the item was being processed; the cancel wins.
    async fn update(&self, item: &QueueItem) -> Result<(), RepositoryError>;

    /// Fetches an item by id.
    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RepositoryError>;

    /// Reads the queue halt reason, if the queue is halted.
    async fn stop_reason(&self) -> Result<Option<String>, RepositoryError>;

    /// Halts the queue with a human-readable reason.
    async fn set_stop_reason(&self, reason: &str) -> Result<(), RepositoryError>;

    /// Clears the halt so the worker resumes on its next poll.
    async fn clear_stop_reason(&self) -> Result<(), RepositoryError>;
}
