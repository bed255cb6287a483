//! Persistent work queue: item model, lineage tracking and the repository
//! interface consumed by the worker loop.

pub mod item;
pub mod lineage;
pub mod repository;

pub use item::{CompanyStage, ItemStatus, ItemType, JobStage, QueueItem, SubTask};
pub use lineage::{Lineage, LineageError, LineageTracker};
pub use repository::{QueueRepository, RepositoryError};
