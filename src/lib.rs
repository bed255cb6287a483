//! jobforge: Persistent job-search pipeline engine.
//!
//! This library provides a single-worker queue over PostgreSQL, typed
//! multi-stage pipelines for jobs, companies and listing sources, and an AI
//! agent manager with fallback chains and shared daily budgets.

// Core modules
pub mod agents;
pub mod budget;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod worker;

// Re-export commonly used error types
pub use agents::{AgentError, ProviderError, RegistryError};
pub use config::ConfigError;
pub use queue::RepositoryError;
pub use storage::{DatabaseError, MigrationError};
pub use worker::WorkerError;
