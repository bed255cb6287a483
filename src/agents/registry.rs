//! Declarative agent configuration: agents, fallback chains and model rates.
//!
//! The registry is sourced from a YAML config file and validated loudly on
//! every load: missing keys, unknown agent ids in fallback chains, unknown
//! (provider, interface) pairs and unmet auth requirements are load errors,
//! never silent defaults. The agent manager reloads the registry on every
//! call, so edits (manual re-enables, budget changes) take effect without a
//! restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::provider::is_supported_pair;

/// Errors raised while loading or validating the agent registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry file could not be read.
    #[error("failed to read registry file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The registry file is not valid YAML for the expected shape.
    #[error("failed to parse registry file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The registry declares no agents at all.
    #[error("registry declares no agents")]
    Empty,

    /// A fallback chain names an agent that is not configured.
    #[error("task '{task}' fallback chain references unknown agent '{agent_id}'")]
    UnknownAgent { task: TaskType, agent_id: String },

    /// An agent declares a (provider, interface) pair with no adapter.
    #[error("agent '{agent_id}' uses unsupported provider/interface pair '{provider}/{interface}'")]
    UnsupportedPair {
        agent_id: String,
        provider: String,
        interface: String,
    },

    /// An agent's daily budget is zero or negative.
    #[error("agent '{0}' has a non-positive daily budget")]
    InvalidBudget(String),

    /// A required environment variable for an agent's auth is unset.
    #[error("agent '{agent_id}' requires environment variable {var}")]
    MissingAuthEnv { agent_id: String, var: String },

    /// A required credentials file for an agent's auth is missing.
    #[error("agent '{agent_id}' requires file {path}")]
    MissingAuthFile { agent_id: String, path: PathBuf },
}

/// AI task types that agents can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Structured field extraction from scraped content.
    Extraction,
    /// Free-form analysis (e.g. listing-structure characterization).
    Analysis,
    /// Application document generation.
    Document,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Extraction => write!(f, "extraction"),
            TaskType::Analysis => write!(f, "analysis"),
            TaskType::Document => write!(f, "document"),
        }
    }
}

/// How an agent authenticates with its provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRequirements {
    /// Auth mechanism label (e.g. "api_key", "oauth_file").
    #[serde(default)]
    pub auth_type: Option<String>,
    /// Environment variables that must be set.
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Credential files that must exist.
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
}

/// Configuration of one agent, identified as `"{provider}.{interface}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider name (e.g. "claude", "openrouter").
    pub provider: String,
    /// Interface kind (e.g. "api", "cli").
    pub interface: String,
    /// Model used when the caller gives no override.
    pub default_model: String,
    /// Shared daily budget in abstract budget units.
    pub daily_budget: f64,
    /// Auth requirements checked at load time.
    #[serde(default)]
    pub auth: AuthRequirements,
}

impl AgentConfig {
    /// The agent id: `"{provider}.{interface}"`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.provider, self.interface)
    }
}

/// The full agent configuration: agents, task fallback chains and model
/// cost rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRegistry {
    /// Agent id → configuration.
    pub agents: HashMap<String, AgentConfig>,
    /// Task type → ordered agent ids tried in sequence. Order is the trial
    /// order; there is no weighting.
    #[serde(default)]
    pub task_fallbacks: HashMap<TaskType, Vec<String>>,
    /// Model name → budget-unit cost multiplier. Unlisted models cost 1.0.
    #[serde(default)]
    pub model_rates: HashMap<String, f64>,
}

impl AgentRegistry {
    /// Cost of one call with `model`, in budget units.
    pub fn rate_for(&self, model: &str) -> f64 {
        self.model_rates.get(model).copied().unwrap_or(1.0)
    }

    /// The fallback chain for a task type, empty if none is configured.
    pub fn chain_for(&self, task: TaskType) -> &[String] {
        self.task_fallbacks
            .get(&task)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Validates the registry. All violations are hard errors.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.agents.is_empty() {
            return Err(RegistryError::Empty);
        }

        for (id, agent) in &self.agents {
            if !is_supported_pair(&agent.provider, &agent.interface) {
                return Err(RegistryError::UnsupportedPair {
                    agent_id: id.clone(),
                    provider: agent.provider.clone(),
                    interface: agent.interface.clone(),
                });
            }

            if agent.daily_budget <= 0.0 {
                return Err(RegistryError::InvalidBudget(id.clone()));
            }

            for var in &agent.auth.required_env {
                if std::env::var(var).is_err() {
                    return Err(RegistryError::MissingAuthEnv {
                        agent_id: id.clone(),
                        var: var.clone(),
                    });
                }
            }

            for path in &agent.auth.required_files {
                if !path.exists() {
                    return Err(RegistryError::MissingAuthFile {
                        agent_id: id.clone(),
                        path: path.clone(),
                    });
                }
            }
        }

        for (task, chain) in &self.task_fallbacks {
            for agent_id in chain {
                if !self.agents.contains_key(agent_id) {
                    return Err(RegistryError::UnknownAgent {
                        task: *task,
                        agent_id: agent_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Source of the agent registry.
///
/// `load` is called on every agent-manager execution, so implementations
/// must return the current configuration, not a cached snapshot.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Loads and validates the current registry.
    async fn load(&self) -> Result<AgentRegistry, RegistryError>;
}

/// Registry store backed by a YAML file on disk.
pub struct YamlRegistryStore {
    path: PathBuf,
}

impl YamlRegistryStore {
    /// Creates a store reading from the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RegistryStore for YamlRegistryStore {
    async fn load(&self) -> Result<AgentRegistry, RegistryError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| RegistryError::Io {
                path: self.path.clone(),
                source,
            })?;

        let registry: AgentRegistry = serde_yaml::from_str(&raw)?;
        registry.validate()?;
        Ok(registry)
    }
}

/// Registry store over an in-memory registry.
///
/// Useful for embedding the engine with programmatic configuration and for
/// tests; `set` models an operator editing the config between calls. The
/// caller is responsible for validating programmatic registries; only the
/// file-backed store validates on every load.
pub struct StaticRegistryStore {
    registry: std::sync::RwLock<AgentRegistry>,
}

impl StaticRegistryStore {
    /// Creates a store serving the given registry.
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry: std::sync::RwLock::new(registry),
        }
    }

    /// Replaces the served registry.
    pub fn set(&self, registry: AgentRegistry) {
        *self.registry.write().expect("registry lock poisoned") = registry;
    }
}

#[async_trait]
impl RegistryStore for StaticRegistryStore {
    async fn load(&self) -> Result<AgentRegistry, RegistryError> {
        Ok(self.registry.read().expect("registry lock poisoned").clone())
    }
}
