//! Runtime agent state: per-scope enablement and the shared daily usage pool.
//!
//! Disable reasons are modeled as a tagged enum internally but serialize to
//! the prefixed-string wire format (`"quota_exhausted: …"` / `"error: …"`)
//! that operator tooling and the budget reset job pattern-match on. That
//! prefix contract must not change.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire prefix for quota-exhaustion disables.
pub const QUOTA_PREFIX: &str = "quota_exhausted:";

/// Wire prefix for provider-failure disables.
pub const ERROR_PREFIX: &str = "error:";

/// Errors that can occur while reading or writing agent runtime state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Underlying store failed.
    #[error("agent state store error: {0}")]
    Storage(String),
}

/// Why an agent was disabled for a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    /// The shared daily budget was reached. Cleared by the budget reset job.
    QuotaExhausted(String),
    /// The provider call failed. Requires manual re-enablement.
    ProviderFailure(String),
}

impl DisableReason {
    /// The reason recorded when the budget check trips.
    pub fn quota_reached() -> Self {
        DisableReason::QuotaExhausted("daily budget reached".to_string())
    }

    /// Serializes to the prefixed wire string.
    pub fn as_wire(&self) -> String {
        match self {
            DisableReason::QuotaExhausted(detail) => format!("{QUOTA_PREFIX} {detail}"),
            DisableReason::ProviderFailure(detail) => format!("{ERROR_PREFIX} {detail}"),
        }
    }

    /// Parses a prefixed wire string back into a reason.
    ///
    /// Returns `None` for strings that carry neither known prefix.
    pub fn from_wire(wire: &str) -> Option<Self> {
        if let Some(rest) = wire.strip_prefix(QUOTA_PREFIX) {
            Some(DisableReason::QuotaExhausted(rest.trim_start().to_string()))
        } else {
            wire.strip_prefix(ERROR_PREFIX)
                .map(|rest| DisableReason::ProviderFailure(rest.trim_start().to_string()))
        }
    }
}

impl Serialize for DisableReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for DisableReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = String::deserialize(deserializer)?;
        DisableReason::from_wire(&wire)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown disable reason: {wire}")))
    }
}

/// Enablement state of one agent for one calling scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Whether the agent may serve calls from this scope.
    pub enabled: bool,
    /// Why it is disabled, if it is.
    #[serde(default)]
    pub reason: Option<DisableReason>,
}

impl RuntimeState {
    /// An enabled state with no reason recorded.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            reason: None,
        }
    }

    /// A disabled state with the given reason.
    pub fn disabled(reason: DisableReason) -> Self {
        Self {
            enabled: false,
            reason: Some(reason),
        }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::enabled()
    }
}

/// Authoritative store for agent runtime state and the shared usage pool.
///
/// `daily_usage` is the only state mutated by concurrent callers without
/// going through the queue's CAS; implementations must make `add_usage` an
/// atomic increment at the storage layer, never a read-modify-write in
/// application code.
#[async_trait]
pub trait AgentStateStore: Send + Sync {
    /// Current shared daily usage for an agent, in budget units.
    async fn daily_usage(&self, agent_id: &str) -> Result<f64, StateStoreError>;

    /// Atomically adds `units` to an agent's shared daily usage.
    async fn add_usage(&self, agent_id: &str, units: f64) -> Result<(), StateStoreError>;

    /// Runtime state of an agent for one scope. Unknown (agent, scope) pairs
    /// default to enabled.
    async fn runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
    ) -> Result<RuntimeState, StateStoreError>;

    /// Writes the runtime state of an agent for one scope. Other scopes are
    /// unaffected.
    async fn set_runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
        state: RuntimeState,
    ) -> Result<(), StateStoreError>;

    /// Zeroes every agent's daily usage and re-enables every (agent, scope)
    /// disabled with a quota reason. Scopes disabled with a provider-failure
    /// reason are left disabled.
    async fn reset_daily(&self) -> Result<ResetSummary, StateStoreError>;

    /// All (agent, scope) pairs with recorded state, for status reporting.
    async fn all_runtime_states(
        &self,
    ) -> Result<Vec<(String, String, RuntimeState)>, StateStoreError>;
}

/// What a daily reset actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Number of agents whose usage counter was zeroed.
    pub usage_counters_reset: usize,
    /// Number of (agent, scope) pairs re-enabled.
    pub scopes_reenabled: usize,
}

/// In-memory agent state store.
///
/// Backs tests and single-process dry runs; the Postgres store in
/// `storage::database` is the production implementation.
#[derive(Default)]
pub struct InMemoryAgentStateStore {
    usage: RwLock<HashMap<String, f64>>,
    runtime: RwLock<HashMap<(String, String), RuntimeState>>,
}

impl InMemoryAgentStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStateStore for InMemoryAgentStateStore {
    async fn daily_usage(&self, agent_id: &str) -> Result<f64, StateStoreError> {
        let usage = self.usage.read().expect("usage lock poisoned");
        Ok(usage.get(agent_id).copied().unwrap_or(0.0))
    }

    async fn add_usage(&self, agent_id: &str, units: f64) -> Result<(), StateStoreError> {
        let mut usage = self.usage.write().expect("usage lock poisoned");
        *usage.entry(agent_id.to_string()).or_insert(0.0) += units;
        Ok(())
    }

    async fn runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
    ) -> Result<RuntimeState, StateStoreError> {
        let runtime = self.runtime.read().expect("runtime lock poisoned");
        Ok(runtime
            .get(&(agent_id.to_string(), scope.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_runtime_state(
        &self,
        agent_id: &str,
        scope: &str,
        state: RuntimeState,
    ) -> Result<(), StateStoreError> {
        let mut runtime = self.runtime.write().expect("runtime lock poisoned");
        runtime.insert((agent_id.to_string(), scope.to_string()), state);
        Ok(())
    }

    async fn reset_daily(&self) -> Result<ResetSummary, StateStoreError> {
        let mut summary = ResetSummary::default();

        {
            let mut usage = self.usage.write().expect("usage lock poisoned");
            summary.usage_counters_reset = usage.len();
            for value in usage.values_mut() {
                *value = 0.0;
            }
        }

        {
            let mut runtime = self.runtime.write().expect("runtime lock poisoned");
            for state in runtime.values_mut() {
                if matches!(state.reason, Some(DisableReason::QuotaExhausted(_))) {
                    *state = RuntimeState::enabled();
                    summary.scopes_reenabled += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn all_runtime_states(
        &self,
    ) -> Result<Vec<(String, String, RuntimeState)>, StateStoreError> {
        let runtime = self.runtime.read().expect("runtime lock poisoned");
        Ok(runtime
            .iter()
            .map(|((agent, scope), state)| (agent.clone(), scope.clone(), state.clone()))
            .collect())
    }
}
