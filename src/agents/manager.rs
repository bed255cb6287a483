//! Agent selection under fallback chains and a shared daily budget.
//!
//! `AgentManager::execute` walks the fallback chain for a task type in
//! order, skipping disabled agents, disabling and skipping over agents whose
//! shared budget is exhausted, and aborting the whole chain on a provider
//! error. The asymmetry is deliberate: quota exhaustion is an agent-local
//! condition, so the search continues; a genuine API/auth failure is assumed
//! to be systemic for this call, so later agents are not tried.
//!
//! Disables are scope-isolated; the usage pool is shared across scopes.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::provider::{adapter_for, GenerationOptions, ProviderAdapter, ProviderError};
use super::registry::{AgentConfig, RegistryError, RegistryStore, TaskType};
use super::state::{AgentStateStore, DisableReason, RuntimeState, StateStoreError};

/// Errors surfaced by the agent manager.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The fallback chain was exhausted (or empty) without a completion.
    /// Fatal to the current work item: the worker halts the queue.
    #[error("no agents available for task '{0}'")]
    NoAgentsAvailable(TaskType),

    /// The agent registry failed to load or validate.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The runtime state store failed.
    #[error("state store error: {0}")]
    State(#[from] StateStoreError),
}

/// A successful AI completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCompletion {
    /// Generated text.
    pub text: String,
    /// Id of the agent that served the call.
    pub agent_id: String,
    /// Model that was actually used.
    pub model: String,
}

/// Constructs the adapter for an agent. Injectable so tests can substitute
/// scripted adapters; production uses the static pair table.
pub type AdapterFactory =
    dyn Fn(&AgentConfig) -> Result<Box<dyn ProviderAdapter>, ProviderError> + Send + Sync;

/// Selects a provider per task type and enforces the budget and disable
/// semantics.
pub struct AgentManager {
    registry: Arc<dyn RegistryStore>,
    state: Arc<dyn AgentStateStore>,
    factory: Arc<AdapterFactory>,
    options: GenerationOptions,
}

impl AgentManager {
    /// Creates a manager using the static adapter table.
    pub fn new(registry: Arc<dyn RegistryStore>, state: Arc<dyn AgentStateStore>) -> Self {
        Self {
            registry,
            state,
            factory: Arc::new(adapter_for),
            options: GenerationOptions::default(),
        }
    }

    /// Overrides the adapter factory.
    pub fn with_adapter_factory(mut self, factory: Arc<AdapterFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Sets the per-call generation options (including the provider timeout).
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Obtains an AI completion for `task_type` on behalf of `scope`.
    ///
    /// The registry is reloaded on every call so that budget resets and
    /// manual re-enables take effect between calls without a restart.
    pub async fn execute(
        &self,
        task_type: TaskType,
        prompt: &str,
        scope: &str,
        model_override: Option<&str>,
    ) -> Result<AgentCompletion, AgentError> {
        let registry = self.registry.load().await?;

        let chain = registry.chain_for(task_type);
        if chain.is_empty() {
            return Err(AgentError::NoAgentsAvailable(task_type));
        }

        for agent_id in chain {
            let Some(agent) = registry.agents.get(agent_id) else {
                debug!(agent_id, "agent in fallback chain is not configured, skipping");
                continue;
            };

            let runtime = self.state.runtime_state(agent_id, scope).await?;
            if !runtime.enabled {
                debug!(agent_id, scope, "agent disabled for scope, skipping");
                continue;
            }

            // Budget check happens before any external call. Usage is shared
            // across scopes; the disable is scoped to the caller.
            let usage = self.state.daily_usage(agent_id).await?;
            if usage >= agent.daily_budget {
                warn!(
                    agent_id,
                    scope,
                    usage,
                    budget = agent.daily_budget,
                    "agent over daily budget, disabling for scope and trying next"
                );
                self.state
                    .set_runtime_state(
                        agent_id,
                        scope,
                        RuntimeState::disabled(DisableReason::quota_reached()),
                    )
                    .await?;
                continue;
            }

            let model = model_override.unwrap_or(&agent.default_model).to_string();

            let result = match (self.factory)(agent) {
                Ok(adapter) => adapter.generate(prompt, &model, &self.options).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(text) => {
                    self.state
                        .add_usage(agent_id, registry.rate_for(&model))
                        .await?;
                    debug!(agent_id, scope, model, "agent call succeeded");
                    return Ok(AgentCompletion {
                        text,
                        agent_id: agent_id.clone(),
                        model,
                    });
                }
                Err(ProviderError(message)) => {
                    warn!(
                        agent_id,
                        scope,
                        error = %message,
                        "provider error, disabling agent for scope and aborting chain"
                    );
                    self.state
                        .set_runtime_state(
                            agent_id,
                            scope,
                            RuntimeState::disabled(DisableReason::ProviderFailure(message)),
                        )
                        .await?;
                    // Provider errors abort the fallback search entirely.
                    break;
                }
            }
        }

        Err(AgentError::NoAgentsAvailable(task_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::registry::{AgentRegistry, AuthRequirements, StaticRegistryStore};
    use crate::agents::state::InMemoryAgentStateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted adapter that records how often it was called.
    struct ScriptedAdapter {
        response: Result<String, String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn generate(
            &self,
            _prompt: &str,
            _model: &str,
            _options: &GenerationOptions,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().map_err(ProviderError)
        }
    }

    struct Harness {
        manager: AgentManager,
        state: Arc<InMemoryAgentStateStore>,
        calls: HashMap<String, Arc<AtomicUsize>>,
    }

    fn agent(provider: &str, interface: &str) -> AgentConfig {
        AgentConfig {
            provider: provider.to_string(),
            interface: interface.to_string(),
            default_model: format!("{provider}-default"),
            daily_budget: 10.0,
            auth: AuthRequirements::default(),
        }
    }

    /// Builds a manager over three agents a.api, b.api, c.api with scripted
    /// responses keyed by agent id.
    fn harness(
        chain: &[&str],
        agents: Vec<(AgentConfig, Result<String, String>)>,
        rates: HashMap<String, f64>,
    ) -> Harness {
        let mut registry = AgentRegistry::default();
        let mut scripts: HashMap<String, Result<String, String>> = HashMap::new();
        let mut calls = HashMap::new();

        for (config, response) in agents {
            let id = config.id();
            scripts.insert(id.clone(), response);
            calls.insert(id.clone(), Arc::new(AtomicUsize::new(0)));
            registry.agents.insert(id, config);
        }
        registry.task_fallbacks.insert(
            TaskType::Extraction,
            chain.iter().map(|s| s.to_string()).collect(),
        );
        registry.model_rates = rates;

        let state = Arc::new(InMemoryAgentStateStore::new());
        let calls_for_factory = calls.clone();

        let factory: Arc<AdapterFactory> = Arc::new(move |config: &AgentConfig| {
            let id = config.id();
            let response = scripts
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Err("unscripted agent".to_string()));
            Ok(Box::new(ScriptedAdapter {
                response,
                calls: calls_for_factory[&id].clone(),
            }) as Box<dyn ProviderAdapter>)
        });

        let manager = AgentManager::new(Arc::new(StaticRegistryStore::new(registry)), state.clone())
            .with_adapter_factory(factory);

        Harness {
            manager,
            state,
            calls,
        }
    }

    fn call_count(h: &Harness, id: &str) -> usize {
        h.calls[id].load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_first_agent_success_is_terminal() {
        let h = harness(
            &["a.api", "b.api"],
            vec![
                (agent("a", "api"), Ok("from a".to_string())),
                (agent("b", "api"), Ok("from b".to_string())),
            ],
            HashMap::new(),
        );

        let completion = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect("should succeed");

        assert_eq!(completion.agent_id, "a.api");
        assert_eq!(completion.text, "from a");
        assert_eq!(completion.model, "a-default");
        assert_eq!(call_count(&h, "a.api"), 1);
        assert_eq!(call_count(&h, "b.api"), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_raises_immediately() {
        let h = harness(
            &[],
            vec![(agent("a", "api"), Ok("x".to_string()))],
            HashMap::new(),
        );

        let err = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AgentError::NoAgentsAvailable(TaskType::Extraction)));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_continues_to_next_agent() {
        let h = harness(
            &["a.api", "b.api"],
            vec![
                (agent("a", "api"), Ok("from a".to_string())),
                (agent("b", "api"), Ok("from b".to_string())),
            ],
            HashMap::new(),
        );

        // a has consumed its full budget of 10 units.
        let a = agent("a", "api");
        h.state.add_usage("a.api", a.daily_budget).await.unwrap();

        let completion = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect("should fall through to b");

        assert_eq!(completion.agent_id, "b.api");
        // a was never called externally.
        assert_eq!(call_count(&h, "a.api"), 0);

        // a is now disabled for "worker" with the quota reason.
        let runtime = h.state.runtime_state("a.api", "worker").await.unwrap();
        assert!(!runtime.enabled);
        assert_eq!(
            runtime.reason.unwrap().as_wire(),
            "quota_exhausted: daily budget reached"
        );
    }

    #[tokio::test]
    async fn test_provider_error_breaks_the_chain() {
        let h = harness(
            &["a.api", "b.api", "c.api"],
            vec![
                (agent("a", "api"), Err("rate limited".to_string())),
                (agent("b", "api"), Ok("from b".to_string())),
                (agent("c", "api"), Ok("from c".to_string())),
            ],
            HashMap::new(),
        );

        let err = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect_err("provider error must abort the chain");
        assert!(matches!(err, AgentError::NoAgentsAvailable(_)));

        // b and c were never attempted.
        assert_eq!(call_count(&h, "a.api"), 1);
        assert_eq!(call_count(&h, "b.api"), 0);
        assert_eq!(call_count(&h, "c.api"), 0);

        let runtime = h.state.runtime_state("a.api", "worker").await.unwrap();
        assert!(!runtime.enabled);
        assert_eq!(runtime.reason.unwrap().as_wire(), "error: rate limited");
    }

    #[tokio::test]
    async fn test_disable_is_scope_isolated() {
        let h = harness(
            &["a.api"],
            vec![(agent("a", "api"), Err("boom".to_string()))],
            HashMap::new(),
        );

        let _ = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await;

        assert!(!h.state.runtime_state("a.api", "worker").await.unwrap().enabled);
        assert!(h.state.runtime_state("a.api", "backend").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_usage_incremented_by_model_rate() {
        let mut rates = HashMap::new();
        rates.insert("a-default".to_string(), 2.5);

        let h = harness(
            &["a.api"],
            vec![(agent("a", "api"), Ok("ok".to_string()))],
            rates,
        );

        h.manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect("should succeed");

        assert!((h.state.daily_usage("a.api").await.unwrap() - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_model_override_and_unlisted_rate() {
        let h = harness(
            &["a.api"],
            vec![(agent("a", "api"), Ok("ok".to_string()))],
            HashMap::new(),
        );

        let completion = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", Some("special-model"))
            .await
            .expect("should succeed");

        assert_eq!(completion.model, "special-model");
        // Unlisted models cost 1.0.
        assert!((h.state.daily_usage("a.api").await.unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_usage_shared_across_scopes() {
        let h = harness(
            &["a.api"],
            vec![(agent("a", "api"), Ok("ok".to_string()))],
            HashMap::new(),
        );

        // Agent a has budget 10. Consume 9.5 from "backend" calls.
        h.state.add_usage("a.api", 9.5).await.unwrap();

        // One more call from "worker" takes the pool to 10.5. That is
        // allowed because the check happens before the call.
        h.manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect("call at 9.5/10 is allowed");
        assert!(h.state.daily_usage("a.api").await.unwrap() >= 10.0);

        // The next call from any scope is refused.
        let err = h
            .manager
            .execute(TaskType::Extraction, "p", "backend", None)
            .await
            .expect_err("pool is exhausted for every scope");
        assert!(matches!(err, AgentError::NoAgentsAvailable(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_agent_in_chain_is_skipped() {
        let h = harness(
            &["ghost.api", "a.api"],
            vec![(agent("a", "api"), Ok("ok".to_string()))],
            HashMap::new(),
        );

        let completion = h
            .manager
            .execute(TaskType::Extraction, "p", "worker", None)
            .await
            .expect("should skip the unconfigured agent");
        assert_eq!(completion.agent_id, "a.api");
    }
}
