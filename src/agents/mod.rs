//! AI agent management: declarative registry, provider adapters, runtime
//! state and the fallback/budget execution algorithm.

pub mod manager;
pub mod provider;
pub mod registry;
pub mod state;

pub use manager::{AgentCompletion, AgentError, AgentManager};
pub use provider::{GenerationOptions, ProviderAdapter, ProviderError};
pub use registry::{
    AgentConfig, AgentRegistry, RegistryError, RegistryStore, StaticRegistryStore, TaskType,
    YamlRegistryStore,
};
pub use state::{AgentStateStore, DisableReason, InMemoryAgentStateStore, RuntimeState};
