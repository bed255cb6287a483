//! Provider adapters: one per (provider, interface) pair.
//!
//! An adapter wraps one external AI surface (an HTTP chat-completions API
//! or a local CLI binary) behind a single `generate` call. Every failure
//! mode (auth, rate limit, timeout, malformed response) surfaces as the one
//! `ProviderError` kind; the agent manager treats them all identically.
//!
//! Which pairs exist is a static lookup table checked at registry load, so
//! an unknown pair fails at startup rather than at call time.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::registry::AgentConfig;

/// The single provider error kind. The engine does not distinguish
/// sub-kinds; any provider failure disables the agent for the calling scope.
#[derive(Debug, Error)]
#[error("provider call failed: {0}")]
pub struct ProviderError(pub String);

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Per-call timeout. Independent of (and shorter than) the item-level
    /// processing timeout.
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// One external AI surface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Generates a completion for `prompt` with `model`.
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError>;
}

/// How a supported pair is wired up.
enum AdapterKind {
    /// OpenAI-style chat-completions endpoint.
    Http {
        base_url: &'static str,
        api_key_env: &'static str,
    },
    /// Local CLI binary taking the prompt on stdin.
    Cli { command: &'static str },
}

/// The static (provider, interface) lookup table.
const SUPPORTED_PAIRS: &[(&str, &str, AdapterKind)] = &[
    (
        "openrouter",
        "api",
        AdapterKind::Http {
            base_url: "https://openrouter.ai/api/v1",
            api_key_env: "OPENROUTER_API_KEY",
        },
    ),
    (
        "openai",
        "api",
        AdapterKind::Http {
            base_url: "https://api.openai.com/v1",
            api_key_env: "OPENAI_API_KEY",
        },
    ),
    (
        "anthropic",
        "api",
        AdapterKind::Http {
            base_url: "https://api.anthropic.com/v1",
            api_key_env: "ANTHROPIC_API_KEY",
        },
    ),
    ("claude", "cli", AdapterKind::Cli { command: "claude" }),
    ("gemini", "cli", AdapterKind::Cli { command: "gemini" }),
];

/// Returns whether an adapter exists for the pair. Used by registry
/// validation so unknown pairs fail at load time.
pub fn is_supported_pair(provider: &str, interface: &str) -> bool {
    SUPPORTED_PAIRS
        .iter()
        .any(|(p, i, _)| *p == provider && *i == interface)
}

/// Constructs the adapter for a configured agent.
///
/// Only called for agents that passed registry validation, so an unknown
/// pair here is a programming error surfaced as `ProviderError`.
pub fn adapter_for(agent: &AgentConfig) -> Result<Box<dyn ProviderAdapter>, ProviderError> {
    let kind = SUPPORTED_PAIRS
        .iter()
        .find(|(p, i, _)| *p == agent.provider && *i == agent.interface)
        .map(|(_, _, kind)| kind)
        .ok_or_else(|| {
            ProviderError(format!(
                "no adapter for pair {}/{}",
                agent.provider, agent.interface
            ))
        })?;

    match kind {
        AdapterKind::Http {
            base_url,
            api_key_env,
        } => {
            let api_key = std::env::var(api_key_env).ok();
            Ok(Box::new(HttpChatAdapter::new(
                base_url.to_string(),
                api_key,
            )))
        }
        AdapterKind::Cli { command } => Ok(Box::new(CliAdapter::new(command.to_string()))),
    }
}

// =============================================================================
// HTTP adapter
// =============================================================================

/// Request body for an OpenAI-style chat-completions call.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Adapter for OpenAI-style chat-completions endpoints.
pub struct HttpChatAdapter {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpChatAdapter {
    /// Creates an adapter for the given endpoint.
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpChatAdapter {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(options.timeout)
            .json(&body);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError(format!("HTTP {status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError("response contained no choices".to_string()))
    }
}

// =============================================================================
// CLI adapter
// =============================================================================

/// Adapter for local AI CLI binaries. The prompt goes to stdin; the
/// completion is read from stdout.
pub struct CliAdapter {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CliAdapter {
    /// Creates an adapter invoking the given command.
    pub fn new(command: String) -> Self {
        Self {
            command,
            working_dir: None,
        }
    }

    /// Sets the working directory for the subprocess.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl ProviderAdapter for CliAdapter {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let mut command = Command::new(&self.command);
        command
            .arg("--model")
            .arg(model)
            .arg("--print")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProviderError(format!("failed to spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError(format!("failed to write prompt: {e}")))?;
        }

        let output = tokio::time::timeout(options.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ProviderError(format!(
                    "{} timed out after {:?}",
                    self.command, options.timeout
                ))
            })?
            .map_err(|e| ProviderError(format!("{} failed: {e}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
