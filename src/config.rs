//! Engine configuration.
//!
//! The engine depends on a strict config contract: every key it needs must
//! be present and well-formed, and loading fails loudly otherwise. There are
//! no implicit defaults: a missing poll interval is a deployment mistake,
//! not a request for a built-in value.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for the worker engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Path to the agent registry YAML file.
    pub agent_registry_path: PathBuf,
    /// How often the worker polls the repository when idle.
    pub poll_interval: Duration,
    /// Per-item processing timeout.
    pub processing_timeout: Duration,
    /// Per-provider-call timeout. Independent of the item timeout.
    pub provider_timeout: Duration,
    /// Minimum match score required for a job to be saved.
    pub score_threshold: f64,
    /// Local hour (0-23) at which the daily budget reset runs.
    pub budget_reset_hour: u32,
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `JOBFORGE_AGENT_REGISTRY`: Path to the agent registry YAML
    /// - `JOBFORGE_POLL_INTERVAL_SECS`: Worker poll interval in seconds
    /// - `JOBFORGE_PROCESSING_TIMEOUT_SECS`: Per-item timeout in seconds
    /// - `JOBFORGE_PROVIDER_TIMEOUT_SECS`: Per-provider-call timeout in seconds
    /// - `JOBFORGE_SCORE_THRESHOLD`: Minimum match score (0-100)
    /// - `JOBFORGE_RESET_HOUR`: Local hour of the daily budget reset (0-23)
    ///
    /// Every variable is required; parsing failures are hard errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            database_url: require("DATABASE_URL")?,
            agent_registry_path: PathBuf::from(require("JOBFORGE_AGENT_REGISTRY")?),
            poll_interval: Duration::from_secs(parse_var("JOBFORGE_POLL_INTERVAL_SECS")?),
            processing_timeout: Duration::from_secs(parse_var("JOBFORGE_PROCESSING_TIMEOUT_SECS")?),
            provider_timeout: Duration::from_secs(parse_var("JOBFORGE_PROVIDER_TIMEOUT_SECS")?),
            score_threshold: parse_var("JOBFORGE_SCORE_THRESHOLD")?,
            budget_reset_hour: parse_var("JOBFORGE_RESET_HOUR")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget_reset_hour > 23 {
            return Err(ConfigError::InvalidValue {
                key: "JOBFORGE_RESET_HOUR".to_string(),
                message: format!("hour {} is out of range 0-23", self.budget_reset_hour),
            });
        }

        if !(0.0..=100.0).contains(&self.score_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "JOBFORGE_SCORE_THRESHOLD".to_string(),
                message: format!("threshold {} is out of range 0-100", self.score_threshold),
            });
        }

        if self.provider_timeout >= self.processing_timeout {
            return Err(ConfigError::InvalidValue {
                key: "JOBFORGE_PROVIDER_TIMEOUT_SECS".to_string(),
                message: "provider timeout must be shorter than the item processing timeout"
                    .to_string(),
            });
        }

        Ok(())
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_var<T>(key: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = require(key)?;
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig {
            database_url: "postgres://localhost/jobforge".to_string(),
            agent_registry_path: PathBuf::from("agents.yaml"),
            poll_interval: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(120),
            score_threshold: 60.0,
            budget_reset_hour: 0,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        base_config().validate().expect("config should validate");
    }

    #[test]
    fn test_reset_hour_out_of_range() {
        let mut config = base_config();
        config.budget_reset_hour = 24;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_score_threshold_out_of_range() {
        let mut config = base_config();
        config.score_threshold = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_timeout_must_be_shorter() {
        let mut config = base_config();
        config.provider_timeout = Duration::from_secs(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_env_var_is_loud() {
        // from_env requires every key; a bare environment cannot satisfy it.
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(
            EngineConfig::from_env(),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
