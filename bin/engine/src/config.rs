//! Engine process configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested sections (`NATS__URL`, `RETRY__MAX_ATTEMPTS`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use stepweave_workflow::{EngineConfig, NatsConfig, RetryPolicy};

/// Engine process configuration.
#[derive(Debug, Deserialize)]
pub struct EngineSettings {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Directory of workflow definition files (`*.json`).
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    /// Queue transport configuration.
    pub nats: NatsSettings,

    #[serde(default)]
    pub engine: RunnerSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub max_deliver: Option<i64>,
    #[serde(default)]
    pub ack_wait_seconds: Option<u64>,
}

/// Runner tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    /// Iteration bound for instances that declare none.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
}

/// Deferred step retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed attempt is redelivered, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Seconds a running step may go untouched before another worker takes it over.
    #[serde(default = "default_claim_timeout_seconds")]
    pub claim_timeout_seconds: u64,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_claim_timeout_seconds() -> u64 {
    300
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            claim_timeout_seconds: default_claim_timeout_seconds(),
        }
    }
}

impl EngineSettings {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_max_iterations: self.engine.default_max_iterations,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            backoff: Duration::from_millis(self.retry.backoff_ms),
            claim_timeout: Duration::from_secs(self.retry.claim_timeout_seconds),
        }
    }

    #[must_use]
    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            url: self.nats.url.clone(),
            stream_name: self.nats.stream_name.clone(),
            max_deliver: self.nats.max_deliver,
            ack_wait: self.nats.ack_wait_seconds.map(Duration::from_secs),
        }
    }
}
