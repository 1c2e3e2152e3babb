//! Configuration loading for the jobsync binary.
//!
//! The configuration is a TOML file with four parts:
//! - `[engine]`: engine address and optional bootstrap (resource, process)
//! - `[broker]`: broker address and bridge queue declaration
//! - `[logging]`: default log filter
//! - `[[workers]]`: one entry per task type
//!
//! Deployment variables override the file: `ZEEBE_ADDRESS`, `BPMN_FILE`,
//! `PROCESS_ID`, `RABBITMQ_URI`, `JOBSYNC_QUEUE` and `JOBSYNC_LOG`.

use jobsync_bridge::{QueueSpec, DEFAULT_PREFETCH, DEFAULT_QUEUE};
use jobsync_core::{MessageSpec, Variables};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine connection and bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gateway address.
    #[serde(default = "default_address")]
    pub address: String,

    /// Resource deployed before workers start.
    #[serde(default)]
    pub bpmn_file: Option<PathBuf>,

    /// Process started (latest version) before workers start.
    #[serde(default)]
    pub process_id: Option<String>,

    /// Variables of the started process instance.
    #[serde(default)]
    pub initial_variables: Variables,
}

fn default_address() -> String {
    "memory://".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            bpmn_file: None,
            process_id: None,
            initial_variables: Variables::new(),
        }
    }
}

/// Broker connection and bridge queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address.
    #[serde(default = "default_address")]
    pub uri: String,

    /// Queue consumed by the bridge.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Declare the queue durable.
    #[serde(default)]
    pub durable: bool,

    /// Declare the queue auto-delete.
    #[serde(default = "default_auto_delete")]
    pub auto_delete: bool,

    /// Unacknowledged deliveries allowed at once.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

const fn default_auto_delete() -> bool {
    true
}

const fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: default_address(),
            queue: default_queue(),
            durable: false,
            auto_delete: default_auto_delete(),
            prefetch: default_prefetch(),
        }
    }
}

impl BrokerConfig {
    /// Queue declaration for the bridge.
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec::new(self.queue.clone())
            .durable(self.durable)
            .auto_delete(self.auto_delete)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Message address in config form; the correlation key defaults to `"0"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Message name.
    pub name: String,

    /// Correlation key.
    #[serde(default = "default_correlation_key")]
    pub correlation_key: String,
}

fn default_correlation_key() -> String {
    "0".to_string()
}

impl From<&MessageConfig> for MessageSpec {
    fn from(config: &MessageConfig) -> Self {
        MessageSpec::new(config.name.clone(), config.correlation_key.clone())
    }
}

/// Response published after completion on behalf of a hidden participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredConfig {
    /// Message the response is published to.
    pub message: MessageConfig,

    /// Response variables.
    #[serde(default)]
    pub response: Variables,
}

/// How the simulated handler finishes a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Complete; the loop takes no further action
    #[default]
    Complete,
    /// Complete, then cancel the job's process instance
    CompleteAndCancel,
    /// Fail with no retries
    Fail,
}

/// One task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Task type to subscribe to.
    pub task_type: String,

    /// Message published with the handler's variables.
    #[serde(default)]
    pub message: Option<MessageConfig>,

    /// Response published after completion.
    #[serde(default)]
    pub deferred: Option<DeferredConfig>,

    /// Outcome of the simulated handler.
    #[serde(default)]
    pub outcome: Outcome,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Task types to serve.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl AppConfig {
    /// Load `path` (or defaults), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Override fields from deployment variables found by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("ZEEBE_ADDRESS") {
            self.engine.address = address;
        }
        if let Some(file) = lookup("BPMN_FILE") {
            self.engine.bpmn_file = Some(PathBuf::from(file));
        }
        if let Some(process_id) = lookup("PROCESS_ID") {
            self.engine.process_id = Some(process_id);
        }
        if let Some(uri) = lookup("RABBITMQ_URI") {
            self.broker.uri = uri;
        }
        if let Some(queue) = lookup("JOBSYNC_QUEUE") {
            self.broker.queue = queue;
        }
        if let Some(level) = lookup("JOBSYNC_LOG") {
            self.logging.level = level;
        }
    }

    /// Reject configurations no worker pool could run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.task_type.trim().is_empty() {
                return Err(ConfigError::Invalid("worker with empty task type".to_string()));
            }
            if !seen.insert(worker.task_type.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate task type {}",
                    worker.task_type
                )));
            }

            let deferred = worker.deferred.as_ref().map(|d| &d.message);
            for message in worker.message.iter().chain(deferred) {
                if message.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "empty message name for task type {}",
                        worker.task_type
                    )));
                }
            }
        }

        if self.broker.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("empty broker queue".to_string()));
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::Invalid("broker prefetch must be at least 1".to_string()));
        }
        if matches!(&self.engine.process_id, Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::Invalid("empty process id".to_string()));
        }
        Ok(())
    }
}
