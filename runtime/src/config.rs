//! Engine configuration.
//!
//! Configuration is a TOML document with three sections:
//!
//! ```toml
//! [observability]
//! log_level = "debug"
//!
//! [flows.quotes]
//! processing_strategy = "asynchronous"
//! worker_threads = 8
//! max_redeliveries = 3
//! redelivery_delay_ms = 250
//! dlq_max_size = 500
//!
//! [correlators.best-rate]
//! timeout_ms = 3000
//! eviction = "forward_partial"
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use crate::retry::RetryPolicy;
use crate::strategy::{ProcessingStrategy, StrategyKind};
use courier_core::correlation::CorrelatorConfig;
use courier_core::exchange::ExchangePattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// Errors from loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path to the file
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("{component} '{name}' has invalid {field}: {message}")]
    Validation {
        /// Section kind (`flow`, `correlator`, `observability`)
        component: &'static str,
        /// Entry name
        name: String,
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, human-oriented output
    #[default]
    Full,
    /// One line per event
    Compact,
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub log_level: String,
    /// Output format
    pub log_format: LogFormat,
    /// Address the metrics endpoint should be served on, if any
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            metrics_addr: None,
        }
    }
}

/// Settings for one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Scheduling policy for the flow's chain
    pub processing_strategy: StrategyKind,
    /// Pattern stamped on every inbound envelope; `None` keeps the envelope's
    pub exchange_pattern: Option<ExchangePattern>,
    /// Redeliveries after the first failed attempt
    pub max_redeliveries: u32,
    /// Delay before the first redelivery; later ones back off exponentially
    pub redelivery_delay_ms: u64,
    /// Capacity of the flow's dead letter queue; `None` disables it
    pub dlq_max_size: Option<usize>,
    /// Worker pool size for the asynchronous strategy
    pub worker_threads: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            processing_strategy: StrategyKind::default(),
            exchange_pattern: None,
            max_redeliveries: 0,
            redelivery_delay_ms: 100,
            dlq_max_size: None,
            worker_threads: crate::pool::DEFAULT_WORKER_THREADS,
        }
    }
}

impl FlowConfig {
    /// The configured processing strategy
    #[must_use]
    pub fn processing_strategy(&self) -> ProcessingStrategy {
        ProcessingStrategy::from_kind(self.processing_strategy, self.worker_threads)
    }

    /// The configured redelivery policy, if redelivery is enabled
    #[must_use]
    pub const fn redelivery(&self) -> Option<RetryPolicy> {
        if self.max_redeliveries == 0 {
            return None;
        }
        Some(
            RetryPolicy::new()
                .max_retries(self.max_redeliveries)
                .initial_delay(Duration::from_millis(self.redelivery_delay_ms)),
        )
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging and metrics
    pub observability: ObservabilityConfig,
    /// Flows by name
    pub flows: BTreeMap<String, FlowConfig>,
    /// Correlators by name
    pub correlators: BTreeMap<String, CorrelatorConfig>,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Validation`] for out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(
            path = %path.display(),
            flows = config.flows.len(),
            correlators = config.correlators.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load the file named by `COURIER_CONFIG`, or defaults if it is unset.
    ///
    /// # Errors
    ///
    /// As [`load`](Self::load) when the variable is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Settings for `flow`, or defaults if it is not configured
    #[must_use]
    pub fn flow(&self, flow: &str) -> FlowConfig {
        self.flows.get(flow).cloned().unwrap_or_default()
    }

    /// Settings for `correlator`, or defaults if it is not configured
    #[must_use]
    pub fn correlator(&self, correlator: &str) -> CorrelatorConfig {
        self.correlators.get(correlator).cloned().unwrap_or_default()
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Validation`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.observability.log_level.trim().is_empty() {
            return Err(invalid("observability", "observability", "log_level", "must not be empty"));
        }

        for (name, flow) in &self.flows {
            if flow.worker_threads == 0 {
                return Err(invalid("flow", name, "worker_threads", "must be at least 1"));
            }
            if flow.dlq_max_size == Some(0) {
                return Err(invalid(
                    "flow",
                    name,
                    "dlq_max_size",
                    "must be at least 1 (omit it to disable the dead letter queue)",
                ));
            }
        }

        for (name, correlator) in &self.correlators {
            if correlator.timeout_ms == Some(0) {
                return Err(invalid("correlator", name, "timeout_ms", "must be greater than 0"));
            }
            if correlator.max_processed_groups == 0 {
                return Err(invalid("correlator", name, "max_processed_groups", "must be at least 1"));
            }
        }

        Ok(())
    }
}

fn invalid(component: &'static str, name: &str, field: &'static str, message: &str) -> ConfigError {
    ConfigError::Validation {
        component,
        name: name.to_string(),
        field,
        message: message.to_string(),
    }
}
