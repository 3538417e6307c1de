//! Configuration file support for aggregation coordinators
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! name: quote-aggregator
//! metrics_enabled: true
//! dead_letter_file: /var/lib/conflux/dlq.jsonl
//!
//! aggregates:
//!   quotes:
//!     id: quotes
//!     timeout_ms: 5000
//!     min_messages: 2
//!     max_messages: 10
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::coordinator::{AggregationCoordinator, CoordinatorBuilder};
use crate::dead_letter::DeadLetterQueue;
use crate::group::AggregationParams;
use crate::metrics::AggregationMetrics;
use crate::sink::CompletionSink;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordinator name, used in logs
    pub name: String,

    /// Register Prometheus metrics for the coordinator
    pub metrics_enabled: bool,

    /// JSON-lines file receiving faulted messages
    pub dead_letter_file: Option<PathBuf>,

    /// Aggregation settings by aggregate name
    pub aggregates: IndexMap<String, AggregateConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "aggregator".to_string(),
            metrics_enabled: false,
            dead_letter_file: None,
            aggregates: IndexMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Completion settings for one aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AggregateConfig {
    /// Scopes the sequence and correlation properties, see
    /// [`Config::aggregate_coordinator`]
    pub id: Option<String>,

    /// Group timeout in milliseconds (0 disables)
    pub timeout_ms: u64,

    /// Minimum messages to complete (<= 0 disables)
    pub min_messages: i64,

    /// Maximum messages to collect (<= 0 disables)
    pub max_messages: i64,
}

impl AggregateConfig {
    pub fn params(&self) -> AggregationParams {
        AggregationParams::new(
            Duration::from_millis(self.timeout_ms),
            self.min_messages,
            self.max_messages,
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or an `EnvFilter` directive
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Include timestamps
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            timestamps: true,
        }
    }
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => {
                // Try YAML first, then TOML
                Self::from_yaml(&content).or_else(|_| Self::from_toml(&content))
            }
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Look up an aggregate by name
    pub fn aggregate(&self, name: &str) -> Result<&AggregateConfig, ConfigError> {
        self.aggregates
            .get(name)
            .ok_or_else(|| ConfigError::UnknownAggregate(name.to_string()))
    }

    /// Build a coordinator wired with this configuration's metrics and
    /// dead letter queue.
    ///
    /// Must be called inside a tokio runtime.
    pub fn coordinator(
        &self,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Arc<AggregationCoordinator>, ConfigError> {
        Ok(self.builder(sink)?.build())
    }

    /// Build a coordinator for one named aggregate, scoped by its `id`, and
    /// return it with the aggregate's completion parameters.
    ///
    /// Must be called inside a tokio runtime.
    pub fn aggregate_coordinator(
        &self,
        name: &str,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(Arc<AggregationCoordinator>, AggregationParams), ConfigError> {
        let aggregate = self.aggregate(name)?;
        let mut builder = self.builder(sink)?;
        if let Some(id) = &aggregate.id {
            builder = builder.aggregator_id(id.clone());
        }
        Ok((builder.build(), aggregate.params()))
    }

    fn builder(&self, sink: Arc<dyn CompletionSink>) -> Result<CoordinatorBuilder, ConfigError> {
        let mut builder = AggregationCoordinator::builder(sink).name(self.name.clone());

        if self.metrics_enabled {
            builder = builder.metrics(AggregationMetrics::new());
        }

        if let Some(path) = &self.dead_letter_file {
            let dlq = DeadLetterQueue::open(path)
                .map_err(|e| ConfigError::IoError(path.clone(), e.to_string()))?;
            builder = builder.fault_sink(Arc::new(dlq));
        }

        Ok(builder)
    }

    /// Create an example configuration
    pub fn example() -> Self {
        let mut aggregates = IndexMap::new();
        aggregates.insert(
            "quotes".to_string(),
            AggregateConfig {
                id: Some("quotes".to_string()),
                timeout_ms: 5_000,
                min_messages: 2,
                max_messages: 10,
            },
        );
        Self {
            name: "quote-aggregator".to_string(),
            metrics_enabled: true,
            dead_letter_file: Some(PathBuf::from("/var/lib/conflux/dlq.jsonl")),
            aggregates,
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
                timestamps: true,
            },
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Unknown aggregate: {0}")]
    UnknownAggregate(String),
}
