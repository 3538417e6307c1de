//! Error types for the aggregation runtime

use thiserror::Error;

/// Errors raised while collecting or finalizing an aggregation group.
///
/// None of these are fatal: each is contained to the group that raised it.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Aggregation group '{key}' is full ({max_count} messages), message {message_id} rejected")]
    GroupFull {
        key: String,
        max_count: usize,
        message_id: String,
    },

    #[error("Malformed message sequence metadata: '{0}'")]
    MalformedSequenceMetadata(String),

    #[error("Completion sink '{sink}' failed for group '{key}': {source}")]
    SinkInvocationFailed {
        key: String,
        sink: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Aggregation group '{0}' has no messages")]
    EmptyGroup(String),
}

impl AggregationError {
    pub fn sink_failed(key: &str, sink: &str, err: anyhow::Error) -> Self {
        AggregationError::SinkInvocationFailed {
            key: key.to_string(),
            sink: sink.to_string(),
            source: err.into(),
        }
    }

    /// Correlation key of the group the error belongs to, if known.
    pub fn key(&self) -> Option<&str> {
        match self {
            AggregationError::GroupFull { key, .. }
            | AggregationError::SinkInvocationFailed { key, .. }
            | AggregationError::EmptyGroup(key) => Some(key),
            AggregationError::MalformedSequenceMetadata(_) => None,
        }
    }

    /// Stable label used for metrics and dead letter entries.
    pub fn kind(&self) -> &'static str {
        match self {
            AggregationError::GroupFull { .. } => "group_full",
            AggregationError::MalformedSequenceMetadata(_) => "malformed_sequence",
            AggregationError::SinkInvocationFailed { .. } => "sink_failed",
            AggregationError::EmptyGroup(_) => "empty_group",
        }
    }
}
