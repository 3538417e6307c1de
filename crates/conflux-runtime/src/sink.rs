//! Downstream capabilities invoked when a group finalizes.
//!
//! A [`CompletionSink`] receives the aggregated messages exactly once per
//! group. A [`FaultSink`] receives messages that could not be aggregated or
//! whose aggregation failed downstream. Both may be called concurrently for
//! different groups, so implementations must be `Send + Sync` and must not
//! assume calls are serialized.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use conflux_core::SharedMessage;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::AggregationError;
use crate::policy::CompletionTrigger;

/// The outcome handed to a completion sink.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Correlation key of the finalized group
    pub key: String,
    /// Collected messages in arrival order
    pub messages: Vec<SharedMessage>,
    /// Rule that completed the group
    pub trigger: CompletionTrigger,
}

impl AggregationResult {
    /// A timed-out group that never collected anything yields "no result".
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Consumer of finalized aggregation groups.
///
/// Aggregate mediators and scatter-gather mediators both implement this; the
/// group never needs to know which one it is talking to.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Name of this sink, used in logs and errors
    fn name(&self) -> &str;

    /// Identifier scoping the sequence and correlation properties
    fn aggregator_id(&self) -> Option<&str> {
        None
    }

    /// Receive the aggregated messages of one group
    async fn on_aggregation_complete(&self, result: AggregationResult) -> Result<()>;
}

/// Best-effort receiver of aggregation failures.
pub trait FaultSink: Send + Sync {
    fn on_fault(&self, message: &SharedMessage, error: &AggregationError);
}

/// Forwards aggregation results over a tokio channel.
pub struct ChannelSink {
    name: String,
    aggregator_id: Option<String>,
    tx: mpsc::Sender<AggregationResult>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<AggregationResult>) -> Self {
        Self {
            name: name.into(),
            aggregator_id: None,
            tx,
        }
    }

    pub fn with_aggregator_id(mut self, id: impl Into<String>) -> Self {
        self.aggregator_id = Some(id.into());
        self
    }
}

#[async_trait]
impl CompletionSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn aggregator_id(&self) -> Option<&str> {
        self.aggregator_id.as_deref()
    }

    async fn on_aggregation_complete(&self, result: AggregationResult) -> Result<()> {
        self.tx
            .send(result)
            .await
            .map_err(|_| anyhow!("channel sink '{}' closed", self.name))
    }
}

type SinkFn = dyn Fn(AggregationResult) -> Result<()> + Send + Sync;

/// Wraps a synchronous closure as a completion sink.
pub struct FnSink {
    name: String,
    aggregator_id: Option<String>,
    f: Arc<SinkFn>,
}

impl FnSink {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AggregationResult) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            aggregator_id: None,
            f: Arc::new(f),
        }
    }

    pub fn with_aggregator_id(mut self, id: impl Into<String>) -> Self {
        self.aggregator_id = Some(id.into());
        self
    }
}

#[async_trait]
impl CompletionSink for FnSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn aggregator_id(&self) -> Option<&str> {
        self.aggregator_id.as_deref()
    }

    async fn on_aggregation_complete(&self, result: AggregationResult) -> Result<()> {
        (self.f)(result)
    }
}

/// Fault sink that only logs. Used when no fault handler is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn on_fault(&self, message: &SharedMessage, error: &AggregationError) {
        warn!(
            message_id = %message.message_id,
            kind = error.kind(),
            "Aggregation fault: {}",
            error
        );
    }
}
