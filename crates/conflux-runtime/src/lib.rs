//! Conflux Runtime - correlation-based message aggregation
//!
//! A fan-out mediator splits one inbound message into many; this crate
//! recombines the independently arriving responses. Each correlation key gets
//! an [`AggregationGroup`] that completes exactly once, on whichever fires
//! first of:
//!
//! - the declared total stamped by the fan-out (`MESSAGE_SEQUENCE`)
//! - the minimum or maximum message count
//! - the group's timeout, driven by a shared [`ExpiryScheduler`]
//!
//! The pipeline talks to an [`AggregationCoordinator`]; results arrive at a
//! [`CompletionSink`] and failures at a [`FaultSink`].
//!
//! ```rust,ignore
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! let coordinator = AggregationCoordinator::builder(Arc::new(ChannelSink::new("quotes", tx)))
//!     .fault_sink(Arc::new(DeadLetterQueue::open("dlq.jsonl")?))
//!     .build();
//!
//! let params = AggregationParams::default().with_min(3).with_timeout(Duration::from_secs(5));
//! coordinator.admit("order-17", response.into_shared(), &params).await;
//! ```

pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod group;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod sequence;
pub mod sink;

pub use config::{AggregateConfig, Config, ConfigError, LoggingConfig};
pub use coordinator::{AdmitOutcome, AggregationCoordinator, CoordinatorBuilder};
pub use dead_letter::DeadLetterQueue;
pub use error::AggregationError;
pub use group::{AggregationGroup, AggregationParams, GroupSnapshot, Offer};
pub use metrics::AggregationMetrics;
pub use policy::{Completion, CompletionPolicy, CompletionTrigger};
pub use registry::GroupRegistry;
pub use scheduler::{ExpiredGroup, ExpiryScheduler};
pub use sequence::{correlation_key, fan_out, MessageSequence};
pub use sink::{
    AggregationResult, ChannelSink, CompletionSink, FaultSink, FnSink, LogFaultSink,
};

pub use conflux_core::{MessageContext, SharedMessage, Value};
