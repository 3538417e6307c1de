//! Entry point the mediation pipeline calls to aggregate messages.
//!
//! Per group the coordinator drives `PENDING -> COMPLETING -> FINALIZED`:
//!
//! - `PENDING -> COMPLETING` happens once, for whichever of natural completion
//!   ([`AggregationCoordinator::admit`]) or forced completion (deadline or
//!   [`AggregationCoordinator::force_complete`]) claims the group first.
//! - `COMPLETING -> FINALIZED` evicts the group from the registry and invokes
//!   its completion sink outside any lock. Sink failures go to the fault sink.

use std::sync::{Arc, Weak};
use std::time::Instant;

use conflux_core::SharedMessage;
use tracing::{debug, error, info, warn};

use crate::error::AggregationError;
use crate::group::{AggregationGroup, AggregationParams, GroupSnapshot, Offer};
use crate::metrics::AggregationMetrics;
use crate::policy::CompletionTrigger;
use crate::registry::GroupRegistry;
use crate::scheduler::{ExpiredGroup, ExpiryScheduler};
use crate::sequence::{correlation_key, sequence_property};
use crate::sink::{AggregationResult, CompletionSink, FaultSink};

/// What happened to an admitted message.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// Recorded; the group is still collecting
    Pending,
    /// Recorded, and this admission finalized the group
    Completed(CompletionTrigger),
    /// Group at capacity; the message went to the fault sink
    Rejected,
    /// Group completed concurrently; the pipeline decides what to do
    Late(SharedMessage),
    /// Message carries no correlation key
    Uncorrelated(SharedMessage),
}

/// Builder for [`AggregationCoordinator`].
pub struct CoordinatorBuilder {
    name: String,
    sink: Arc<dyn CompletionSink>,
    aggregator_id: Option<String>,
    fault_sink: Option<Arc<dyn FaultSink>>,
    metrics: Option<AggregationMetrics>,
}

impl CoordinatorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Scope for the sequence and correlation properties. Defaults to the
    /// completion sink's aggregator id.
    pub fn aggregator_id(mut self, id: impl Into<String>) -> Self {
        self.aggregator_id = Some(id.into());
        self
    }

    pub fn fault_sink(mut self, fault_sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(fault_sink);
        self
    }

    pub fn metrics(mut self, metrics: AggregationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the coordinator and start its expiry scheduler.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Arc<AggregationCoordinator> {
        let aggregator_id = self
            .aggregator_id
            .or_else(|| self.sink.aggregator_id().map(str::to_string))
            .filter(|id| !id.is_empty());
        let sequence_property = sequence_property(aggregator_id.as_deref());

        Arc::new_cyclic(|weak: &Weak<AggregationCoordinator>| {
            let weak = weak.clone();
            let scheduler =
                ExpiryScheduler::new(format!("{}-expiry", self.name), move |expired| {
                    if let Some(coordinator) = weak.upgrade() {
                        tokio::spawn(async move {
                            coordinator.expire(expired).await;
                        });
                    }
                });

            info!("Aggregation coordinator '{}' started", self.name);

            AggregationCoordinator {
                name: self.name,
                registry: GroupRegistry::new(),
                scheduler,
                aggregator_id,
                sequence_property,
                sink: self.sink,
                fault_sink: self.fault_sink,
                metrics: self.metrics,
            }
        })
    }
}

/// Orchestrates registry, groups, policy and scheduler for one aggregator.
pub struct AggregationCoordinator {
    name: String,
    registry: GroupRegistry,
    scheduler: ExpiryScheduler,
    aggregator_id: Option<String>,
    sequence_property: String,
    sink: Arc<dyn CompletionSink>,
    fault_sink: Option<Arc<dyn FaultSink>>,
    metrics: Option<AggregationMetrics>,
}

impl AggregationCoordinator {
    pub fn builder(sink: Arc<dyn CompletionSink>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            name: sink.name().to_string(),
            sink,
            aggregator_id: None,
            fault_sink: None,
            metrics: None,
        }
    }

    /// Get or create the group for `key`, scheduling its deadline on creation.
    ///
    /// Fan-out mediators call this before dispatching siblings so the
    /// timeout runs from dispatch rather than from the first response.
    /// A group that was claimed but not yet evicted is evicted here and a
    /// fresh one created, so the returned group was collecting when handed out.
    pub fn open_group(&self, key: &str, params: &AggregationParams) -> Arc<AggregationGroup> {
        loop {
            let (group, created) = self.registry.get_or_create(key, || {
                AggregationGroup::with_sequence_property(
                    key,
                    *params,
                    self.sequence_property.clone(),
                    self.sink.clone(),
                    self.fault_sink.clone(),
                )
            });

            if created {
                debug!(key, group_id = group.id(), "Created aggregation group");
                if let Some(m) = &self.metrics {
                    m.record_created();
                }
                if let Some(deadline) = group.expiry() {
                    self.scheduler.schedule(key, group.id(), deadline);
                }
                return group;
            }

            if !group.is_completed() {
                return group;
            }

            debug!(key, group_id = group.id(), "Replacing completed aggregation group");
            self.registry.remove(key, group.id());
        }
    }

    /// Add `msg` to the group for `key`, finalizing the group if this
    /// message completes it.
    pub async fn admit(
        &self,
        key: &str,
        msg: SharedMessage,
        params: &AggregationParams,
    ) -> AdmitOutcome {
        let group = self.open_group(key, params);

        match group.offer(msg, Instant::now()) {
            Offer::Pending => AdmitOutcome::Pending,
            Offer::Claimed(trigger) => {
                self.finalize(group, trigger).await;
                AdmitOutcome::Completed(trigger)
            }
            Offer::Rejected { message, error } => {
                warn!(key, "{}", error);
                self.deliver_fault(group.fault_sink(), &message, error);
                AdmitOutcome::Rejected
            }
            Offer::Late(message) => {
                warn!(
                    key,
                    message_id = %message.message_id,
                    "Aggregation already completed - message not aggregated"
                );
                if let Some(m) = &self.metrics {
                    m.record_late();
                }
                AdmitOutcome::Late(message)
            }
        }
    }

    /// Like [`admit`](Self::admit), reading the key from the message's
    /// correlation property.
    pub async fn admit_correlated(
        &self,
        msg: SharedMessage,
        params: &AggregationParams,
    ) -> AdmitOutcome {
        let key = match correlation_key(&msg, self.aggregator_id.as_deref()) {
            Some(key) => key.to_string(),
            None => {
                debug!(
                    message_id = %msg.message_id,
                    "Message carries no correlation key"
                );
                return AdmitOutcome::Uncorrelated(msg);
            }
        };
        self.admit(&key, msg, params).await
    }

    /// Finalize the group for `key` now, whatever it has collected.
    ///
    /// Returns `false` if there is no live group or it is already completing.
    pub async fn force_complete(&self, key: &str) -> bool {
        match self.registry.get(key) {
            Some(group) => self.force(group).await,
            None => {
                debug!(key, "No aggregation group to force complete");
                false
            }
        }
    }

    /// Force completion of every live group. Returns how many this call finalized.
    pub async fn drain(&self) -> usize {
        let mut finalized = 0;
        for group in self.registry.groups() {
            if self.force(group).await {
                finalized += 1;
            }
        }
        finalized
    }

    async fn expire(&self, expired: ExpiredGroup) {
        match self.registry.get(&expired.key) {
            Some(group) if group.id() == expired.group_id => {
                self.force(group).await;
            }
            _ => debug!(
                key = %expired.key,
                group_id = expired.group_id,
                "Deadline for an already finalized group"
            ),
        }
    }

    async fn force(&self, group: Arc<AggregationGroup>) -> bool {
        match group.claim_forced(Instant::now()) {
            Some(trigger) => {
                if trigger == CompletionTrigger::Timeout {
                    warn!(key = %group.key(), "Aggregation timeout occurred");
                }
                self.finalize(group, trigger).await;
                true
            }
            None => false,
        }
    }

    async fn finalize(&self, group: Arc<AggregationGroup>, trigger: CompletionTrigger) {
        self.registry.remove(group.key(), group.id());

        let messages = group.messages();
        if let Some(m) = &self.metrics {
            m.record_completed(trigger, messages.len());
        }
        debug!(
            key = %group.key(),
            messages = messages.len(),
            %trigger,
            "Aggregation complete"
        );

        let sink = group.completion_sink().clone();
        let result = AggregationResult {
            key: group.key().to_string(),
            messages,
            trigger,
        };

        if let Err(e) = sink.on_aggregation_complete(result).await {
            let err = AggregationError::sink_failed(group.key(), sink.name(), e);
            match group.last_message() {
                Ok(last) => self.deliver_fault(group.fault_sink(), &last, err),
                Err(_) => {
                    if let Some(m) = &self.metrics {
                        m.record_fault(err.kind());
                    }
                    error!(
                        key = %group.key(),
                        "No messages were aggregated - [Message Dropped]: {}",
                        err
                    );
                }
            }
        }

        group.clear();
    }

    fn deliver_fault(
        &self,
        fault_sink: Option<&Arc<dyn FaultSink>>,
        msg: &SharedMessage,
        err: AggregationError,
    ) {
        if let Some(m) = &self.metrics {
            m.record_fault(err.kind());
        }
        match fault_sink {
            Some(fault_sink) => fault_sink.on_fault(msg, &err),
            None => error!(
                message_id = %msg.message_id,
                "No fault handler found - [Message Dropped]: {}",
                err
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregator_id(&self) -> Option<&str> {
        self.aggregator_id.as_deref()
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> Option<&AggregationMetrics> {
        self.metrics.as_ref()
    }

    /// Number of groups still collecting.
    pub fn active_groups(&self) -> usize {
        self.registry.len()
    }

    pub fn snapshot(&self, key: &str) -> Option<GroupSnapshot> {
        self.registry
            .get(key)
            .map(|group| group.snapshot(Instant::now()))
    }

    /// Stop the expiry scheduler. Live groups will only complete by count.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}
