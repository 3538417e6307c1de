//! Per-correlation-key aggregation state.
//!
//! An [`AggregationGroup`] collects the messages of one fan-out and decides,
//! under its own lock, when they are complete. The lock covers the
//! admit-evaluate-claim sequence only; the completion sink is always invoked
//! by the caller after the lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use conflux_core::SharedMessage;
use serde::Serialize;
use tracing::debug;

use crate::error::AggregationError;
use crate::policy::{Completion, CompletionPolicy, CompletionTrigger};
use crate::sequence::sequence_property;
use crate::sink::{CompletionSink, FaultSink};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Completion thresholds supplied when a group is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregationParams {
    /// Zero disables the expiry deadline
    pub timeout: Duration,
    /// `<= 0` means unset
    pub min_messages: i64,
    /// `<= 0` means unset
    pub max_messages: i64,
}

impl AggregationParams {
    pub fn new(timeout: Duration, min_messages: i64, max_messages: i64) -> Self {
        Self {
            timeout,
            min_messages,
            max_messages,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_min(mut self, min: i64) -> Self {
        self.min_messages = min;
        self
    }

    pub fn with_max(mut self, max: i64) -> Self {
        self.max_messages = max;
        self
    }
}

/// Result of offering a message to a group.
#[derive(Debug)]
pub enum Offer {
    /// Message recorded; the group is still collecting
    Pending,
    /// Message recorded and this call claimed the right to finalize
    Claimed(CompletionTrigger),
    /// Group at capacity; message not recorded
    Rejected {
        message: SharedMessage,
        error: AggregationError,
    },
    /// Group already completed; message returned untouched
    Late(SharedMessage),
}

/// Point-in-time view of a group for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub key: String,
    pub id: u64,
    pub messages: usize,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    pub expires_in: Option<Duration>,
    pub completed: bool,
}

#[derive(Default)]
struct GroupState {
    messages: Vec<SharedMessage>,
    completed: bool,
}

impl GroupState {
    fn has_capacity(&self, max: Option<usize>) -> bool {
        max.map_or(true, |max| self.messages.len() < max)
    }
}

/// The messages collected for one correlation key plus their completion state.
pub struct AggregationGroup {
    id: u64,
    key: String,
    timeout: Option<Duration>,
    created_at: Instant,
    policy: CompletionPolicy,
    completion_sink: Arc<dyn CompletionSink>,
    fault_sink: Option<Arc<dyn FaultSink>>,
    state: Mutex<GroupState>,
}

impl AggregationGroup {
    /// Group reading its declared total from the property scoped by the
    /// completion sink's aggregator id.
    pub fn new(
        key: impl Into<String>,
        params: AggregationParams,
        completion_sink: Arc<dyn CompletionSink>,
        fault_sink: Option<Arc<dyn FaultSink>>,
    ) -> Self {
        let property = sequence_property(completion_sink.aggregator_id());
        Self::with_sequence_property(key, params, property, completion_sink, fault_sink)
    }

    pub fn with_sequence_property(
        key: impl Into<String>,
        params: AggregationParams,
        sequence_property: impl Into<String>,
        completion_sink: Arc<dyn CompletionSink>,
        fault_sink: Option<Arc<dyn FaultSink>>,
    ) -> Self {
        let created_at = Instant::now();
        let timeout = (!params.timeout.is_zero()).then_some(params.timeout);
        let policy = CompletionPolicy::new(
            sequence_property,
            params.min_messages,
            params.max_messages,
            timeout.map(|t| created_at + t),
        );

        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            timeout,
            created_at,
            policy,
            completion_sink,
            fault_sink,
            state: Mutex::new(GroupState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `msg` unless the group is full or already completed.
    pub fn add_message(&self, msg: SharedMessage) -> bool {
        let mut state = self.lock();
        if state.completed || !state.has_capacity(self.policy.max_count) {
            return false;
        }
        state.messages.push(msg);
        true
    }

    /// Evaluate the completion rules without changing any state.
    ///
    /// A group that is already completed reports `Incomplete`: there is
    /// nothing left for the caller to finalize.
    pub fn evaluate_completion(&self, now: Instant) -> Completion {
        let state = self.lock();
        if state.completed {
            debug!(key = %self.key, "Aggregation already completed");
            return Completion::Incomplete;
        }
        self.policy.evaluate(&state.messages, now)
    }

    /// Flip `completed` from false to true. Returns whether this call did it.
    pub fn mark_completed(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.completed, true)
    }

    /// Add, evaluate and possibly claim completion in one lock hold.
    pub fn offer(&self, msg: SharedMessage, now: Instant) -> Offer {
        let mut state = self.lock();

        if state.completed {
            debug!(
                key = %self.key,
                "Aggregation already completed - message will not be aggregated"
            );
            return Offer::Late(msg);
        }

        if !state.has_capacity(self.policy.max_count) {
            let error = AggregationError::GroupFull {
                key: self.key.clone(),
                max_count: self.policy.max_count.unwrap_or_default(),
                message_id: msg.message_id.clone(),
            };
            return Offer::Rejected {
                message: msg,
                error,
            };
        }

        state.messages.push(msg);

        match self.policy.evaluate(&state.messages, now) {
            Completion::Complete(trigger) => {
                state.completed = true;
                Offer::Claimed(trigger)
            }
            Completion::Incomplete => Offer::Pending,
        }
    }

    /// Claim completion regardless of the count rules.
    ///
    /// Returns `None` if the group was already completed. The trigger is
    /// `Timeout` once the deadline has passed, `Forced` before that.
    pub fn claim_forced(&self, now: Instant) -> Option<CompletionTrigger> {
        if !self.mark_completed() {
            return None;
        }
        if self.policy.is_expired(now) {
            Some(CompletionTrigger::Timeout)
        } else {
            Some(CompletionTrigger::Forced)
        }
    }

    /// The most recently admitted message.
    pub fn last_message(&self) -> Result<SharedMessage, AggregationError> {
        self.lock()
            .messages
            .last()
            .cloned()
            .ok_or_else(|| AggregationError::EmptyGroup(self.key.clone()))
    }

    /// Snapshot of the collected messages in arrival order.
    pub fn messages(&self) -> Vec<SharedMessage> {
        self.lock().messages.clone()
    }

    /// Release collected messages after finalization.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.messages = Vec::new();
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.policy.expiry
    }

    pub fn min_count(&self) -> Option<usize> {
        self.policy.min_count
    }

    pub fn max_count(&self) -> Option<usize> {
        self.policy.max_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn policy(&self) -> &CompletionPolicy {
        &self.policy
    }

    pub fn completion_sink(&self) -> &Arc<dyn CompletionSink> {
        &self.completion_sink
    }

    pub fn fault_sink(&self) -> Option<&Arc<dyn FaultSink>> {
        self.fault_sink.as_ref()
    }

    pub fn snapshot(&self, now: Instant) -> GroupSnapshot {
        let state = self.lock();
        GroupSnapshot {
            key: self.key.clone(),
            id: self.id,
            messages: state.messages.len(),
            min_count: self.policy.min_count,
            max_count: self.policy.max_count,
            expires_in: self.policy.expiry.map(|d| d.saturating_duration_since(now)),
            completed: state.completed,
        }
    }
}

impl std::fmt::Debug for AggregationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationGroup")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .field("sink", &self.completion_sink.name())
            .finish()
    }
}
