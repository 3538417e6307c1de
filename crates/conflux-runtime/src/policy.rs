//! Completion decision for an aggregation group.
//!
//! Rules are checked in a fixed order and the first match wins:
//!
//! 1. declared total: the first message's `MESSAGE_SEQUENCE` says how many
//!    siblings to expect
//! 2. minimum message count reached
//! 3. maximum message count reached
//! 4. expiry deadline elapsed

use std::fmt;
use std::time::Instant;

use conflux_core::SharedMessage;
use tracing::debug;

use crate::sequence::read_sequence;

/// What caused a group to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionTrigger {
    /// Collected as many messages as the fan-out declared
    DeclaredTotal,
    /// Reached the configured minimum
    MinCount,
    /// Reached the configured maximum
    MaxCount,
    /// Deadline elapsed
    Timeout,
    /// Completed on request before its deadline
    Forced,
}

impl CompletionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionTrigger::DeclaredTotal => "declared_total",
            CompletionTrigger::MinCount => "min_count",
            CompletionTrigger::MaxCount => "max_count",
            CompletionTrigger::Timeout => "timeout",
            CompletionTrigger::Forced => "forced",
        }
    }
}

impl fmt::Display for CompletionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completion evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Incomplete,
    Complete(CompletionTrigger),
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete(_))
    }
}

/// Thresholds a group is evaluated against. Fixed at group creation.
#[derive(Debug, Clone)]
pub struct CompletionPolicy {
    /// Property carrying the declared total, already scoped by aggregator id
    pub sequence_property: String,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    pub expiry: Option<Instant>,
}

impl CompletionPolicy {
    /// Build a policy, treating non-positive counts as unset.
    pub fn new(
        sequence_property: impl Into<String>,
        min_count: i64,
        max_count: i64,
        expiry: Option<Instant>,
    ) -> Self {
        Self {
            sequence_property: sequence_property.into(),
            min_count: positive(min_count),
            max_count: positive(max_count),
            expiry,
        }
    }

    /// Decide whether `messages` satisfy any completion rule at `now`.
    ///
    /// Pure: reads nothing but its arguments and the policy thresholds.
    pub fn evaluate(&self, messages: &[SharedMessage], now: Instant) -> Completion {
        let collected = messages.len();

        if let Some(first) = messages.first() {
            match read_sequence(first, &self.sequence_property) {
                Ok(Some(seq)) => {
                    debug!(
                        "{} messages of {} collected in current aggregation",
                        collected, seq.total
                    );
                    if collected >= seq.total as usize {
                        return Completion::Complete(CompletionTrigger::DeclaredTotal);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Ignoring declared total: {}", e),
            }
        } else {
            debug!("No messages collected in current aggregation");
        }

        if let Some(min) = self.min_count {
            if collected >= min {
                debug!("Aggregation complete - minimum of {} reached", min);
                return Completion::Complete(CompletionTrigger::MinCount);
            }
        }

        if let Some(max) = self.max_count {
            if collected >= max {
                debug!("Aggregation complete - maximum of {} reached", max);
                return Completion::Complete(CompletionTrigger::MaxCount);
            }
        }

        if self.is_expired(now) {
            debug!("Aggregation complete - timed out");
            return Completion::Complete(CompletionTrigger::Timeout);
        }

        Completion::Incomplete
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|deadline| now >= deadline)
    }
}

fn positive(n: i64) -> Option<usize> {
    (n > 0).then_some(n as usize)
}
