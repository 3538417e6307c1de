//! Message sequence metadata written by fan-out mediators.
//!
//! A fan-out stage (clone, iterate, scatter-gather) stamps each sibling with
//! two properties that the aggregator later reads back:
//!
//! - `MESSAGE_SEQUENCE[.<id>]` = `"current/total"`, the declared total
//! - `AGGREGATE_CORRELATION[.<id>]` = the parent message id, the correlation key
//!
//! The `.<id>` suffix scopes the properties to one aggregator so nested or
//! concurrent aggregations over the same message stream do not collide.

use std::fmt;
use std::str::FromStr;

use conflux_core::{MessageContext, Value};

use crate::error::AggregationError;

/// Base name of the declared-total property.
pub const MESSAGE_SEQUENCE: &str = "MESSAGE_SEQUENCE";
/// Separator between the current index and the total.
pub const MESSAGE_SEQUENCE_DELIMITER: char = '/';
/// Base name of the correlation property.
pub const AGGREGATE_CORRELATION: &str = "AGGREGATE_CORRELATION";

/// Position of one sibling within a fan-out, e.g. `2/3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSequence {
    pub current: u32,
    pub total: u32,
}

impl MessageSequence {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }
}

impl fmt::Display for MessageSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.current, MESSAGE_SEQUENCE_DELIMITER, self.total
        )
    }
}

/// Only the total is required: the text is split on `/` and the second field
/// must be a non-negative integer. A missing or unparseable current index reads
/// as 0 and fields past the second are ignored, so `"/3"` and `"1/3/9"` both
/// declare a total of 3.
impl FromStr for MessageSequence {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AggregationError::MalformedSequenceMetadata(s.to_string());
        let mut fields = s.split(MESSAGE_SEQUENCE_DELIMITER);
        let current = fields.next().unwrap_or_default();
        let total = fields.next().ok_or_else(malformed)?;
        Ok(Self {
            current: current.trim().parse().unwrap_or(0),
            total: total.trim().parse().map_err(|_| malformed())?,
        })
    }
}

fn scoped(base: &str, aggregator_id: Option<&str>) -> String {
    match aggregator_id {
        Some(id) if !id.is_empty() => format!("{}.{}", base, id),
        _ => base.to_string(),
    }
}

/// Property name holding the declared total for the given aggregator.
pub fn sequence_property(aggregator_id: Option<&str>) -> String {
    scoped(MESSAGE_SEQUENCE, aggregator_id)
}

/// Property name holding the correlation key for the given aggregator.
pub fn correlation_property(aggregator_id: Option<&str>) -> String {
    scoped(AGGREGATE_CORRELATION, aggregator_id)
}

/// Read the sequence stamped on a message under `property`.
///
/// Only string values are considered. Absent properties yield `Ok(None)`.
pub fn read_sequence(
    msg: &MessageContext,
    property: &str,
) -> Result<Option<MessageSequence>, AggregationError> {
    match msg.property(property) {
        Some(Value::Str(s)) => s.parse().map(Some),
        _ => Ok(None),
    }
}

/// Correlation key stamped on a message by [`fan_out`].
pub fn correlation_key<'a>(msg: &'a MessageContext, aggregator_id: Option<&str>) -> Option<&'a str> {
    msg.property_str(&correlation_property(aggregator_id))
}

/// Clone `template` into `count` siblings, stamping each with its sequence
/// position and the template's message id as correlation key.
///
/// Siblings get fresh message ids; everything else is copied.
pub fn fan_out(
    template: &MessageContext,
    count: u32,
    aggregator_id: Option<&str>,
) -> Vec<MessageContext> {
    let seq_prop = sequence_property(aggregator_id);
    let corr_prop = correlation_property(aggregator_id);

    (1..=count)
        .map(|current| {
            let mut sibling = template.clone();
            sibling.message_id = sibling_id(&template.message_id, current);
            sibling.set_property(
                seq_prop.clone(),
                MessageSequence::new(current, count).to_string(),
            );
            sibling.set_property(corr_prop.clone(), template.message_id.clone());
            sibling
        })
        .collect()
}

fn sibling_id(parent: &str, index: u32) -> String {
    format!("{}-{}", parent, index)
}
