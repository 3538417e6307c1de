//! Message context passed through mediation

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::value::Value;

/// Type alias for IndexMap with FxBuildHasher for faster property lookups.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared, reference-counted message.
///
/// Aggregation only ever reads messages, so groups hold `Arc`s and the
/// caller keeps ownership of any further mutation.
pub type SharedMessage = Arc<MessageContext>;

/// A message flowing through a mediation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    /// Unique message id (UUID v4 unless supplied)
    pub message_id: String,
    /// Service action or operation the message targets
    pub action: Arc<str>,
    /// Time the message entered the bus
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Property bag read and written by mediators
    #[serde(default)]
    pub properties: FxIndexMap<String, Value>,
    /// Message body, opaque to the aggregation engine
    #[serde(default)]
    pub payload: Value,
}

impl MessageContext {
    pub fn new(action: impl Into<Arc<str>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            timestamp: Utc::now(),
            properties: IndexMap::with_hasher(FxBuildHasher),
            payload: Value::Null,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.shift_remove(key)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Wrap this message for sharing across pipeline threads.
    pub fn into_shared(self) -> SharedMessage {
        Arc::new(self)
    }
}
