//! Dead letter queue for messages that could not be aggregated.
//!
//! Rejected messages and the last message of a group whose completion sink
//! failed are appended here, one JSON line each, with the error that caused
//! them, so they can be inspected or replayed later.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use conflux_core::{MessageContext, SharedMessage};
use tracing::error;

use crate::error::AggregationError;
use crate::sink::FaultSink;

/// A dead letter queue entry with error metadata.
#[derive(serde::Serialize)]
struct DlqEntry<'a> {
    /// ISO-8601 timestamp when the message was dead-lettered.
    timestamp: String,
    /// Correlation key of the group, null when the error has none.
    key: Option<&'a str>,
    /// Stable error label, see [`AggregationError::kind`].
    kind: &'a str,
    /// Human readable error.
    error: String,
    /// The message that failed.
    message: &'a MessageContext,
}

/// File-backed dead letter queue.
///
/// Appends JSON-lines to a file. Thread-safe via internal mutex on the file handle.
pub struct DeadLetterQueue {
    file: Mutex<File>,
    path: PathBuf,
    /// Total messages written to this DLQ.
    pub messages_total: AtomicU64,
}

impl DeadLetterQueue {
    /// Open (or create) a DLQ file at the given path.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            messages_total: AtomicU64::new(0),
        })
    }

    /// Write a failed message to the DLQ with error metadata.
    pub fn write(&self, message: &MessageContext, err: &AggregationError) {
        let entry = DlqEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            key: err.key(),
            kind: err.kind(),
            error: err.to_string(),
            message,
        };

        match serde_json::to_string(&entry) {
            Ok(line) => {
                let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
                match writeln!(file, "{}", line) {
                    Ok(()) => {
                        self.messages_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => error!("Failed to write dead letter {}: {}", self.path.display(), e),
                }
            }
            Err(e) => error!("Failed to serialize dead letter: {}", e),
        }
    }

    /// Path to the DLQ file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of messages written so far.
    pub fn count(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }
}

impl FaultSink for DeadLetterQueue {
    fn on_fault(&self, message: &SharedMessage, error: &AggregationError) {
        self.write(message, error);
    }
}
