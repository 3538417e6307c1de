//! Deadline scheduling for aggregation groups.
//!
//! One dispatcher task per scheduler owns a deadline-ordered heap of pending
//! expiries, so thousands of groups share a single timer instead of a task
//! each. When a deadline passes the scheduler hands an [`ExpiredGroup`] to
//! its callback; deciding whether that still means anything (the group may
//! have completed long ago) is the callback's job.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Notification that a group's deadline has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredGroup {
    pub key: String,
    pub group_id: u64,
    pub deadline: Instant,
}

struct PendingExpiry {
    deadline: tokio::time::Instant,
    seq: u64,
    key: String,
    group_id: u64,
}

impl PartialEq for PendingExpiry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for PendingExpiry {}

impl PartialOrd for PendingExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingExpiry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Shared timer for group deadlines.
pub struct ExpiryScheduler {
    name: String,
    tx: mpsc::UnboundedSender<PendingExpiry>,
    seq: AtomicU64,
    pending: Arc<AtomicUsize>,
    fired: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ExpiryScheduler {
    /// Spawn the dispatcher task. Must be called inside a tokio runtime.
    pub fn new<F>(name: impl Into<String>, on_expiry: F) -> Self
    where
        F: Fn(ExpiredGroup) + Send + Sync + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicU64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(Self::dispatcher_task(
            name.clone(),
            rx,
            pending.clone(),
            fired.clone(),
            stopped.clone(),
            on_expiry,
        ));

        Self {
            name,
            tx,
            seq: AtomicU64::new(0),
            pending,
            fired,
            stopped,
            handle,
        }
    }

    async fn dispatcher_task<F>(
        name: String,
        mut rx: mpsc::UnboundedReceiver<PendingExpiry>,
        pending: Arc<AtomicUsize>,
        fired: Arc<AtomicU64>,
        stopped: Arc<AtomicBool>,
        on_expiry: F,
    ) where
        F: Fn(ExpiredGroup) + Send + Sync + 'static,
    {
        info!("Expiry scheduler '{}' started", name);
        let mut heap: BinaryHeap<Reverse<PendingExpiry>> = BinaryHeap::new();

        loop {
            let next = heap.peek().map(|Reverse(p)| p.deadline);
            let sleep_until = next.unwrap_or_else(|| {
                tokio::time::Instant::now() + Duration::from_secs(3600)
            });

            tokio::select! {
                entry = rx.recv() => match entry {
                    Some(entry) => heap.push(Reverse(entry)),
                    None => {
                        debug!(
                            "Expiry scheduler '{}' stopping with {} pending deadlines",
                            name,
                            heap.len()
                        );
                        break;
                    }
                },
                _ = tokio::time::sleep_until(sleep_until), if next.is_some() => {
                    let now = tokio::time::Instant::now();
                    while heap.peek().is_some_and(|Reverse(p)| p.deadline <= now) {
                        if stopped.load(Ordering::Acquire) {
                            return;
                        }
                        let Some(Reverse(expired)) = heap.pop() else {
                            break;
                        };
                        let _ = pending.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                            n.checked_sub(1)
                        });
                        fired.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            key = %expired.key,
                            group_id = expired.group_id,
                            "Aggregation deadline elapsed"
                        );
                        on_expiry(ExpiredGroup {
                            key: expired.key,
                            group_id: expired.group_id,
                            deadline: expired.deadline.into_std(),
                        });
                    }
                }
            }
        }
    }

    /// Arrange for the callback to run once `deadline` has passed.
    pub fn schedule(&self, key: impl Into<String>, group_id: u64, deadline: Instant) {
        if self.stopped.load(Ordering::Acquire) {
            debug!("Expiry scheduler '{}' is stopped, deadline dropped", self.name);
            return;
        }
        let entry = PendingExpiry {
            deadline: tokio::time::Instant::from_std(deadline),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            group_id,
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(entry).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            debug!("Expiry scheduler '{}' is stopped, deadline dropped", self.name);
        }
    }

    /// Deadlines scheduled but not yet fired.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Deadlines fired so far.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the dispatcher. Pending deadlines are discarded and never fire.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.abort();
        self.pending.store(0, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.handle.is_finished()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
