//! Serialized operation queue for the conversation monitor
//!
//! One consumer pops one operation at a time; callbacks only ever enqueue.
//! Base order is FIFO with two coalescing rules applied at enqueue time:
//! a non-insert window fill is dropped while any window fill is still
//! queued, and a queued reseed is superseded by a newer one. Append and
//! remove operations are never coalesced; their relative order carries
//! meaning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::email::EmailId;
use crate::folder::FolderPath;

/// A state-transition verb applied to the conversation set.
///
/// Modeled as a tagged variant so the queue can inspect kinds for
/// coalescing without touching payloads.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Seed the set from the local mirror
    LocalLoad,
    /// Re-list from the lowest held email upward; fired when the remote
    /// becomes available
    Reseed { reason: String },
    /// Load more conversations until the window target is met
    FillWindow { is_insert: bool },
    /// Ingest emails that appeared in the monitored folder
    Append { ids: Vec<EmailId> },
    /// Drop emails that left the monitored folder
    Remove { ids: Vec<EmailId> },
    /// Ingest emails from another folder that may thread into held
    /// conversations
    ExternalAppend {
        folder: FolderPath,
        ids: Vec<EmailId>,
    },
}

/// Discriminant of an [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    LocalLoad,
    Reseed,
    FillWindow,
    Append,
    Remove,
    ExternalAppend,
}

impl Operation {
    /// The operation's kind
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::LocalLoad => OperationKind::LocalLoad,
            Operation::Reseed { .. } => OperationKind::Reseed,
            Operation::FillWindow { .. } => OperationKind::FillWindow,
            Operation::Append { .. } => OperationKind::Append,
            Operation::Remove { .. } => OperationKind::Remove,
            Operation::ExternalAppend { .. } => OperationKind::ExternalAppend,
        }
    }

    /// Short name for logging
    pub fn describe(&self) -> &'static str {
        match self {
            Operation::LocalLoad => "local-load",
            Operation::Reseed { .. } => "reseed",
            Operation::FillWindow { .. } => "fill-window",
            Operation::Append { .. } => "append",
            Operation::Remove { .. } => "remove",
            Operation::ExternalAppend { .. } => "external-append",
        }
    }
}

struct QueueInner {
    ops: VecDeque<Operation>,
    stopped: bool,
}

/// FIFO queue of [`Operation`]s with a single async consumer
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    wake: Notify,
    processing: AtomicBool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ops: VecDeque::new(),
                stopped: false,
            }),
            wake: Notify::new(),
            processing: AtomicBool::new(false),
        }
    }

    /// Enqueue an operation, applying the coalescing rules.
    ///
    /// Returns false when the operation was coalesced away.
    pub fn add(&self, op: Operation) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            match &op {
                Operation::FillWindow { is_insert: false }
                    if inner
                        .ops
                        .iter()
                        .any(|o| o.kind() == OperationKind::FillWindow) =>
                {
                    debug!("window fill already queued, dropping duplicate");
                    return false;
                }
                Operation::Reseed { .. } => {
                    inner.ops.retain(|o| o.kind() != OperationKind::Reseed);
                }
                _ => {}
            }
            debug!(op = op.describe(), "operation enqueued");
            inner.ops.push_back(op);
        }
        self.wake.notify_one();
        true
    }

    /// Wait for the next operation. Returns `None` once the queue has been
    /// stopped.
    pub async fn next(&self) -> Option<Operation> {
        loop {
            let notified = self.wake.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.stopped {
                    return None;
                }
                if let Some(op) = inner.ops.pop_front() {
                    self.processing.store(true, Ordering::SeqCst);
                    return Some(op);
                }
            }
            notified.await;
        }
    }

    /// Mark the current operation finished
    pub fn op_finished(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    /// Drop every queued operation
    pub fn clear(&self) {
        self.inner.lock().unwrap().ops.clear();
    }

    /// Check if an operation of the given kind is queued
    pub fn has(&self, kind: OperationKind) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .any(|o| o.kind() == kind)
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().ops.is_empty()
    }

    /// Check if an operation is currently executing
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Check if an operation is queued or executing
    pub fn is_active(&self) -> bool {
        self.is_processing() || !self.is_empty()
    }

    /// Make the consumer return `None` after the current operation; queued
    /// operations stay until [`clear`](Self::clear)
    pub fn request_stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.wake.notify_waiters();
    }

    /// Allow consumption again after a stop
    pub fn activate(&self) {
        self.inner.lock().unwrap().stopped = false;
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = OperationQueue::new();
        queue.add(Operation::LocalLoad);
        queue.add(Operation::Append { ids: vec![EmailId(1)] });
        queue.add(Operation::Remove { ids: vec![EmailId(1)] });

        assert_eq!(queue.len(), 3);
        assert!(queue.has(OperationKind::LocalLoad));
        assert!(queue.has(OperationKind::Append));
        assert!(queue.has(OperationKind::Remove));
    }

    #[test]
    fn test_duplicate_fill_window_dropped() {
        let queue = OperationQueue::new();
        assert!(queue.add(Operation::FillWindow { is_insert: false }));
        assert!(!queue.add(Operation::FillWindow { is_insert: false }));
        assert_eq!(queue.len(), 1);

        // Insert-triggered fills are exempt from the drop rule.
        assert!(queue.add(Operation::FillWindow { is_insert: true }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reseed_superseded() {
        let queue = OperationQueue::new();
        queue.add(Operation::Reseed {
            reason: "first".to_string(),
        });
        queue.add(Operation::Append { ids: vec![EmailId(1)] });
        queue.add(Operation::Reseed {
            reason: "second".to_string(),
        });

        assert_eq!(queue.len(), 2);
        // The append keeps its place ahead of the superseding reseed.
        let inner = queue.inner.lock().unwrap();
        assert_eq!(inner.ops[0].kind(), OperationKind::Append);
        match &inner.ops[1] {
            Operation::Reseed { reason } => assert_eq!(reason, "second"),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_pops_in_order() {
        let queue = OperationQueue::new();
        queue.add(Operation::LocalLoad);
        queue.add(Operation::FillWindow { is_insert: false });

        let first = queue.next().await.unwrap();
        assert_eq!(first.kind(), OperationKind::LocalLoad);
        assert!(queue.is_processing());
        queue.op_finished();

        let second = queue.next().await.unwrap();
        assert_eq!(second.kind(), OperationKind::FillWindow);
        queue.op_finished();
        assert!(!queue.is_active());
    }

    #[tokio::test]
    async fn test_stop_wakes_consumer() {
        let queue = std::sync::Arc::new(OperationQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue.request_stop();
        assert!(waiter.await.unwrap().is_none());

        queue.activate();
        queue.add(Operation::LocalLoad);
        assert!(queue.next().await.is_some());
    }
}
