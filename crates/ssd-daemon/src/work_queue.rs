//! Bounded hand-off queue between interrupt context and the notifier thread
//!
//! The producer side ([`WorkQueue::schedule`]) is called from interrupt
//! context and is lock-free: atomics plus a `try_send` into a channel whose
//! buffer was allocated up front. The consumer side ([`WorkReceiver`]) is
//! owned by the single notifier thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use serde::Deserialize;

use crate::event::HardwareEvent;

/// How triggers map to deferred jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkPolicy {
    /// Every trigger gets its own job; two rapid edges produce two sends.
    #[default]
    PerEvent,
    /// At most one job waits to start; triggers while it waits are folded
    /// into it. A trigger while the job is already running queues a new one.
    Coalesce,
}

/// Outcome of a single [`WorkQueue::schedule`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Queued,
    Coalesced,
    Full,
    Closed,
}

enum Job {
    Run(HardwareEvent),
    Stop,
}

/// Counters for the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub scheduled: u64,
    pub coalesced: u64,
    pub rejected: u64,
    /// Jobs queued but not yet picked up by the worker.
    pub waiting: usize,
}

/// Producer handle shared by every [`InterruptCapture`](crate::InterruptCapture).
pub struct WorkQueue {
    tx: SyncSender<Job>,
    policy: WorkPolicy,
    depth: usize,
    waiting: AtomicUsize,
    pending: AtomicBool,
    closed: AtomicBool,
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
}

/// Consumer handle, owned by the notifier thread.
pub struct WorkReceiver {
    rx: Receiver<Job>,
    queue: Arc<WorkQueue>,
}

impl WorkQueue {
    /// Create a queue holding up to `depth` waiting jobs (at least one).
    pub fn new(depth: usize, policy: WorkPolicy) -> (Arc<Self>, WorkReceiver) {
        let depth = depth.max(1);
        // One extra slot so close() can always enqueue its stop marker
        let (tx, rx) = mpsc::sync_channel(depth + 1);
        let queue = Arc::new(Self {
            tx,
            policy,
            depth,
            waiting: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            scheduled: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });
        let receiver = WorkReceiver {
            rx,
            queue: queue.clone(),
        };
        (queue, receiver)
    }

    pub fn policy(&self) -> WorkPolicy {
        self.policy
    }

    /// Hand `event` to the worker. Never blocks and never allocates.
    pub fn schedule(&self, event: HardwareEvent) -> Schedule {
        if self.closed.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Schedule::Closed;
        }
        let coalescing = self.policy == WorkPolicy::Coalesce;
        if coalescing && self.pending.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return Schedule::Coalesced;
        }

        let reserved = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.depth).then_some(n + 1)
            })
            .is_ok();
        let outcome = if !reserved {
            Schedule::Full
        } else {
            match self.tx.try_send(Job::Run(event)) {
                Ok(()) => Schedule::Queued,
                Err(TrySendError::Full(_)) => Schedule::Full,
                Err(TrySendError::Disconnected(_)) => Schedule::Closed,
            }
        };

        if outcome == Schedule::Queued {
            self.scheduled.fetch_add(1, Ordering::Relaxed);
        } else {
            if reserved {
                self.waiting.fetch_sub(1, Ordering::AcqRel);
            }
            if coalescing {
                self.pending.store(false, Ordering::Release);
            }
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Reject further schedules and let the worker exit once the jobs already
    /// queued have run.
    ///
    /// Call only after every interrupt registration feeding this queue has
    /// been freed; a schedule racing with close may otherwise be lost.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Cannot be full: `depth` bounds the Run jobs and one slot is spare
            let _ = self.tx.try_send(Job::Stop);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }

    fn started(&self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        if self.policy == WorkPolicy::Coalesce {
            // Cleared before the job body runs, so an edge during execution queues again
            self.pending.store(false, Ordering::Release);
        }
    }
}

impl WorkReceiver {
    /// Block for the next job. `None` once the queue is closed and drained.
    pub fn next(&self) -> Option<HardwareEvent> {
        match self.rx.recv() {
            Ok(Job::Run(event)) => {
                self.queue.started();
                Some(event)
            }
            Ok(Job::Stop) | Err(_) => None,
        }
    }
}
