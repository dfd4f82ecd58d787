//! Interrupt-context half of the pipeline

use std::sync::Arc;

use crate::event::{EventSource, HardwareEvent};
use crate::work_queue::WorkQueue;

/// Status handed back to the line driver after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotMine,
}

/// Handler bound to one input line.
///
/// [`handle`](Self::handle) is what the edge dispatcher calls in interrupt
/// context. It stamps a [`HardwareEvent`], offers it to the work queue and
/// returns. It never allocates, blocks, logs or touches the channel; a
/// trigger the queue rejects shows up only in [`WorkQueue::stats`].
#[derive(Clone)]
pub struct InterruptCapture {
    source: EventSource,
    queue: Arc<WorkQueue>,
}

impl InterruptCapture {
    pub fn new(source: EventSource, queue: Arc<WorkQueue>) -> Self {
        Self { source, queue }
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn handle(&self) -> IrqReturn {
        self.queue.schedule(HardwareEvent::now(self.source));
        IrqReturn::Handled
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::work_queue::WorkPolicy;

    #[test]
    fn handle_schedules_one_job() {
        let (queue, jobs) = WorkQueue::new(4, WorkPolicy::PerEvent);
        let capture = InterruptCapture::new(EventSource::PowerButton, queue.clone());

        assert_eq!(capture.handle(), IrqReturn::Handled);
        assert_eq!(queue.stats().scheduled, 1);
        assert_eq!(jobs.next().unwrap().source, EventSource::PowerButton);
    }

    #[test]
    fn handle_returns_promptly_when_nobody_drains() {
        let (queue, _jobs) = WorkQueue::new(2, WorkPolicy::PerEvent);
        let capture = InterruptCapture::new(EventSource::PowerFailure, queue.clone());

        let start = Instant::now();
        for _ in 0..1000 {
            assert_eq!(capture.handle(), IrqReturn::Handled);
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let stats = queue.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.rejected, 998);
    }

    #[test]
    fn handle_after_close_is_still_handled() {
        let (queue, _jobs) = WorkQueue::new(2, WorkPolicy::PerEvent);
        let capture = InterruptCapture::new(EventSource::PowerFailure, queue.clone());
        queue.close();
        assert_eq!(capture.handle(), IrqReturn::Handled);
        assert_eq!(queue.stats().rejected, 1);
    }
}
