//! Worker-context half of the pipeline: one notification per job

use std::collections::TryReserveError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ssd_core::protocol::{FrameCodec, ProtocolError};
use ssd_core::{Transport, TransportError};

use crate::channel::{Destination, NotificationChannel, NotificationMessage};
use crate::event::HardwareEvent;
use crate::work_queue::WorkReceiver;

/// Why a notification was dropped.
#[derive(Debug)]
pub enum NotifyError {
    Alloc(TryReserveError),
    Encode(ProtocolError),
    Send(TransportError),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "message buffer: {e}"),
            Self::Encode(e) => write!(f, "encode: {e}"),
            Self::Send(e) => write!(f, "send: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Alloc(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Send(e) => Some(e),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    unicast: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
}

/// Notifications handled by the worker so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifierStats {
    pub unicast: u64,
    pub broadcast: u64,
    pub dropped: u64,
}

impl NotifierStats {
    pub fn total(&self) -> u64 {
        self.unicast + self.broadcast + self.dropped
    }
}

impl Counters {
    fn snapshot(&self) -> NotifierStats {
        NotifierStats {
            unicast: self.unicast.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Whether the worker finished within the drain timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut,
}

/// Builds and submits the notification for each scheduled event.
pub struct DeferredNotifier<T> {
    channel: Arc<NotificationChannel<T>>,
    counters: Arc<Counters>,
}

impl<T: Transport> DeferredNotifier<T> {
    pub fn new(channel: Arc<NotificationChannel<T>>) -> Self {
        Self {
            channel,
            counters: Arc::default(),
        }
    }

    /// Frame and send the notice for `event` to the current destination.
    ///
    /// The buffer is allocated fallibly; running out of memory drops this
    /// one notification instead of aborting.
    pub fn notify(&self, event: &HardwareEvent) -> Result<Destination, NotifyError> {
        let message = NotificationMessage::shutdown(self.channel.destination());
        let codec = self.channel.codec();

        let mut frame = Vec::new();
        frame
            .try_reserve_exact(FrameCodec::frame_len(message.payload().len()))
            .map_err(NotifyError::Alloc)?;
        codec
            .encode_into(
                &codec.envelope(message.header_pid(), message.payload()),
                &mut frame,
            )
            .map_err(NotifyError::Encode)?;

        let reached = self
            .channel
            .submit(&message.destination, &frame)
            .map_err(NotifyError::Send)?;
        log::info!(
            "{}: shutdown notice sent to {} (reached {reached}, {:?} after edge)",
            event.source,
            message.destination,
            event.occurred_at.elapsed()
        );
        Ok(message.destination)
    }

    fn execute(&self, event: &HardwareEvent) {
        match self.notify(event) {
            Ok(Destination::Unicast(_)) => {
                self.counters.unicast.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Destination::Broadcast(_)) => {
                self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: shutdown notice dropped: {e}", event.source);
            }
        }
    }

    pub fn stats(&self) -> NotifierStats {
        self.counters.snapshot()
    }
}

impl<T: Transport + 'static> DeferredNotifier<T> {
    /// Run jobs from `jobs` on a dedicated thread until the queue closes.
    pub fn spawn(self, jobs: WorkReceiver) -> io::Result<NotifierHandle> {
        let counters = self.counters.clone();
        let (done_tx, done) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("ssd-notifier".into())
            .spawn(move || {
                while let Some(event) = jobs.next() {
                    self.execute(&event);
                }
                log::debug!("notifier drained");
                let _ = done_tx.send(());
            })?;
        Ok(NotifierHandle {
            thread,
            done,
            counters,
        })
    }
}

/// Handle to a running notifier thread.
pub struct NotifierHandle {
    thread: JoinHandle<()>,
    done: Receiver<()>,
    counters: Arc<Counters>,
}

impl NotifierHandle {
    pub fn stats(&self) -> NotifierStats {
        self.counters.snapshot()
    }

    /// Wait up to `timeout` for the worker to finish. The queue must already
    /// be closed. On timeout the thread is left to finish on its own.
    pub fn join(self, timeout: Duration) -> (DrainOutcome, NotifierStats) {
        let outcome = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    log::error!("notifier thread panicked");
                }
                DrainOutcome::Drained
            }
            Err(RecvTimeoutError::Timeout) => DrainOutcome::TimedOut,
        };
        (outcome, self.counters.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use ssd_core::protocol::{BROADCAST_GROUP, SHUTDOWN};
    use ssd_core::transport::{MemoryBus, MemoryTransport, Route};
    use ssd_core::{AgentSocket, HELLO, RecvWait};

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::event::EventSource;
    use crate::work_queue::{WorkPolicy, WorkQueue};

    const WAIT: Duration = Duration::from_secs(2);

    fn channel(bus: &MemoryBus) -> Arc<NotificationChannel<MemoryTransport>> {
        Arc::new(NotificationChannel::open(
            bus.transport(),
            &ChannelConfig::default(),
        ))
    }

    #[test]
    fn broadcasts_without_listener() {
        let bus = MemoryBus::new();
        let notifier = DeferredNotifier::new(channel(&bus));
        let dest = notifier
            .notify(&HardwareEvent::now(EventSource::PowerFailure))
            .unwrap();
        assert_eq!(dest, Destination::Broadcast(BROADCAST_GROUP));

        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Route::Broadcast(BROADCAST_GROUP));
        let env = FrameCodec::default().decode(&sent[0].1).unwrap();
        assert_eq!(env.payload, SHUTDOWN);
        assert_eq!(env.pid, 0);
    }

    #[test]
    fn unicasts_with_listener_pid_in_header() {
        let bus = MemoryBus::new();
        let channel = channel(&bus);
        let agent = bus.agent(4321);
        let codec = FrameCodec::default();
        agent
            .send(&codec.encode(&codec.envelope(4321, HELLO)).unwrap())
            .unwrap();
        channel.handshake(RecvWait::NoWait).unwrap();

        let notifier = DeferredNotifier::new(channel);
        notifier
            .notify(&HardwareEvent::now(EventSource::PowerButton))
            .unwrap();

        let mut buf = [0u8; 64];
        let n = agent.recv(&mut buf).unwrap();
        let env = codec.decode(&buf[..n]).unwrap();
        assert_eq!(env.payload, SHUTDOWN);
        assert_eq!(env.pid, 4321);
    }

    #[test]
    fn send_failure_is_counted_as_dropped() {
        let bus = MemoryBus::new();
        let channel = channel(&bus);
        channel.close();
        let notifier = DeferredNotifier::new(channel);
        notifier.execute(&HardwareEvent::now(EventSource::PowerFailure));
        assert_eq!(
            notifier.stats(),
            NotifierStats {
                dropped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn worker_runs_jobs_until_queue_closes() {
        let bus = MemoryBus::new();
        let (queue, jobs) = WorkQueue::new(8, WorkPolicy::PerEvent);
        let handle = DeferredNotifier::new(channel(&bus)).spawn(jobs).unwrap();

        for _ in 0..3 {
            queue.schedule(HardwareEvent::now(EventSource::PowerButton));
        }
        queue.close();
        let (outcome, stats) = handle.join(WAIT);
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(stats.broadcast, 3);
        assert_eq!(bus.sent().len(), 3);
    }

    #[test]
    fn join_times_out_on_stalled_worker() {
        let bus = MemoryBus::new();
        bus.set_send_delay(Duration::from_millis(300));
        let (queue, jobs) = WorkQueue::new(8, WorkPolicy::PerEvent);
        let handle = DeferredNotifier::new(channel(&bus)).spawn(jobs).unwrap();

        queue.schedule(HardwareEvent::now(EventSource::PowerFailure));
        queue.close();
        let (outcome, _) = handle.join(Duration::from_millis(20));
        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert!(bus.wait_for_sends(1, WAIT));
    }
}
