//! Module lifecycle: ordered acquisition at init, reverse-order teardown
//!
//! Init opens the transport, runs the handshake, starts the notifier, claims
//! the lines and only then registers the interrupt handlers. Teardown undoes
//! this so that no handler can run once the worker is drained, the worker is
//! drained before the lines go, and the channel closes last.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ssd_core::{ListenerId, RecvWait, Transport, TransportError};

use crate::capture::InterruptCapture;
use crate::channel::NotificationChannel;
use crate::config::{HandshakeMode, ModuleConfig};
use crate::lines::{EdgeLine, LineError, LineProvider, LineSpec};
use crate::notifier::{DeferredNotifier, DrainOutcome, NotifierHandle, NotifierStats};
use crate::work_queue::{QueueStats, WorkQueue};

/// How often an open-ended handshake wait checks for a stop request.
const HANDSHAKE_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum InitError {
    /// The channel could not be opened. Nothing was claimed.
    Transport(TransportError),
    Handshake(TransportError),
    /// A stop was requested while waiting for a listener.
    Aborted,
    Worker(io::Error),
    Line { spec: LineSpec, source: LineError },
    Irq { spec: LineSpec, source: LineError },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "opening notification channel: {e}"),
            Self::Handshake(e) => write!(f, "listener handshake: {e}"),
            Self::Aborted => f.write_str("stopped while waiting for a listener"),
            Self::Worker(e) => write!(f, "starting worker thread: {e}"),
            Self::Line { spec, source } => write!(f, "claiming {spec}: {source}"),
            Self::Irq { spec, source } => write!(f, "requesting interrupt for {spec}: {source}"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) | Self::Handshake(e) => Some(e),
            Self::Worker(e) => Some(e),
            Self::Line { source, .. } | Self::Irq { source, .. } => Some(source),
            Self::Aborted => None,
        }
    }
}

/// What teardown found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub drain: DrainOutcome,
    pub jobs: QueueStats,
    pub notices: NotifierStats,
    pub lines_released: usize,
}

impl TeardownReport {
    pub fn log(&self) {
        log::info!("=== Teardown Summary ===");
        log::info!(
            "Jobs: {} scheduled, {} coalesced, {} rejected",
            self.jobs.scheduled,
            self.jobs.coalesced,
            self.jobs.rejected
        );
        log::info!(
            "Notices: {} unicast, {} broadcast, {} dropped",
            self.notices.unicast,
            self.notices.broadcast,
            self.notices.dropped
        );
        log::info!("Lines released: {}", self.lines_released);
        if self.drain == DrainOutcome::TimedOut {
            log::warn!("Deferred work was still running at channel close");
        }
    }
}

struct ArmedLine<L> {
    line: L,
    armed: bool,
}

/// Background thread accepting the first listener after the lines are armed.
struct Registrar {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Registrar {
    fn spawn<T: Transport + 'static>(channel: Arc<NotificationChannel<T>>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("ssd-handshake".into()).spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    match channel.handshake(RecvWait::Timeout(HANDSHAKE_SLICE)) {
                        Ok(Some(_)) => break,
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("background handshake stopped: {e}");
                            break;
                        }
                    }
                }
            }
        })?;
        Ok(Self { stop, thread })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.join().is_err() {
            log::error!("handshake thread panicked");
        }
    }
}

/// A loaded shutdown module: channel, worker, lines and handlers.
pub struct ShutdownModule<T: Transport + 'static, L: EdgeLine> {
    channel: Arc<NotificationChannel<T>>,
    queue: Option<Arc<WorkQueue>>,
    notifier: Option<NotifierHandle>,
    lines: Vec<ArmedLine<L>>,
    registrar: Option<Registrar>,
    drain_timeout: Duration,
    torn_down: bool,
}

impl<T: Transport + 'static, L: EdgeLine> ShutdownModule<T, L> {
    /// Bring the module up. On failure everything acquired so far is
    /// released in reverse order before the error is returned.
    pub fn init<P>(
        config: &ModuleConfig,
        open: impl FnOnce() -> Result<T, TransportError>,
        provider: &mut P,
    ) -> Result<Self, InitError>
    where
        P: LineProvider<Line = L>,
    {
        let transport = open().map_err(InitError::Transport)?;
        let mut module = Self {
            channel: Arc::new(NotificationChannel::open(transport, &config.channel)),
            queue: None,
            notifier: None,
            lines: Vec::with_capacity(config.lines.len()),
            registrar: None,
            drain_timeout: config.drain_timeout,
            torn_down: false,
        };
        if let Err(e) = module.acquire(config, provider) {
            log::error!("init failed: {e}");
            module.stop();
            return Err(e);
        }
        log::info!(
            "shutdown module ready: {} line(s) armed, notices go to {}",
            module.lines.len(),
            module.channel.destination()
        );
        Ok(module)
    }

    fn acquire<P>(&mut self, config: &ModuleConfig, provider: &mut P) -> Result<(), InitError>
    where
        P: LineProvider<Line = L>,
    {
        match config.handshake {
            HandshakeMode::Blocking => self.await_listener(config.handshake_timeout)?,
            HandshakeMode::BroadcastFirst => {
                let reached = self.channel.announce().map_err(InitError::Handshake)?;
                log::info!("announced on group {} ({reached} reached)", self.channel.group());
                self.await_listener(config.handshake_timeout)?;
            }
            HandshakeMode::Background => {}
        }

        let (queue, jobs) = WorkQueue::new(config.queue_depth, config.policy);
        self.queue = Some(queue.clone());
        let notifier = DeferredNotifier::new(self.channel.clone())
            .spawn(jobs)
            .map_err(InitError::Worker)?;
        self.notifier = Some(notifier);

        for spec in &config.lines {
            let line = provider.claim(spec).map_err(|source| InitError::Line {
                spec: spec.clone(),
                source,
            })?;
            log::info!("claimed {spec}");
            self.lines.push(ArmedLine { line, armed: false });
        }

        for slot in &mut self.lines {
            let spec = slot.line.spec().clone();
            slot.line
                .request_irq(InterruptCapture::new(spec.source, queue.clone()))
                .map_err(|source| InitError::Irq {
                    spec: spec.clone(),
                    source,
                })?;
            slot.armed = true;
            log::debug!("interrupt registered for {spec}");
        }

        if config.handshake == HandshakeMode::Background && !self.channel.endpoint().is_registered() {
            self.registrar =
                Some(Registrar::spawn(self.channel.clone()).map_err(InitError::Worker)?);
        }
        Ok(())
    }

    fn await_listener(&self, timeout: Option<Duration>) -> Result<(), InitError> {
        let found = match timeout {
            Some(t) => self
                .channel
                .handshake(RecvWait::Timeout(t))
                .map_err(InitError::Handshake)?,
            None => {
                log::info!("waiting for a listener to register");
                loop {
                    if ssd_core::is_stop_requested() {
                        return Err(InitError::Aborted);
                    }
                    if let Some(id) = self
                        .channel
                        .handshake(RecvWait::Timeout(HANDSHAKE_SLICE))
                        .map_err(InitError::Handshake)?
                    {
                        break Some(id);
                    }
                }
            }
        };
        if found.is_none() {
            log::warn!(
                "no listener registered; notices go to broadcast group {}",
                self.channel.group()
            );
        }
        Ok(())
    }

    pub fn listener(&self) -> Option<ListenerId> {
        self.channel.endpoint().identity().cloned()
    }

    pub fn channel(&self) -> &NotificationChannel<T> {
        &self.channel
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.as_ref().map(|q| q.stats()).unwrap_or_default()
    }

    pub fn notices(&self) -> NotifierStats {
        self.notifier
            .as_ref()
            .map(NotifierHandle::stats)
            .unwrap_or_default()
    }

    /// Unload the module. The transport is released when the last reference
    /// to the channel goes, which is here unless the drain timed out.
    pub fn teardown(mut self) -> TeardownReport {
        self.stop()
    }

    fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            drain: DrainOutcome::Drained,
            jobs: QueueStats::default(),
            notices: NotifierStats::default(),
            lines_released: 0,
        };
        if self.torn_down {
            return report;
        }
        self.torn_down = true;

        for slot in &mut self.lines {
            if slot.armed {
                slot.line.free_irq();
                slot.armed = false;
                log::debug!("interrupt freed for {}", slot.line.spec());
            }
        }

        if let Some(registrar) = self.registrar.take() {
            registrar.stop();
        }

        if let Some(queue) = &self.queue {
            queue.close();
        }
        if let Some(notifier) = self.notifier.take() {
            let (drain, notices) = notifier.join(self.drain_timeout);
            if drain == DrainOutcome::TimedOut {
                log::error!(
                    "deferred work still running after {:?}; closing channel under it",
                    self.drain_timeout
                );
            }
            report.drain = drain;
            report.notices = notices;
        }
        report.jobs = self.queue_stats();

        for slot in self.lines.drain(..).rev() {
            log::info!("released {}", slot.line.spec());
            slot.line.release();
            report.lines_released += 1;
        }

        self.channel.close();
        report
    }
}

impl<T: Transport + 'static, L: EdgeLine> Drop for ShutdownModule<T, L> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use ssd_core::transport::{MemoryBus, MemoryTransport};

    use super::*;
    use crate::lines::{LineEvent, SimulatedLine, SimulatedLines};

    type Module = ShutdownModule<MemoryTransport, SimulatedLine>;

    fn config() -> ModuleConfig {
        ModuleConfig {
            handshake: HandshakeMode::Background,
            ..ModuleConfig::default()
        }
    }

    #[test]
    fn failed_transport_claims_nothing() {
        let mut lines = SimulatedLines::new();
        let err = Module::init(&config(), || Err(TransportError::Closed), &mut lines)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Transport(_)));
        assert!(lines.journal().is_empty());
    }

    #[test]
    fn busy_line_unwinds_earlier_claims() {
        let bus = MemoryBus::new();
        let mut lines = SimulatedLines::new();
        lines.mark_busy(191);

        let err = Module::init(&config(), || Ok(bus.transport()), &mut lines)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Line { .. }));
        assert_eq!(
            lines.journal(),
            vec![LineEvent::Claimed(49), LineEvent::Released(49)]
        );
        assert!(bus.is_released());
    }

    #[test]
    fn irq_failure_frees_registered_handlers() {
        let bus = MemoryBus::new();
        let mut lines = SimulatedLines::new();
        lines.deny_irq(191);

        let err = Module::init(&config(), || Ok(bus.transport()), &mut lines)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Irq { .. }));
        assert_eq!(
            lines.journal(),
            vec![
                LineEvent::Claimed(49),
                LineEvent::Claimed(191),
                LineEvent::IrqRequested(49),
                LineEvent::IrqFreed(49),
                LineEvent::Released(191),
                LineEvent::Released(49),
            ]
        );
    }

    #[test]
    fn teardown_is_reverse_of_init() {
        let bus = MemoryBus::new();
        let mut lines = SimulatedLines::new();
        let module = Module::init(&config(), || Ok(bus.transport()), &mut lines).unwrap();
        let report = module.teardown();

        assert_eq!(report.lines_released, 2);
        assert_eq!(report.drain, DrainOutcome::Drained);
        assert_eq!(
            lines.journal(),
            vec![
                LineEvent::Claimed(49),
                LineEvent::Claimed(191),
                LineEvent::IrqRequested(49),
                LineEvent::IrqRequested(191),
                LineEvent::IrqFreed(49),
                LineEvent::IrqFreed(191),
                LineEvent::Released(191),
                LineEvent::Released(49),
            ]
        );
        assert!(bus.is_released());
    }

    #[test]
    fn dropping_module_tears_down() {
        let bus = MemoryBus::new();
        let mut lines = SimulatedLines::new();
        let module = Module::init(&config(), || Ok(bus.transport()), &mut lines).unwrap();
        drop(module);
        assert!(lines.claimed().is_empty());
        assert!(bus.is_released());
    }

    #[test]
    fn handshake_timeout_falls_back_to_broadcast() {
        let bus = MemoryBus::new();
        let mut lines = SimulatedLines::new();
        let config = ModuleConfig {
            handshake: HandshakeMode::Blocking,
            handshake_timeout: Some(Duration::from_millis(20)),
            ..ModuleConfig::default()
        };
        let module = Module::init(&config, || Ok(bus.transport()), &mut lines).unwrap();
        assert!(module.listener().is_none());
        assert_eq!(lines.claimed(), vec![49, 191]);
    }
}
