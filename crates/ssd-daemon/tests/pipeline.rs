//! End-to-end behaviour of the interrupt -> worker -> channel pipeline
//!
//! Uses the in-process bus and simulated lines so every send and every line
//! operation is journaled.

use std::thread;
use std::time::{Duration, Instant};

use ssd_core::protocol::{BROADCAST_GROUP, FrameCodec, HELLO, SHUTDOWN};
use ssd_core::transport::{BusEvent, MemoryBus, MemoryTransport, Route};
use ssd_core::{AgentSocket, TransportError};
use ssd_daemon::lines::{LineEvent, POWER_BUTTON_GPIO, POWER_FAILURE_GPIO, SimulatedLine};
use ssd_daemon::{
    DrainOutcome, HandshakeMode, InitError, IrqReturn, ModuleConfig, ShutdownModule,
    SimulatedLines, WorkPolicy,
};

type Module = ShutdownModule<MemoryTransport, SimulatedLine>;

const WAIT: Duration = Duration::from_secs(3);

fn background() -> ModuleConfig {
    ModuleConfig {
        handshake: HandshakeMode::Background,
        ..ModuleConfig::default()
    }
}

fn start(bus: &MemoryBus, lines: &mut SimulatedLines, config: &ModuleConfig) -> Module {
    Module::init(config, || Ok(bus.transport()), lines).unwrap()
}

fn hello(pid: u32) -> Vec<u8> {
    let codec = FrameCodec::default();
    codec.encode(&codec.envelope(pid, HELLO)).unwrap()
}

#[test]
fn events_without_listener_are_broadcast() {
    let bus = MemoryBus::new();
    let mut lines = SimulatedLines::new();
    let module = start(&bus, &mut lines, &background());
    let member = bus.subscriber(900, BROADCAST_GROUP);

    for _ in 0..3 {
        assert_eq!(lines.fire(POWER_FAILURE_GPIO), Some(IrqReturn::Handled));
    }
    assert!(bus.wait_for_sends(3, WAIT));

    let sent = bus.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(route, _)| *route == Route::Broadcast(BROADCAST_GROUP)));

    let codec = FrameCodec::default();
    let mut buf = [0u8; 64];
    let n = member.recv(&mut buf).unwrap();
    let env = codec.decode(&buf[..n]).unwrap();
    assert_eq!(env.payload, SHUTDOWN);
    assert_eq!(env.pid, 0);

    let report = module.teardown();
    assert_eq!(report.notices.broadcast, 3);
    assert_eq!(report.notices.dropped, 0);
}

#[test]
fn hello_then_button_unicasts_shutdown() {
    let bus = MemoryBus::new();
    let mut lines = SimulatedLines::new();
    let agent = bus.agent(4242);
    agent.send(&hello(4242)).unwrap();

    let config = ModuleConfig {
        handshake_timeout: Some(WAIT),
        ..ModuleConfig::default()
    };
    let module = start(&bus, &mut lines, &config);
    assert_eq!(module.listener().as_ref(), Some(agent.id()));

    lines.fire(POWER_BUTTON_GPIO);
    let mut buf = [0u8; 64];
    let n = agent.recv(&mut buf).unwrap();
    let env = FrameCodec::default().decode(&buf[..n]).unwrap();
    assert_eq!(env.payload, SHUTDOWN);
    assert_eq!(env.pid, 4242);
    assert_eq!(bus.sent()[0].0, Route::Unicast(agent.id().clone()));

    assert_eq!(module.teardown().notices.unicast, 1);
}

#[test]
fn interrupt_context_does_not_wait_for_stalled_worker() {
    let bus = MemoryBus::new();
    bus.set_send_delay(Duration::from_secs(1));
    let mut lines = SimulatedLines::new();
    let config = ModuleConfig {
        queue_depth: 2,
        drain_timeout: Duration::from_millis(50),
        ..background()
    };
    let module = start(&bus, &mut lines, &config);

    let start = Instant::now();
    for _ in 0..100 {
        assert_eq!(lines.fire(POWER_FAILURE_GPIO), Some(IrqReturn::Handled));
    }
    assert!(start.elapsed() < Duration::from_millis(500));

    let stats = module.queue_stats();
    assert!(stats.scheduled <= 3);
    assert_eq!(stats.scheduled + stats.rejected, 100);

    assert_eq!(module.teardown().drain, DrainOutcome::TimedOut);
}

#[test]
fn teardown_waits_for_in_flight_notice() {
    let bus = MemoryBus::new();
    bus.set_send_delay(Duration::from_millis(200));
    let mut lines = SimulatedLines::new();
    let module = start(&bus, &mut lines, &background());

    lines.fire(POWER_BUTTON_GPIO);
    let report = module.teardown();
    assert_eq!(report.drain, DrainOutcome::Drained);

    // Send completed before the transport went away
    let journal = bus.journal();
    assert!(matches!(
        journal.as_slice(),
        [BusEvent::Sent { .. }, BusEvent::TransportReleased]
    ));

    // No handler ran after lines started going away
    let events = lines.journal();
    let last_free = events
        .iter()
        .rposition(|e| matches!(e, LineEvent::IrqFreed(_)))
        .unwrap();
    let first_release = events
        .iter()
        .position(|e| matches!(e, LineEvent::Released(_)))
        .unwrap();
    assert!(last_free < first_release);
    assert_eq!(lines.fire(POWER_BUTTON_GPIO), None);
}

#[test]
fn drain_timeout_closes_channel_under_running_job() {
    let bus = MemoryBus::new();
    bus.set_send_delay(Duration::from_millis(300));
    let mut lines = SimulatedLines::new();
    let config = ModuleConfig {
        drain_timeout: Duration::from_millis(50),
        ..background()
    };
    let module = start(&bus, &mut lines, &config);

    lines.fire(POWER_FAILURE_GPIO);
    lines.fire(POWER_FAILURE_GPIO);
    let report = module.teardown();
    assert_eq!(report.drain, DrainOutcome::TimedOut);
    assert!(lines.claimed().is_empty());

    // The worker still holds the transport until its last job ends
    let deadline = Instant::now() + WAIT;
    while !bus.is_released() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(bus.is_released());
    // Second job found the channel closed
    assert_eq!(bus.sent().len(), 1);
}

#[test]
fn double_press_during_job_sends_twice() {
    let bus = MemoryBus::new();
    bus.set_send_delay(Duration::from_millis(100));
    let mut lines = SimulatedLines::new();
    let module = start(&bus, &mut lines, &background());

    lines.fire(POWER_BUTTON_GPIO);
    lines.fire(POWER_BUTTON_GPIO);
    assert!(bus.wait_for_sends(2, WAIT));
    assert_eq!(module.teardown().notices.broadcast, 2);
}

#[test]
fn coalescing_folds_presses_while_job_waits() {
    let bus = MemoryBus::new();
    bus.set_send_delay(Duration::from_millis(300));
    let mut lines = SimulatedLines::new();
    let config = ModuleConfig {
        policy: WorkPolicy::Coalesce,
        ..background()
    };
    let module = start(&bus, &mut lines, &config);

    lines.fire(POWER_BUTTON_GPIO);
    // First job is now running inside the send delay
    thread::sleep(Duration::from_millis(100));
    lines.fire(POWER_BUTTON_GPIO);
    lines.fire(POWER_BUTTON_GPIO);

    let report = module.teardown();
    assert_eq!(report.jobs.scheduled, 2);
    assert_eq!(report.jobs.coalesced, 1);
    assert_eq!(bus.sent().len(), 2);
}

#[test]
fn background_handshake_switches_to_unicast() {
    let bus = MemoryBus::new();
    let mut lines = SimulatedLines::new();
    let module = start(&bus, &mut lines, &background());

    lines.fire(POWER_FAILURE_GPIO);
    assert!(bus.wait_for_sends(1, WAIT));
    assert_eq!(bus.sent()[0].0, Route::Broadcast(BROADCAST_GROUP));

    let agent = bus.agent(77);
    agent.send(&hello(77)).unwrap();
    let deadline = Instant::now() + WAIT;
    while module.listener().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(module.listener().as_ref(), Some(agent.id()));

    lines.fire(POWER_FAILURE_GPIO);
    assert!(bus.wait_for_sends(2, WAIT));
    assert_eq!(bus.sent()[1].0, Route::Unicast(agent.id().clone()));
}

#[test]
fn broadcast_first_announces_before_waiting() {
    let bus = MemoryBus::new();
    let member = bus.subscriber(5, BROADCAST_GROUP);
    let mut lines = SimulatedLines::new();
    let config = ModuleConfig {
        handshake: HandshakeMode::BroadcastFirst,
        handshake_timeout: Some(Duration::from_millis(20)),
        ..ModuleConfig::default()
    };
    let _module = start(&bus, &mut lines, &config);

    let mut buf = [0u8; 64];
    let n = member.recv(&mut buf).unwrap();
    assert_eq!(FrameCodec::default().decode(&buf[..n]).unwrap().payload, "");
}

#[test]
fn transport_failure_claims_no_lines() {
    let mut lines = SimulatedLines::new();
    let result = Module::init(
        &background(),
        || Err(TransportError::Io(std::io::Error::other("no family"))),
        &mut lines,
    );
    assert!(matches!(result, Err(InitError::Transport(_))));
    assert!(lines.journal().is_empty());
}

#[cfg(target_os = "linux")]
mod unix {
    use ssd_core::transport::{UnixAgentSocket, UnixTransport};

    use super::*;

    #[test]
    fn hello_then_failure_over_unix_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let server = dir.path().join("ssd.sock");
        let groups = dir.path().join("groups");
        let mut lines = SimulatedLines::new();

        let config = ModuleConfig {
            handshake_timeout: Some(WAIT),
            ..ModuleConfig::default()
        };
        let agent_thread = {
            let server = server.clone();
            let local = dir.path().join("agents/agent.sock");
            thread::spawn(move || {
                // Wait for the daemon socket to appear
                let deadline = Instant::now() + WAIT;
                while !server.exists() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                let agent = UnixAgentSocket::bind(local, &server).unwrap();
                agent.send(&hello(0)).unwrap();
                let mut buf = [0u8; 64];
                let n = agent.recv(&mut buf).unwrap();
                FrameCodec::default().decode(&buf[..n]).unwrap().payload.to_string()
            })
        };

        let module = ShutdownModule::<UnixTransport, SimulatedLine>::init(
            &config,
            || UnixTransport::bind(&server, &groups),
            &mut lines,
        )
        .unwrap();
        assert_eq!(module.listener().unwrap().pid, std::process::id());

        lines.fire(POWER_FAILURE_GPIO);
        assert_eq!(agent_thread.join().unwrap(), SHUTDOWN);
        module.teardown();
        assert!(!server.exists());
    }

    #[test]
    fn unbindable_socket_claims_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let mut lines = SimulatedLines::new();

        let result = ShutdownModule::<UnixTransport, SimulatedLine>::init(
            &background(),
            || UnixTransport::bind(blocker.join("ssd.sock"), dir.path().join("groups")),
            &mut lines,
        );
        assert!(matches!(result, Err(InitError::Transport(_))));
        assert!(lines.journal().is_empty());
    }
}
