//! Privileged end of the notification channel
//!
//! Owns the transport, records which listener registered through the
//! handshake and decides where each notification goes: the registered
//! listener if there is one, the broadcast group otherwise.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ssd_core::protocol::{BROADCAST_GROUP, FrameCodec, MAX_PAYLOAD, PROTOCOL, SHUTDOWN};
use ssd_core::{ListenerId, RecvWait, Transport, TransportError};

/// Delivery guarantee of every notification the channel sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// One attempt, no acknowledgement, no retry.
    AtMostOnce,
}

/// Channel parameters agreed on out of band with the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub protocol: u16,
    pub group: u32,
    pub max_payload: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL,
            group: BROADCAST_GROUP,
            max_payload: MAX_PAYLOAD,
        }
    }
}

/// Where a notification is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Unicast(ListenerId),
    Broadcast(u32),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast(id) => write!(f, "{id}"),
            Self::Broadcast(group) => write!(f, "broadcast group {group}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Shutdown,
}

impl MessageKind {
    pub fn payload(self) -> &'static str {
        match self {
            Self::Shutdown => SHUTDOWN,
        }
    }
}

/// One outgoing notification before it is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub kind: MessageKind,
    pub destination: Destination,
}

impl NotificationMessage {
    pub fn shutdown(destination: Destination) -> Self {
        Self {
            kind: MessageKind::Shutdown,
            destination,
        }
    }

    pub fn payload(&self) -> &'static str {
        self.kind.payload()
    }

    /// Header pid: the destination's pid for unicast, 0 for broadcast.
    pub fn header_pid(&self) -> u32 {
        match &self.destination {
            Destination::Unicast(id) => id.pid,
            Destination::Broadcast(_) => 0,
        }
    }
}

/// Listener identity captured by the handshake. Written at most once.
#[derive(Debug, Default)]
pub struct ChannelEndpoint {
    listener: OnceLock<ListenerId>,
}

impl ChannelEndpoint {
    pub fn identity(&self) -> Option<&ListenerId> {
        self.listener.get()
    }

    pub fn is_registered(&self) -> bool {
        self.listener.get().is_some()
    }

    /// Record `id`. Returns the identity that ends up registered.
    fn seal(&self, id: ListenerId) -> &ListenerId {
        let stored = self.listener.get_or_init(|| id.clone());
        if *stored != id {
            log::warn!("listener already registered as {stored}; ignoring {id}");
        }
        stored
    }
}

/// Notification channel bound to one transport.
pub struct NotificationChannel<T> {
    transport: T,
    codec: FrameCodec,
    group: u32,
    endpoint: ChannelEndpoint,
    closed: AtomicBool,
}

impl<T: Transport> NotificationChannel<T> {
    pub fn open(transport: T, config: &ChannelConfig) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(config.protocol, config.max_payload),
            group: config.group,
            endpoint: ChannelEndpoint::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::AtMostOnce
    }

    /// Wait up to `wait` for a listener to register.
    ///
    /// Handshakes already queued when the first one is read are drained too,
    /// and the last of them wins. After that the identity is fixed: later
    /// calls return it without reading the transport.
    pub fn handshake(&self, wait: RecvWait) -> Result<Option<ListenerId>, TransportError> {
        if let Some(id) = self.endpoint.identity() {
            return Ok(Some(id.clone()));
        }
        let mut buf = vec![0u8; self.codec.max_frame_len()];
        let Some(mut winner) = self.recv_registration(&mut buf, wait)? else {
            return Ok(None);
        };
        while let Some(next) = self.recv_registration(&mut buf, RecvWait::NoWait)? {
            log::warn!("listener {winner} superseded by {next}");
            winner = next;
        }

        let id = self.endpoint.seal(winner).clone();
        log::info!("registered listener {id}");
        Ok(Some(id))
    }

    fn recv_registration(
        &self,
        buf: &mut [u8],
        wait: RecvWait,
    ) -> Result<Option<ListenerId>, TransportError> {
        let deadline = match wait {
            RecvWait::Timeout(t) => Some(Instant::now() + t),
            _ => None,
        };
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    RecvWait::Timeout(deadline - now)
                }
                None => wait,
            };
            let received = match self.transport.recv(buf, wait) {
                Ok(Some(received)) => received,
                Ok(None) if wait == RecvWait::Forever => continue,
                Ok(None) => return Ok(None),
                Err(TransportError::Anonymous) => {
                    log::warn!("ignoring handshake without sender credentials");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let sender = received.sender;
            match self.codec.decode(&buf[..received.len]) {
                Ok(env) if env.payload.is_empty() => {
                    log::warn!("ignoring empty handshake from {sender}");
                }
                Ok(env) => {
                    log::info!("handshake from {sender}: {}", env.payload);
                    if env.pid != 0 && env.pid != sender.pid {
                        log::debug!(
                            "handshake header claims pid {}; using credentials pid {}",
                            env.pid,
                            sender.pid
                        );
                    }
                    return Ok(Some(sender));
                }
                Err(e) => log::warn!("ignoring malformed handshake from {sender}: {e}"),
            }
        }
    }

    /// Broadcast an empty frame so subscribed agents know the daemon is up.
    pub fn announce(&self) -> Result<usize, TransportError> {
        let frame = self
            .codec
            .encode(&self.codec.envelope(0, ""))
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        self.submit(&Destination::Broadcast(self.group), &frame)
    }

    /// Current destination for notifications.
    pub fn destination(&self) -> Destination {
        match self.endpoint.identity() {
            Some(id) => Destination::Unicast(id.clone()),
            None => Destination::Broadcast(self.group),
        }
    }

    /// Hand one framed notification to the transport without waiting.
    /// Returns how many listeners it reached.
    pub fn submit(&self, to: &Destination, frame: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match to {
            Destination::Unicast(id) => self.transport.unicast(id, frame).map(|()| 1),
            Destination::Broadcast(group) => self.transport.broadcast(*group, frame),
        }
    }

    /// Refuse every later submit. The transport itself is released on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("notification channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ssd_core::AgentSocket;
    use ssd_core::protocol::HELLO;
    use ssd_core::transport::{MemoryBus, Route};

    use super::*;

    fn hello(codec: &FrameCodec, pid: u32) -> Vec<u8> {
        codec.encode(&codec.envelope(pid, HELLO)).unwrap()
    }

    fn open(bus: &MemoryBus) -> NotificationChannel<ssd_core::transport::MemoryTransport> {
        NotificationChannel::open(bus.transport(), &ChannelConfig::default())
    }

    #[test]
    fn unregistered_channel_broadcasts() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        assert_eq!(channel.destination(), Destination::Broadcast(BROADCAST_GROUP));
        assert!(!channel.endpoint().is_registered());
    }

    #[test]
    fn handshake_registers_sender_credentials() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let agent = bus.agent(300);
        // Header pid is ignored in favour of the transport's view
        agent.send(&hello(channel.codec(), 9999)).unwrap();

        let id = channel.handshake(RecvWait::NoWait).unwrap().unwrap();
        assert_eq!(id, *agent.id());
        assert_eq!(channel.destination(), Destination::Unicast(id));
    }

    #[test]
    fn handshake_times_out_without_listener() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let got = channel
            .handshake(RecvWait::Timeout(Duration::from_millis(20)))
            .unwrap();
        assert!(got.is_none());
        assert!(!channel.endpoint().is_registered());
    }

    #[test]
    fn last_queued_registrant_wins() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let first = bus.agent(1);
        let second = bus.agent(2);
        first.send(&hello(channel.codec(), 1)).unwrap();
        second.send(&hello(channel.codec(), 2)).unwrap();

        let id = channel.handshake(RecvWait::NoWait).unwrap().unwrap();
        assert_eq!(id, *second.id());
    }

    #[test]
    fn identity_is_fixed_after_registration() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let first = bus.agent(1);
        first.send(&hello(channel.codec(), 1)).unwrap();
        channel.handshake(RecvWait::NoWait).unwrap();

        let late = bus.agent(2);
        late.send(&hello(channel.codec(), 2)).unwrap();
        let id = channel.handshake(RecvWait::NoWait).unwrap().unwrap();
        assert_eq!(id, *first.id());
    }

    #[test]
    fn malformed_and_empty_handshakes_are_skipped() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let noisy = bus.agent(5);
        let good = bus.agent(6);
        noisy.send(b"junk").unwrap();
        noisy
            .send(&channel.codec().encode(&channel.codec().envelope(5, "")).unwrap())
            .unwrap();
        good.send(&hello(channel.codec(), 6)).unwrap();

        let id = channel.handshake(RecvWait::NoWait).unwrap().unwrap();
        assert_eq!(id, *good.id());
    }

    #[test]
    fn submit_after_close_is_refused() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        channel.close();
        let err = channel
            .submit(&Destination::Broadcast(1), b"frame")
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn failed_unicast_is_not_retried() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let agent = bus.agent(8);
        agent.send(&hello(channel.codec(), 8)).unwrap();
        let id = channel.handshake(RecvWait::NoWait).unwrap().unwrap();
        drop(agent);

        assert_eq!(channel.delivery_policy(), DeliveryPolicy::AtMostOnce);
        let err = channel
            .submit(&Destination::Unicast(id.clone()), b"frame")
            .unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(bus.sent(), vec![(Route::Unicast(id), b"frame".to_vec())]);
    }

    #[test]
    fn announce_broadcasts_empty_frame() {
        let bus = MemoryBus::new();
        let channel = open(&bus);
        let member = bus.subscriber(4, BROADCAST_GROUP);
        assert_eq!(channel.announce().unwrap(), 1);

        let mut buf = [0u8; 64];
        let n = member.recv(&mut buf).unwrap();
        assert_eq!(channel.codec().decode(&buf[..n]).unwrap().payload, "");
    }

    #[test]
    fn shutdown_message_header_pid() {
        let id = ListenerId {
            pid: 77,
            addr: "mem/agent-77".into(),
        };
        assert_eq!(
            NotificationMessage::shutdown(Destination::Unicast(id)).header_pid(),
            77
        );
        let msg = NotificationMessage::shutdown(Destination::Broadcast(1));
        assert_eq!(msg.header_pid(), 0);
        assert_eq!(msg.payload(), SHUTDOWN);
    }
}
