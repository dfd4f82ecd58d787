//! In-process datagram bus implementing both ends of the channel.
//!
//! Backs the tests. Every privileged send is recorded in a journal, so
//! callers can assert on what was attempted and what actually reached a
//! listener.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{AgentSocket, ListenerId, Received, RecvWait, Transport};
use crate::error::TransportError;

/// Default number of undelivered frames an inbox holds before sends fail.
const INBOX_CAPACITY: usize = 64;

/// Where a privileged send was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Unicast(ListenerId),
    Broadcast(u32),
}

/// Journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Sent {
        route: Route,
        frame: Vec<u8>,
        reached: usize,
    },
    TransportReleased,
}

fn agent_addr(pid: u32) -> PathBuf {
    PathBuf::from(format!("mem/agent-{pid}"))
}

struct Inbox {
    frames: VecDeque<Vec<u8>>,
    group: Option<u32>,
    severed: bool,
}

#[derive(Default)]
struct BusState {
    uplink: VecDeque<(Vec<u8>, ListenerId)>,
    inboxes: HashMap<PathBuf, Inbox>,
    journal: Vec<BusEvent>,
    send_delay: Duration,
    inbox_capacity: usize,
}

struct Shared {
    state: Mutex<BusState>,
    changed: Condvar,
}

/// Handle to a shared bus. Clones refer to the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_inbox_capacity(INBOX_CAPACITY)
    }

    pub fn with_inbox_capacity(inbox_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState {
                    inbox_capacity,
                    ..BusState::default()
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Privileged endpoint. Dropping it records [`BusEvent::TransportReleased`].
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { bus: self.clone() }
    }

    /// Agent endpoint that only receives unicasts.
    pub fn agent(&self, pid: u32) -> MemoryAgentSocket {
        self.attach(pid, None)
    }

    /// Agent endpoint that is also a member of broadcast group `group`.
    pub fn subscriber(&self, pid: u32, group: u32) -> MemoryAgentSocket {
        self.attach(pid, Some(group))
    }

    fn attach(&self, pid: u32, group: Option<u32>) -> MemoryAgentSocket {
        let id = ListenerId {
            pid,
            addr: agent_addr(pid),
        };
        self.state().inboxes.insert(
            id.addr.clone(),
            Inbox {
                frames: VecDeque::new(),
                group,
                severed: false,
            },
        );
        MemoryAgentSocket {
            bus: self.clone(),
            id,
        }
    }

    /// Make every later receive on `pid`'s socket fail with `Closed`.
    pub fn sever(&self, pid: u32) {
        if let Some(inbox) = self.state().inboxes.get_mut(&agent_addr(pid)) {
            inbox.severed = true;
        }
        self.shared.changed.notify_all();
    }

    /// Stall every privileged send by `delay` before it is delivered.
    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = delay;
    }

    /// Inject a datagram on the uplink as if `sender` had sent it.
    pub fn inject(&self, sender: ListenerId, frame: &[u8]) {
        self.state().uplink.push_back((frame.to_vec(), sender));
        self.shared.changed.notify_all();
    }

    pub fn journal(&self) -> Vec<BusEvent> {
        self.state().journal.clone()
    }

    /// Privileged sends in the order they were attempted.
    pub fn sent(&self) -> Vec<(Route, Vec<u8>)> {
        self.state()
            .journal
            .iter()
            .filter_map(|e| match e {
                BusEvent::Sent { route, frame, .. } => Some((route.clone(), frame.clone())),
                BusEvent::TransportReleased => None,
            })
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.state()
            .journal
            .iter()
            .any(|e| matches!(e, BusEvent::TransportReleased))
    }

    /// Block until at least `count` sends were attempted or `timeout` elapses.
    pub fn wait_for_sends(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            let sends = state
                .journal
                .iter()
                .filter(|e| matches!(e, BusEvent::Sent { .. }))
                .count();
            if sends >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn record(&self, state: &mut BusState, route: Route, frame: &[u8], reached: usize) {
        state.journal.push(BusEvent::Sent {
            route,
            frame: frame.to_vec(),
            reached,
        });
        self.shared.changed.notify_all();
    }

    fn delay(&self) {
        let delay = self.state().send_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Privileged end of a [`MemoryBus`].
pub struct MemoryTransport {
    bus: MemoryBus,
}

impl Transport for MemoryTransport {
    fn recv(&self, buf: &mut [u8], wait: RecvWait) -> Result<Option<Received>, TransportError> {
        let deadline = match wait {
            RecvWait::Timeout(t) => Some(Instant::now() + t),
            _ => None,
        };
        let mut state = self.bus.state();
        loop {
            if let Some((frame, sender)) = state.uplink.pop_front() {
                // Datagram semantics: excess bytes are discarded
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                return Ok(Some(Received { len, sender }));
            }
            match (wait, deadline) {
                (RecvWait::NoWait, _) => return Ok(None),
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    state = self
                        .bus
                        .shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                _ => {
                    state = self
                        .bus
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn unicast(&self, to: &ListenerId, frame: &[u8]) -> Result<(), TransportError> {
        self.bus.delay();
        let mut state = self.bus.state();
        let capacity = state.inbox_capacity;
        let outcome = match state.inboxes.get_mut(&to.addr) {
            Some(inbox) if inbox.severed => Err(TransportError::Unreachable(to.addr.clone())),
            Some(inbox) if inbox.frames.len() >= capacity => Err(TransportError::WouldBlock),
            Some(inbox) => {
                inbox.frames.push_back(frame.to_vec());
                Ok(())
            }
            None => Err(TransportError::Unreachable(to.addr.clone())),
        };
        let reached = usize::from(outcome.is_ok());
        self.bus
            .record(&mut state, Route::Unicast(to.clone()), frame, reached);
        outcome
    }

    fn broadcast(&self, group: u32, frame: &[u8]) -> Result<usize, TransportError> {
        self.bus.delay();
        let mut state = self.bus.state();
        let capacity = state.inbox_capacity;
        let mut reached = 0;
        for inbox in state.inboxes.values_mut() {
            if inbox.group == Some(group) && !inbox.severed && inbox.frames.len() < capacity {
                inbox.frames.push_back(frame.to_vec());
                reached += 1;
            }
        }
        self.bus
            .record(&mut state, Route::Broadcast(group), frame, reached);
        Ok(reached)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.bus.state();
        state.journal.push(BusEvent::TransportReleased);
        self.bus.shared.changed.notify_all();
    }
}

/// Agent end of a [`MemoryBus`].
pub struct MemoryAgentSocket {
    bus: MemoryBus,
    id: ListenerId,
}

impl MemoryAgentSocket {
    /// Identity the privileged side will see for this socket.
    pub fn id(&self) -> &ListenerId {
        &self.id
    }
}

impl AgentSocket for MemoryAgentSocket {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.bus.state();
        if state.inboxes.get(&self.id.addr).is_none_or(|i| i.severed) {
            return Err(TransportError::Closed);
        }
        state.uplink.push_back((frame.to_vec(), self.id.clone()));
        self.bus.shared.changed.notify_all();
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.bus.state();
        loop {
            let Some(inbox) = state.inboxes.get_mut(&self.id.addr) else {
                return Err(TransportError::Closed);
            };
            if inbox.severed {
                return Err(TransportError::Closed);
            }
            if let Some(frame) = inbox.frames.pop_front() {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                return Ok(len);
            }
            state = self
                .bus
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for MemoryAgentSocket {
    fn drop(&mut self) {
        self.bus.state().inboxes.remove(&self.id.addr);
    }
}
