//! Datagram transports carrying envelopes between the daemon and agents.
//!
//! [`Transport`] is the privileged end (one per daemon), [`AgentSocket`] the
//! unprivileged end (one per agent). Two implementations exist: Unix
//! datagram sockets for real deployments and an in-process bus for tests.

pub mod memory;
pub mod unix;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TransportError;

pub use memory::{BusEvent, MemoryAgentSocket, MemoryBus, MemoryTransport, Route};
pub use unix::{UnixAgentSocket, UnixTransport, group_dir};

/// Addressable identity of a listener, taken from transport credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub pid: u32,
    pub addr: PathBuf,
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} at {}", self.pid, self.addr.display())
    }
}

/// How long a privileged receive may wait for a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvWait {
    Forever,
    Timeout(Duration),
    NoWait,
}

/// Metadata of one datagram received on the privileged end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the caller's buffer.
    pub len: usize,
    pub sender: ListenerId,
}

/// Privileged end of the channel.
///
/// Sends never wait for a slow or absent receiver: a full receiver queue is
/// reported as [`TransportError::WouldBlock`].
pub trait Transport: Send + Sync {
    /// Receive one datagram. `Ok(None)` means nothing arrived within `wait`.
    fn recv(&self, buf: &mut [u8], wait: RecvWait) -> Result<Option<Received>, TransportError>;

    fn unicast(&self, to: &ListenerId, frame: &[u8]) -> Result<(), TransportError>;

    /// Send to every member of `group`, returning how many were reached.
    fn broadcast(&self, group: u32, frame: &[u8]) -> Result<usize, TransportError>;
}

/// Unprivileged end of the channel, talking only to the daemon.
pub trait AgentSocket {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Block until a datagram arrives; returns the number of bytes read.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}
