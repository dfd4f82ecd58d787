//! SSD Core - Common infrastructure for the safe-shutdown pipeline
//!
//! This crate provides the wire protocol and the transports shared by the
//! privileged daemon and the unprivileged shutdown agent, plus the logging
//! and signal plumbing both binaries use.

pub mod error;
pub mod logging;
pub mod protocol;
pub mod signals;
pub mod transport;

// Re-exports for convenience
pub use error::TransportError;
pub use logging::init_logging;
pub use protocol::{
    BROADCAST_GROUP, Envelope, FrameCodec, HELLO, MAX_PAYLOAD, PROTOCOL, ProtocolError, SHUTDOWN,
};
pub use signals::{install_stop_handlers, is_stop_requested, request_stop, stop_flag};
pub use transport::{AgentSocket, ListenerId, Received, RecvWait, Transport};
