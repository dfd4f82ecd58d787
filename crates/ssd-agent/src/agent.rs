//! Listener state machine
//!
//! ```text
//! Unregistered --register--> Listening --"Shutdown"--> ShuttingDown
//!                                 |
//!                                 +--receive error--> Failed
//! ```
//!
//! The agent never reconnects: a receive error is final.

use std::fmt;

use ssd_core::protocol::{FrameCodec, HELLO, ProtocolError, SHUTDOWN};
use ssd_core::{AgentSocket, TransportError};

use crate::action::{ActionError, ShutdownAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Listening,
    ShuttingDown,
    Failed,
}

#[derive(Debug)]
pub enum AgentError {
    Encode(ProtocolError),
    Register(TransportError),
    Receive(TransportError),
    Action(ActionError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encoding handshake: {e}"),
            Self::Register(e) => write!(f, "sending handshake: {e}"),
            Self::Receive(e) => write!(f, "receiving notification: {e}"),
            Self::Action(e) => write!(f, "shutdown action: {e}"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Register(e) | Self::Receive(e) => Some(e),
            Self::Action(e) => Some(e),
        }
    }
}

pub struct ShutdownAgent<S, A> {
    socket: S,
    action: A,
    codec: FrameCodec,
    hello: String,
    pid: u32,
    state: AgentState,
}

impl<S: AgentSocket, A: ShutdownAction> ShutdownAgent<S, A> {
    pub fn new(socket: S, action: A) -> Self {
        Self {
            socket,
            action,
            codec: FrameCodec::default(),
            hello: HELLO.to_string(),
            pid: std::process::id(),
            state: AgentState::Unregistered,
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Handshake payload. Empty means listen without registering, relying
    /// on broadcasts only.
    pub fn with_hello(mut self, hello: impl Into<String>) -> Self {
        self.hello = hello.into();
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    /// Send the handshake and start listening.
    pub fn register(&mut self) -> Result<(), AgentError> {
        if self.hello.is_empty() {
            log::info!("listening for broadcasts without registering");
        } else {
            let frame = self
                .codec
                .encode(&self.codec.envelope(self.pid, &self.hello))
                .map_err(AgentError::Encode)?;
            if let Err(e) = self.socket.send(&frame) {
                self.state = AgentState::Failed;
                return Err(AgentError::Register(e));
            }
            log::info!("registered with daemon as pid {}", self.pid);
        }
        self.state = AgentState::Listening;
        Ok(())
    }

    /// Block until a `Shutdown` notification arrives, then run the action.
    pub fn listen(&mut self) -> Result<(), AgentError> {
        let mut buf = vec![0u8; self.codec.max_frame_len()];
        loop {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    self.state = AgentState::Failed;
                    log::error!("receive failed: {e}");
                    return Err(AgentError::Receive(e));
                }
            };
            let env = match self.codec.decode(&buf[..n]) {
                Ok(env) => env,
                Err(e) => {
                    log::warn!("ignoring undecodable frame: {e}");
                    continue;
                }
            };
            if env.kind != self.codec.protocol() {
                log::warn!("ignoring frame of foreign kind {}", env.kind);
                continue;
            }

            log::info!("received: {:?}", env.payload);
            if env.payload == SHUTDOWN {
                break;
            }
        }

        self.state = AgentState::ShuttingDown;
        log::warn!("shutdown requested; running {}", self.action.name());
        self.action.power_off().map_err(AgentError::Action)
    }

    /// Register, then listen.
    pub fn run(&mut self) -> Result<(), AgentError> {
        self.register()?;
        self.listen()
    }
}
