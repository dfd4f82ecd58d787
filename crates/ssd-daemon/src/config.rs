//! Parameters of one [`ShutdownModule`](crate::ShutdownModule) instance

use std::time::Duration;

use serde::Deserialize;

use crate::channel::ChannelConfig;
use crate::lines::{LineSpec, default_lines};
use crate::work_queue::WorkPolicy;

pub const DEFAULT_QUEUE_DEPTH: usize = 16;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// When the listener handshake happens relative to interrupt registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeMode {
    /// Wait for a listener before claiming any line.
    #[default]
    Blocking,
    /// Announce on the broadcast group, then wait as in `Blocking`.
    BroadcastFirst,
    /// Arm the lines at once; a background thread accepts the listener.
    Background,
}

#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub lines: Vec<LineSpec>,
    pub channel: ChannelConfig,
    pub queue_depth: usize,
    pub policy: WorkPolicy,
    pub handshake: HandshakeMode,
    /// `None` waits until a listener shows up or a stop is requested.
    pub handshake_timeout: Option<Duration>,
    pub drain_timeout: Duration,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            lines: default_lines(),
            channel: ChannelConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            policy: WorkPolicy::default(),
            handshake: HandshakeMode::default(),
            handshake_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}
