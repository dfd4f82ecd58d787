//! Hardware events observed on the shutdown input lines

use std::fmt;
use std::time::Instant;

/// Which input line raised the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    PowerFailure,
    PowerButton,
}

impl EventSource {
    /// Label used when claiming the line and in logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::PowerFailure => "power failure",
            Self::PowerButton => "power button",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One rising edge. Plain data so the interrupt path can build it without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareEvent {
    pub source: EventSource,
    pub occurred_at: Instant,
}

impl HardwareEvent {
    pub fn now(source: EventSource) -> Self {
        Self {
            source,
            occurred_at: Instant::now(),
        }
    }
}
