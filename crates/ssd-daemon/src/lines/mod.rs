//! Input lines whose rising edges raise the shutdown interrupts

pub mod simulated;
pub mod sysfs;

use std::fmt;
use std::io;

use crate::capture::InterruptCapture;
use crate::event::EventSource;

pub use simulated::{LineEvent, SimulatedLine, SimulatedLines};
pub use sysfs::{SYSFS_GPIO_ROOT, SysfsLine, SysfsLines};

/// GPIO wired to the power-failure detector.
pub const POWER_FAILURE_GPIO: u32 = 49;

/// GPIO wired to the power button.
pub const POWER_BUTTON_GPIO: u32 = 191;

/// One line to claim and what it signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpec {
    pub source: EventSource,
    pub gpio: u32,
}

impl LineSpec {
    pub fn new(source: EventSource, gpio: u32) -> Self {
        Self { source, gpio }
    }
}

impl fmt::Display for LineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio{} ({})", self.gpio, self.source)
    }
}

/// Power-failure and power-button lines on their stock GPIOs.
pub fn default_lines() -> Vec<LineSpec> {
    vec![
        LineSpec::new(EventSource::PowerFailure, POWER_FAILURE_GPIO),
        LineSpec::new(EventSource::PowerButton, POWER_BUTTON_GPIO),
    ]
}

#[derive(Debug)]
pub enum LineError {
    /// Already claimed by someone else.
    Busy(u32),
    /// No such line on this board.
    Invalid(u32),
    /// The line cannot deliver interrupts.
    NoIrq(u32),
    Io { gpio: u32, source: io::Error },
}

impl LineError {
    pub fn io(gpio: u32, source: io::Error) -> Self {
        Self::Io { gpio, source }
    }
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(gpio) => write!(f, "gpio{gpio} is busy"),
            Self::Invalid(gpio) => write!(f, "gpio{gpio} does not exist"),
            Self::NoIrq(gpio) => write!(f, "gpio{gpio} cannot raise interrupts"),
            Self::Io { gpio, source } => write!(f, "gpio{gpio}: {source}"),
        }
    }
}

impl std::error::Error for LineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Source of claimable lines.
pub trait LineProvider {
    type Line: EdgeLine;

    /// Claim `spec` as a rising-edge input.
    fn claim(&mut self, spec: &LineSpec) -> Result<Self::Line, LineError>;
}

/// A claimed line.
pub trait EdgeLine: Send {
    fn spec(&self) -> &LineSpec;

    /// Run `capture` on every rising edge from now on.
    fn request_irq(&mut self, capture: InterruptCapture) -> Result<(), LineError>;

    /// Stop delivering edges. Once this returns the handler is not running
    /// and will never run again.
    fn free_irq(&mut self);

    /// Give the line back.
    fn release(self);
}
