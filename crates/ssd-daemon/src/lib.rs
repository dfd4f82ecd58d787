//! SSD Daemon - Privileged half of the safe-shutdown pipeline
//!
//! An edge on a power-failure or power-button line runs an
//! [`InterruptCapture`] in interrupt context, which only schedules a job.
//! The [`DeferredNotifier`] thread turns each job into a `Shutdown`
//! notification and hands it to the [`NotificationChannel`]: unicast to the
//! listener that registered through the handshake, or broadcast to the
//! shutdown group when nobody has. [`ShutdownModule`] owns the whole
//! pipeline and tears it down in reverse order.

pub mod capture;
pub mod channel;
pub mod config;
pub mod event;
pub mod lines;
pub mod module;
pub mod notifier;
pub mod work_queue;

pub use capture::{InterruptCapture, IrqReturn};
pub use channel::{
    ChannelConfig, ChannelEndpoint, DeliveryPolicy, Destination, MessageKind,
    NotificationChannel, NotificationMessage,
};
pub use config::{HandshakeMode, ModuleConfig};
pub use event::{EventSource, HardwareEvent};
pub use lines::{EdgeLine, LineError, LineProvider, LineSpec, SimulatedLines, SysfsLines};
pub use module::{InitError, ShutdownModule, TeardownReport};
pub use notifier::{DeferredNotifier, DrainOutcome, NotifierStats, NotifyError};
pub use work_queue::{QueueStats, Schedule, WorkPolicy, WorkQueue};
