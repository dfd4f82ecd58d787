//! SSD Agent - Unprivileged half of the safe-shutdown pipeline
//!
//! Registers with the daemon, waits for the `Shutdown` notification and
//! then runs a [`ShutdownAction`].

pub mod action;
pub mod agent;

pub use action::{
    ActionError, ActionKind, CommandAction, DirectHalt, DryRun, ShutdownAction, SignalInit,
};
pub use agent::{AgentError, AgentState, ShutdownAgent};
