//! What the agent does once told to shut down

use std::fmt;
use std::io;
use std::process::{Command, ExitStatus};

use nix::errno::Errno;
use serde::Deserialize;

pub const DEFAULT_COMMAND: &str = "systemctl poweroff";

#[derive(Debug)]
pub enum ActionError {
    Spawn { command: String, source: io::Error },
    Status { command: String, status: ExitStatus },
    Signal(Errno),
    Halt(Errno),
    EmptyCommand,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { command, source } => write!(f, "running `{command}`: {source}"),
            Self::Status { command, status } => write!(f, "`{command}` failed: {status}"),
            Self::Signal(e) => write!(f, "signalling init: {e}"),
            Self::Halt(e) => write!(f, "power off: {e}"),
            Self::EmptyCommand => f.write_str("shutdown command is empty"),
        }
    }
}

impl std::error::Error for ActionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Signal(e) | Self::Halt(e) => Some(e),
            _ => None,
        }
    }
}

/// The final power-down step.
pub trait ShutdownAction {
    fn name(&self) -> &str;

    fn power_off(&mut self) -> Result<(), ActionError>;
}

impl<A: ShutdownAction + ?Sized> ShutdownAction for Box<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn power_off(&mut self) -> Result<(), ActionError> {
        (**self).power_off()
    }
}

/// Selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    #[default]
    Systemctl,
    SignalInit,
    Halt,
    DryRun,
}

impl ActionKind {
    /// `command` is used only by [`ActionKind::Systemctl`].
    pub fn build(self, command: &str) -> Result<Box<dyn ShutdownAction>, ActionError> {
        Ok(match self {
            Self::Systemctl => Box::new(CommandAction::parse(command)?),
            Self::SignalInit => Box::new(SignalInit),
            Self::Halt => Box::new(DirectHalt),
            Self::DryRun => Box::new(DryRun),
        })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Systemctl => "systemctl",
            Self::SignalInit => "signal-init",
            Self::Halt => "halt",
            Self::DryRun => "dry-run",
        })
    }
}

/// Run an external command, `systemctl poweroff` by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl Default for CommandAction {
    fn default() -> Self {
        Self {
            program: "systemctl".into(),
            args: vec!["poweroff".into()],
        }
    }
}

impl CommandAction {
    /// Split a whitespace-separated command line. No shell quoting.
    pub fn parse(command: &str) -> Result<Self, ActionError> {
        let mut words = command.split_whitespace().map(String::from);
        let program = words.next().ok_or(ActionError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ShutdownAction for CommandAction {
    fn name(&self) -> &str {
        &self.program
    }

    fn power_off(&mut self) -> Result<(), ActionError> {
        let command = self.command_line();
        log::info!("running `{command}`");
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|source| ActionError::Spawn {
                command: command.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ActionError::Status { command, status })
        }
    }
}

/// Ask systemd (pid 1) to power off with `SIGRTMIN+4`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalInit;

impl ShutdownAction for SignalInit {
    fn name(&self) -> &str {
        "signal-init"
    }

    fn power_off(&mut self) -> Result<(), ActionError> {
        let signal = nix::libc::SIGRTMIN() + 4;
        log::info!("sending signal {signal} to init");
        // SAFETY: kill(2) takes plain integers and touches no memory of ours.
        let rc = unsafe { nix::libc::kill(1, signal) };
        Errno::result(rc).map(drop).map_err(ActionError::Signal)
    }
}

/// Flush filesystems and power off directly. Needs `CAP_SYS_BOOT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectHalt;

impl ShutdownAction for DirectHalt {
    fn name(&self) -> &str {
        "halt"
    }

    fn power_off(&mut self) -> Result<(), ActionError> {
        log::info!("syncing filesystems and powering off");
        nix::unistd::sync();
        match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF) {
            Ok(never) => match never {},
            Err(e) => Err(ActionError::Halt(e)),
        }
    }
}

/// Log the request and do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRun;

impl ShutdownAction for DryRun {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn power_off(&mut self) -> Result<(), ActionError> {
        log::warn!("dry run: would power off now");
        Ok(())
    }
}
