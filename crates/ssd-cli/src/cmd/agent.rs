//! Agent subcommand - wait for the shutdown notice and act on it

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use ssd_agent::{ActionKind, ShutdownAgent};
use ssd_core::FrameCodec;
use ssd_core::transport::UnixAgentSocket;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// What to do on shutdown
    #[arg(short, long, value_enum)]
    pub action: Option<ActionArg>,

    /// Handshake payload; empty listens for broadcasts without registering
    #[arg(long)]
    pub hello: Option<String>,

    /// Join the broadcast group
    #[arg(long)]
    pub subscribe: bool,

    /// Daemon socket path
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ActionArg {
    Systemctl,
    SignalInit,
    Halt,
    DryRun,
}

impl From<ActionArg> for ActionKind {
    fn from(a: ActionArg) -> Self {
        match a {
            ActionArg::Systemctl => ActionKind::Systemctl,
            ActionArg::SignalInit => ActionKind::SignalInit,
            ActionArg::Halt => ActionKind::Halt,
            ActionArg::DryRun => ActionKind::DryRun,
        }
    }
}

impl AgentArgs {
    /// Fold command-line overrides into `config`, which must be validated again.
    pub fn apply(&self, config: &mut Config) {
        if let Some(action) = self.action {
            config.agent.action = action.into();
        }
        if let Some(hello) = &self.hello {
            config.agent.hello.clone_from(hello);
        }
        if self.subscribe {
            config.agent.subscribe = true;
        }
        if let Some(socket) = &self.socket {
            config.channel.socket.clone_from(socket);
        }
    }
}

/// Run the agent with a config that already carries the argument overrides.
pub fn run(config: &Config) -> Result<()> {
    let kind = config.agent.action;
    let action = kind
        .build(&config.agent.command)
        .context("Failed to set up shutdown action")?;

    let local = config.agent_socket_path(std::process::id(), config.agent.subscribe);
    let socket = UnixAgentSocket::bind(&local, &config.channel.socket)
        .with_context(|| format!("Failed to bind agent socket {}", local.display()))?;
    log::info!(
        "agent listening at {} (action: {kind})",
        socket.local_path().display()
    );

    let codec = FrameCodec::new(config.channel.protocol, config.channel.max_payload);
    let mut agent = ShutdownAgent::new(socket, action)
        .with_codec(codec)
        .with_hello(config.agent.hello.clone());
    agent.run().context("Agent stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> AgentArgs {
        AgentArgs {
            action: None,
            hello: None,
            subscribe: false,
            socket: None,
        }
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = Config::default();
        let args = AgentArgs {
            action: Some(ActionArg::DryRun),
            hello: Some("ups-monitor".into()),
            subscribe: true,
            socket: Some(PathBuf::from("/tmp/ssd-test.sock")),
        };
        args.apply(&mut config);

        assert_eq!(config.agent.action, ActionKind::DryRun);
        assert_eq!(config.agent.hello, "ups-monitor");
        assert!(config.agent.subscribe);
        assert_eq!(config.channel.socket, PathBuf::from("/tmp/ssd-test.sock"));
        config.validate().unwrap();
    }

    #[test]
    fn no_overrides_keep_config() {
        let mut config = Config::default();
        args().apply(&mut config);
        assert_eq!(config.agent.hello, ssd_core::HELLO);
        assert!(!config.agent.subscribe);
    }

    #[test]
    fn invalid_hello_override_fails_validation() {
        let mut config = Config::default();
        let args = AgentArgs {
            hello: Some("Grüße".into()),
            ..args()
        };
        args.apply(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_hello_override_fails_validation() {
        let mut config = Config::default();
        config.channel.max_payload = 8;
        let args = AgentArgs {
            hello: Some("Hello from client!".into()),
            ..args()
        };
        args.apply(&mut config);
        assert!(config.validate().is_err());
    }
}
