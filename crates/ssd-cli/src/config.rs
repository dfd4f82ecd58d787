//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use ssd_agent::ActionKind;
use ssd_core::protocol::{BROADCAST_GROUP, MAX_PAYLOAD, PROTOCOL};
use ssd_daemon::lines::{LineSpec, POWER_BUTTON_GPIO, POWER_FAILURE_GPIO, SYSFS_GPIO_ROOT};
use ssd_daemon::{
    ChannelConfig, EventSource, HandshakeMode, ModuleConfig, WorkPolicy,
    config::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_QUEUE_DEPTH},
};

/// Global configuration for ssd
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelSection,
    pub lines: LinesSection,
    pub pipeline: PipelineSection,
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub socket: PathBuf,
    pub group_dir: PathBuf,
    pub protocol: u16,
    pub group: u32,
    pub max_payload: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/ssd/ssd.sock"),
            group_dir: PathBuf::from("/run/ssd/groups"),
            protocol: PROTOCOL,
            group: BROADCAST_GROUP,
            max_payload: MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinesSection {
    pub sysfs_root: PathBuf,
    pub power_failure: u32,
    pub power_button: u32,
}

impl Default for LinesSection {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_GPIO_ROOT),
            power_failure: POWER_FAILURE_GPIO,
            power_button: POWER_BUTTON_GPIO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub queue_depth: usize,
    pub policy: WorkPolicy,
    pub handshake: HandshakeMode,
    /// Unset waits for a listener until stopped
    pub handshake_timeout_ms: Option<u64>,
    pub drain_timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            policy: WorkPolicy::default(),
            handshake: HandshakeMode::default(),
            handshake_timeout_ms: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub socket_dir: PathBuf,
    pub hello: String,
    pub action: ActionKind,
    /// Command line for the `systemctl` action
    pub command: String,
    /// Bind inside the broadcast group directory
    pub subscribe: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/ssd/agents"),
            hello: ssd_core::HELLO.to_string(),
            action: ActionKind::default(),
            command: ssd_agent::action::DEFAULT_COMMAND.to_string(),
            subscribe: false,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./ssd.toml (current directory)
    /// 2. ~/.config/ssd/config.toml
    /// 3. /etc/ssd/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("ssd.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "ssd") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        let system_config = PathBuf::from("/etc/ssd/config.toml");
        if system_config.exists() {
            return Self::from_file(&system_config);
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.pipeline.queue_depth > 0, "pipeline.queue_depth must be positive");
        ensure!(
            self.channel.max_payload >= ssd_core::SHUTDOWN.len(),
            "channel.max_payload must fit the shutdown payload"
        );
        ensure!(
            self.agent.hello.is_ascii() && !self.agent.hello.contains('\0'),
            "agent.hello must be ASCII without NUL bytes"
        );
        ensure!(
            self.agent.hello.len() <= self.channel.max_payload,
            "agent.hello is longer than channel.max_payload"
        );
        ensure!(
            self.lines.power_failure != self.lines.power_button,
            "power_failure and power_button must be different lines"
        );
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            protocol: self.channel.protocol,
            group: self.channel.group,
            max_payload: self.channel.max_payload,
        }
    }

    pub fn module_config(&self) -> ModuleConfig {
        ModuleConfig {
            lines: vec![
                LineSpec::new(EventSource::PowerFailure, self.lines.power_failure),
                LineSpec::new(EventSource::PowerButton, self.lines.power_button),
            ],
            channel: self.channel_config(),
            queue_depth: self.pipeline.queue_depth,
            policy: self.pipeline.policy,
            handshake: self.pipeline.handshake,
            handshake_timeout: self.pipeline.handshake_timeout_ms.map(Duration::from_millis),
            drain_timeout: Duration::from_millis(self.pipeline.drain_timeout_ms),
        }
    }

    /// Where the agent with `pid` binds its socket.
    pub fn agent_socket_path(&self, pid: u32, subscribe: bool) -> PathBuf {
        let name = format!("agent-{pid}.sock");
        if subscribe {
            ssd_core::transport::group_dir(&self.channel.group_dir, self.channel.group).join(name)
        } else {
            self.agent.socket_dir.join(name)
        }
    }
}
