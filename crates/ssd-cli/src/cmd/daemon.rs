//! Daemon subcommand - own the lines and the notification socket

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use ssd_core::transport::UnixTransport;
use ssd_daemon::{
    EdgeLine, HandshakeMode, InitError, LineProvider, ModuleConfig, ShutdownModule,
    SimulatedLines, SysfsLines, WorkPolicy,
};

use crate::config::Config;

/// How often the main thread checks for a stop request.
const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Use simulated lines; type `failure` or `button` on stdin to raise an edge
    #[arg(long)]
    pub simulate: bool,

    /// When to accept the listener handshake
    #[arg(long, value_enum)]
    pub handshake: Option<HandshakeArg>,

    /// How triggers map to notification jobs
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Give up waiting for a listener after this many milliseconds
    #[arg(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// Daemon socket path
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum HandshakeArg {
    Blocking,
    BroadcastFirst,
    Background,
}

impl From<HandshakeArg> for HandshakeMode {
    fn from(h: HandshakeArg) -> Self {
        match h {
            HandshakeArg::Blocking => HandshakeMode::Blocking,
            HandshakeArg::BroadcastFirst => HandshakeMode::BroadcastFirst,
            HandshakeArg::Background => HandshakeMode::Background,
        }
    }
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum PolicyArg {
    PerEvent,
    Coalesce,
}

impl From<PolicyArg> for WorkPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::PerEvent => WorkPolicy::PerEvent,
            PolicyArg::Coalesce => WorkPolicy::Coalesce,
        }
    }
}

pub fn run(args: DaemonArgs, config: &Config) -> Result<()> {
    ssd_core::install_stop_handlers().context("Failed to install signal handlers")?;

    let mut module_config = config.module_config();
    if let Some(h) = args.handshake {
        module_config.handshake = h.into();
    }
    if let Some(p) = args.policy {
        module_config.policy = p.into();
    }
    if let Some(ms) = args.handshake_timeout_ms {
        module_config.handshake_timeout = Some(Duration::from_millis(ms));
    }
    let socket = args.socket.unwrap_or_else(|| config.channel.socket.clone());

    if args.simulate {
        let mut lines = SimulatedLines::new();
        if let Some(module) = start(&module_config, &socket, config, &mut lines)? {
            spawn_console(lines, config).context("Failed to start simulator console")?;
            serve(module);
        }
    } else {
        let mut lines = SysfsLines::new(&config.lines.sysfs_root);
        if let Some(module) = start(&module_config, &socket, config, &mut lines)? {
            serve(module);
        }
    }
    Ok(())
}

fn start<P: LineProvider>(
    module_config: &ModuleConfig,
    socket: &std::path::Path,
    config: &Config,
    lines: &mut P,
) -> Result<Option<ShutdownModule<UnixTransport, P::Line>>> {
    log::info!(
        "starting: socket {}, handshake {:?}, policy {:?}",
        socket.display(),
        module_config.handshake,
        module_config.policy
    );
    match ShutdownModule::init(
        module_config,
        || UnixTransport::bind(socket, &config.channel.group_dir),
        lines,
    ) {
        Ok(module) => Ok(Some(module)),
        Err(InitError::Aborted) => {
            log::info!("stopped before a listener registered");
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to start shutdown module"),
    }
}

fn serve<L: EdgeLine>(module: ShutdownModule<UnixTransport, L>) {
    while !ssd_core::is_stop_requested() {
        thread::sleep(STOP_POLL);
    }
    log::info!("stop requested, tearing down");
    module.teardown().log();
}

/// Read edge commands from stdin. Runs detached; EOF just ends the console.
fn spawn_console(lines: SimulatedLines, config: &Config) -> std::io::Result<()> {
    let failure = config.lines.power_failure;
    let button = config.lines.power_button;
    eprintln!("simulator: `failure`, `button` or `quit`");
    thread::Builder::new()
        .name("ssd-console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let gpio = match line.trim() {
                    "failure" | "f" => failure,
                    "button" | "b" => button,
                    "quit" | "q" => {
                        ssd_core::request_stop();
                        break;
                    }
                    "" => continue,
                    other => {
                        log::warn!("unknown command: {other}");
                        continue;
                    }
                };
                if lines.fire(gpio).is_none() {
                    log::warn!("gpio{gpio} has no handler");
                }
            }
        })?;
    Ok(())
}
