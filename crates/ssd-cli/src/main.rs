//! ssd - Safe-shutdown daemon and agent
//!
//! The daemon turns edges on the power-failure and power-button lines into
//! `Shutdown` notifications; the agent waits for one and powers the
//! machine off.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

/// Exit status for an unreadable or invalid configuration
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "ssd")]
#[command(about = "Safe-shutdown notification daemon and agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (default: ./ssd.toml, ~/.config/ssd/config.toml or /etc/ssd/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the shutdown lines and notify the agent
    Daemon(cmd::daemon::DaemonArgs),
    /// Register with the daemon and power off when told to
    Agent(cmd::agent::AgentArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    ssd_core::init_logging(cli.quiet, cli.debug);

    // Load configuration
    let loaded = match cli.config {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Command-line overrides are configuration too
    if let Command::Agent(args) = &cli.command {
        args.apply(&mut config);
        if let Err(e) = config.validate() {
            log::error!("{e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let result = match cli.command {
        Command::Daemon(args) => cmd::daemon::run(args, &config),
        Command::Agent(_) => cmd::agent::run(&config),
        Command::Config => {
            print_config(&config);
            Ok(())
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec![
        "Daemon socket",
        &config.channel.socket.display().to_string(),
    ]);
    table.add_row(vec![
        "Group directory",
        &config.channel.group_dir.display().to_string(),
    ]);
    table.add_row(vec!["Protocol", &config.channel.protocol.to_string()]);
    table.add_row(vec!["Broadcast group", &config.channel.group.to_string()]);
    table.add_row(vec![
        "Max payload",
        &format!("{} bytes", config.channel.max_payload),
    ]);
    table.add_row(vec![
        "GPIO root",
        &config.lines.sysfs_root.display().to_string(),
    ]);
    table.add_row(vec![
        "Power failure line",
        &format!("gpio{}", config.lines.power_failure),
    ]);
    table.add_row(vec![
        "Power button line",
        &format!("gpio{}", config.lines.power_button),
    ]);
    table.add_row(vec!["Queue depth", &config.pipeline.queue_depth.to_string()]);
    table.add_row(vec!["Work policy", &format!("{:?}", config.pipeline.policy)]);
    table.add_row(vec!["Handshake", &format!("{:?}", config.pipeline.handshake)]);
    table.add_row(vec![
        "Handshake timeout",
        &config
            .pipeline
            .handshake_timeout_ms
            .map_or_else(|| "none".to_string(), |ms| format!("{ms}ms")),
    ]);
    table.add_row(vec![
        "Drain timeout",
        &format!("{}ms", config.pipeline.drain_timeout_ms),
    ]);
    table.add_row(vec![
        "Agent socket dir",
        &config.agent.socket_dir.display().to_string(),
    ]);
    table.add_row(vec!["Agent hello", &format!("{:?}", config.agent.hello)]);
    table.add_row(vec!["Shutdown action", &config.agent.action.to_string()]);
    table.add_row(vec!["Shutdown command", &config.agent.command]);
    table.add_row(vec![
        "Subscribe",
        if config.agent.subscribe { "yes" } else { "no" },
    ]);

    eprintln!("\n{table}");
}
