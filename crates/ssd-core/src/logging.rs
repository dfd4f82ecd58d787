//! Logging setup shared by the daemon and the agent

use std::io::{IsTerminal, Write};

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

fn default_level(quiet: bool, debug: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    }
}

/// Initialize logging. `RUST_LOG` overrides the level chosen by the flags.
///
/// On a TTY lines get colors and millisecond timestamps. Otherwise (systemd
/// unit, pipe) plain labels only, since the journal stamps every line.
pub fn init_logging(quiet: bool, debug: bool) {
    let color = std::io::stderr().is_terminal();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level(quiet, debug)),
    )
    .format(move |buf, record| {
        let (pre, label, post) = level_style(record.level(), color);
        if color {
            let ts = buf.timestamp_millis();
            writeln!(buf, "{ts} [{pre}{label}{post}] {}", record.args())
        } else {
            writeln!(buf, "[{label}] {}", record.args())
        }
    })
    .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_style_has_no_escape_codes() {
        let (pre, label, post) = level_style(log::Level::Warn, false);
        assert_eq!((pre, label, post), ("", "WARN ", ""));
    }

    #[test]
    fn colored_style_resets() {
        let (pre, _, post) = level_style(log::Level::Error, true);
        assert_eq!(pre, "\x1b[31m");
        assert_eq!(post, "\x1b[0m");
    }

    #[test]
    fn debug_wins_over_quiet() {
        assert_eq!(default_level(true, true), "debug");
        assert_eq!(default_level(true, false), "warn");
        assert_eq!(default_level(false, false), "info");
    }
}
