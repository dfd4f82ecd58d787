//! Process stop handling via atomic flag

use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Global stop flag, set by the SIGTERM/SIGINT handler
pub fn stop_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if a stop was requested
pub fn is_stop_requested() -> bool {
    stop_flag().load(Ordering::Relaxed)
}

/// Request a stop (for signal handlers and the simulator console)
pub fn request_stop() {
    stop_flag().store(true, Ordering::Relaxed);
}

/// Route SIGTERM and SIGINT to the stop flag.
///
/// First signal: set the flag so the caller can tear down in order.
/// Second signal: exit immediately with status 130.
pub fn install_stop_handlers() -> std::io::Result<()> {
    for signal in [SIGTERM, SIGINT] {
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, || {
                if stop_flag().swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })?;
        }
    }
    Ok(())
}
