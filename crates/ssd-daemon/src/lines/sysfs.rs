//! GPIO lines driven through the legacy sysfs interface
//!
//! Claiming exports the line and configures it as a rising-edge input.
//! Edges are delivered by a watcher thread blocked in `poll(2)` on the
//! line's `value` file, which reports `POLLPRI` on every configured edge.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::{EdgeLine, LineError, LineProvider, LineSpec};
use crate::capture::InterruptCapture;

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Upper bound on how long a stop request waits for the watcher.
const POLL_TICK_MS: u16 = 100;

/// Attribute files appear (and get their permissions) shortly after export.
const EXPORT_SETTLE: Duration = Duration::from_millis(50);
const EXPORT_ATTEMPTS: u32 = 20;

fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

fn is_errno(e: &io::Error, errno: Errno) -> bool {
    e.raw_os_error() == Some(errno as i32)
}

/// Lines under a sysfs GPIO root.
#[derive(Debug, Clone)]
pub struct SysfsLines {
    root: PathBuf,
}

impl Default for SysfsLines {
    fn default() -> Self {
        Self::new(SYSFS_GPIO_ROOT)
    }
}

impl SysfsLines {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LineProvider for SysfsLines {
    type Line = SysfsLine;

    fn claim(&mut self, spec: &LineSpec) -> Result<SysfsLine, LineError> {
        let gpio = spec.gpio;
        write_attr(&self.root.join("export"), &gpio.to_string()).map_err(|e| {
            if is_errno(&e, Errno::EBUSY) {
                LineError::Busy(gpio)
            } else if is_errno(&e, Errno::EINVAL) {
                LineError::Invalid(gpio)
            } else {
                LineError::io(gpio, e)
            }
        })?;

        let line = SysfsLine {
            spec: spec.clone(),
            root: self.root.clone(),
            dir: self.root.join(format!("gpio{gpio}")),
            watcher: None,
        };
        if let Err(e) = line.configure() {
            line.unexport();
            return Err(e);
        }
        log::debug!("exported {spec} as rising-edge input");
        Ok(line)
    }
}

struct Watcher {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// An exported line. Released lines are unexported.
pub struct SysfsLine {
    spec: LineSpec,
    root: PathBuf,
    dir: PathBuf,
    watcher: Option<Watcher>,
}

impl SysfsLine {
    fn configure(&self) -> Result<(), LineError> {
        let gpio = self.spec.gpio;
        let direction = self.dir.join("direction");
        let mut attempt = 0u32;
        loop {
            match write_attr(&direction, "in") {
                Ok(()) => break,
                Err(e)
                    if attempt < EXPORT_ATTEMPTS
                        && matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                        ) =>
                {
                    attempt += 1;
                    log::debug!("gpio{gpio}: direction not writable yet ({e}), retrying");
                    thread::sleep(EXPORT_SETTLE);
                }
                Err(e) => return Err(LineError::io(gpio, e)),
            }
        }
        write_attr(&self.dir.join("edge"), "rising").map_err(|e| {
            if is_errno(&e, Errno::EINVAL) {
                LineError::NoIrq(gpio)
            } else {
                LineError::io(gpio, e)
            }
        })
    }

    fn unexport(&self) {
        if let Err(e) = write_attr(&self.root.join("unexport"), &self.spec.gpio.to_string()) {
            log::warn!("gpio{}: unexport failed: {e}", self.spec.gpio);
        }
    }
}

impl EdgeLine for SysfsLine {
    fn spec(&self) -> &LineSpec {
        &self.spec
    }

    fn request_irq(&mut self, capture: InterruptCapture) -> Result<(), LineError> {
        let gpio = self.spec.gpio;
        if self.watcher.is_some() {
            return Err(LineError::Busy(gpio));
        }
        let mut value = File::open(self.dir.join("value")).map_err(|e| LineError::io(gpio, e))?;
        // Consume the current level so the first poll reports only new edges
        let high = read_level(&mut value).map_err(|e| LineError::io(gpio, e))?;
        log::debug!("gpio{gpio}: armed at level {}", u8::from(high));

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name(format!("irq-gpio{gpio}"))
            .spawn({
                let stop = stop.clone();
                move || watch_edges(gpio, value, &capture, &stop)
            })
            .map_err(|e| LineError::io(gpio, e))?;
        self.watcher = Some(Watcher { stop, thread });
        Ok(())
    }

    fn free_irq(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop.store(true, Ordering::Release);
            if watcher.thread.join().is_err() {
                log::error!("gpio{}: edge watcher panicked", self.spec.gpio);
            }
        }
    }

    fn release(mut self) {
        self.free_irq();
        if let Err(e) = write_attr(&self.dir.join("edge"), "none") {
            log::debug!("gpio{}: clearing edge failed: {e}", self.spec.gpio);
        }
        self.unexport();
    }
}

/// Read the line level back from offset 0, which also re-arms `POLLPRI`.
fn read_level(value: &mut File) -> io::Result<bool> {
    let mut level = [0u8; 4];
    value.seek(SeekFrom::Start(0))?;
    let n = value.read(&mut level)?;
    Ok(level[..n].first() == Some(&b'1'))
}

fn watch_edges(gpio: u32, mut value: File, capture: &InterruptCapture, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let edge = {
            let mut fds = [PollFd::new(
                value.as_fd(),
                PollFlags::POLLPRI | PollFlags::POLLERR,
            )];
            match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => fds[0]
                    .revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLPRI | PollFlags::POLLERR)),
                Err(e) => {
                    log::error!("gpio{gpio}: poll failed: {e}");
                    return;
                }
            }
        };
        if !edge {
            // Readable but not edge-capable (not a sysfs value file)
            thread::sleep(Duration::from_millis(u64::from(POLL_TICK_MS)));
            continue;
        }
        if let Err(e) = read_level(&mut value) {
            log::error!("gpio{gpio}: reading value failed: {e}");
            return;
        }
        capture.handle();
    }
}
