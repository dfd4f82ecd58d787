//! Common error type for both ends of the notification channel

use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

/// Error from a transport operation (bind, send or receive).
///
/// Sends are fire-and-forget, so callers mostly log these; the
/// classification helpers exist for the few places that branch on the kind.
#[derive(Debug)]
pub enum TransportError {
    /// The receiver's queue is full and the send was not allowed to wait.
    WouldBlock,
    /// Nothing is listening at the destination address.
    Unreachable(PathBuf),
    /// A datagram arrived without sender credentials or a return address.
    Anonymous,
    /// The endpoint has been closed.
    Closed,
    Io(io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WouldBlock => f.write_str("receiver queue full"),
            Self::Unreachable(path) => write!(f, "no listener at {}", path.display()),
            Self::Anonymous => f.write_str("datagram without sender credentials"),
            Self::Closed => f.write_str("endpoint closed"),
            Self::Io(e) => write!(f, "IO: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl TransportError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Classify a failed send to `dest`.
    pub fn from_errno(errno: Errno, dest: &Path) -> Self {
        match errno {
            Errno::EAGAIN => Self::WouldBlock,
            Errno::ECONNREFUSED | Errno::ENOENT => Self::Unreachable(dest.to_path_buf()),
            e => Self::Io(io::Error::from(e)),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            Self::WouldBlock
        } else {
            Self::Io(e)
        }
    }
}

impl From<Errno> for TransportError {
    fn from(e: Errno) -> Self {
        io::Error::from(e).into()
    }
}
