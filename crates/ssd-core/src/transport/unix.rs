//! Unix datagram sockets standing in for a netlink family.
//!
//! The daemon binds a well-known path with `SO_PASSCRED`, so the kernel
//! attaches the sender's pid to every datagram. Broadcast groups are
//! directories: an agent joins group `n` by binding its socket inside
//! `<group_root>/group-<n>/`.

use std::fs;
use std::io::{self, IoSliceMut};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    self, ControlMessageOwned, MsgFlags, UnixAddr, UnixCredentials, sockopt,
};

use super::{AgentSocket, ListenerId, Received, RecvWait, Transport};
use crate::error::TransportError;

/// SO_RCVTIMEO rejects a zero timeout
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Directory whose sockets form broadcast group `group`.
pub fn group_dir(group_root: &Path, group: u32) -> PathBuf {
    group_root.join(format!("group-{group}"))
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn bind_datagram(path: &Path) -> io::Result<UnixDatagram> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale(path)?;
    UnixDatagram::bind(path)
}

/// Privileged socket bound at a fixed path.
pub struct UnixTransport {
    socket: UnixDatagram,
    path: PathBuf,
    group_root: PathBuf,
}

impl UnixTransport {
    pub fn bind(
        path: impl Into<PathBuf>,
        group_root: impl Into<PathBuf>,
    ) -> Result<Self, TransportError> {
        let path = path.into();
        let group_root = group_root.into();

        let socket = bind_datagram(&path)?;
        socket::setsockopt(&socket, sockopt::PassCred, &true)?;
        fs::create_dir_all(&group_root)?;

        log::debug!("channel bound at {}", path.display());
        Ok(Self {
            socket,
            path,
            group_root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send_to(&self, dest: &Path, frame: &[u8]) -> Result<(), TransportError> {
        let addr = UnixAddr::new(dest).map_err(|e| TransportError::from_errno(e, dest))?;
        socket::sendto(
            self.socket.as_raw_fd(),
            frame,
            &addr,
            MsgFlags::MSG_DONTWAIT,
        )
        .map_err(|e| TransportError::from_errno(e, dest))?;
        Ok(())
    }
}

impl Transport for UnixTransport {
    fn recv(&self, buf: &mut [u8], wait: RecvWait) -> Result<Option<Received>, TransportError> {
        let flags = match wait {
            RecvWait::NoWait => MsgFlags::MSG_DONTWAIT,
            RecvWait::Forever => {
                self.socket.set_read_timeout(None)?;
                MsgFlags::empty()
            }
            RecvWait::Timeout(t) => {
                self.socket.set_read_timeout(Some(t.max(MIN_TIMEOUT)))?;
                MsgFlags::empty()
            }
        };

        let (len, addr, pid) = {
            let mut iov = [IoSliceMut::new(buf)];
            let mut cmsg = nix::cmsg_space!(UnixCredentials);
            let msg = match socket::recvmsg::<UnixAddr>(
                self.socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                flags,
            ) {
                Ok(msg) => msg,
                // Timeout and interruption both surface as "nothing yet"
                Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let mut pid = None;
            for c in msg.cmsgs()? {
                if let ControlMessageOwned::ScmCredentials(creds) = c {
                    pid = Some(creds.pid() as u32);
                }
            }
            let addr = msg
                .address
                .as_ref()
                .and_then(|a| a.path())
                .map(Path::to_path_buf);
            (msg.bytes, addr, pid)
        };

        match (addr, pid) {
            (Some(addr), Some(pid)) => Ok(Some(Received {
                len,
                sender: ListenerId { pid, addr },
            })),
            _ => Err(TransportError::Anonymous),
        }
    }

    fn unicast(&self, to: &ListenerId, frame: &[u8]) -> Result<(), TransportError> {
        self.send_to(&to.addr, frame)
    }

    fn broadcast(&self, group: u32, frame: &[u8]) -> Result<usize, TransportError> {
        let dir = group_dir(&self.group_root, group);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reached = 0;
        for entry in entries {
            let path = entry?.path();
            match self.send_to(&path, frame) {
                Ok(()) => reached += 1,
                Err(e) => log::debug!("group {group}: {} not reached: {e}", path.display()),
            }
        }
        Ok(reached)
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Agent socket bound at its own path, sending to the daemon's path.
pub struct UnixAgentSocket {
    socket: UnixDatagram,
    local: PathBuf,
    server: PathBuf,
}

impl UnixAgentSocket {
    pub fn bind(
        local: impl Into<PathBuf>,
        server: impl Into<PathBuf>,
    ) -> Result<Self, TransportError> {
        let local = local.into();
        let socket = bind_datagram(&local)?;
        Ok(Self {
            socket,
            local,
            server: server.into(),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }
}

impl AgentSocket for UnixAgentSocket {
    /// Never waits: a daemon that stopped reading its socket shows up as
    /// [`TransportError::WouldBlock`] once its receive queue is full.
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let addr = UnixAddr::new(&self.server)
            .map_err(|e| TransportError::from_errno(e, &self.server))?;
        socket::sendto(
            self.socket.as_raw_fd(),
            frame,
            &addr,
            MsgFlags::MSG_DONTWAIT,
        )
        .map_err(|e| TransportError::from_errno(e, &self.server))?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.socket.recv(buf)?)
    }
}

impl Drop for UnixAgentSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.local);
    }
}
