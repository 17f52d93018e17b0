//! Ancillary data for UNIX socket messages (`SCM_RIGHTS`, `SCM_CREDENTIALS`).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessageOwned, UnixCredentials};
use nix::unistd::{getgid, getpid, getuid};

use super::ScopedFd;

/// Process credentials carried by `SCM_CREDENTIALS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        Self {
            pid: getpid().as_raw(),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }

    pub(crate) fn to_unix(self) -> UnixCredentials {
        libc::ucred {
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
        }
        .into()
    }
}

impl From<UnixCredentials> for Credentials {
    fn from(credentials: UnixCredentials) -> Self {
        Self {
            pid: credentials.pid(),
            uid: credentials.uid(),
            gid: credentials.gid(),
        }
    }
}

/// One control message attached to a [`UnixMessage`](super::UnixMessage).
#[derive(Debug)]
pub enum ControlMessage {
    /// Owned copies of file descriptors, closed when the message drops.
    Rights(Vec<OwnedFd>),
    Credentials(Credentials),
}

impl ControlMessage {
    /// Duplicate each of `fds` (close-on-exec) into a rights message.
    pub fn from_file_descriptors(fds: &[&ScopedFd]) -> io::Result<Self> {
        let mut owned = Vec::with_capacity(fds.len());
        for fd in fds {
            let copy = fd.dup()?;
            owned.push(
                copy.into_owned()
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?,
            );
        }
        Ok(ControlMessage::Rights(owned))
    }

    pub fn from_credentials(credentials: Credentials) -> Self {
        ControlMessage::Credentials(credentials)
    }

    /// Fresh owners of the carried descriptors; empty for other kinds.
    pub fn as_scoped_fds(&self) -> io::Result<Vec<ScopedFd>> {
        match self {
            ControlMessage::Rights(fds) => fds
                .iter()
                .map(|fd| fd.try_clone().map(ScopedFd::new))
                .collect(),
            ControlMessage::Credentials(_) => Ok(Vec::new()),
        }
    }

    /// Take the carried descriptors.
    pub fn into_scoped_fds(self) -> Vec<ScopedFd> {
        match self {
            ControlMessage::Rights(fds) => fds.into_iter().map(ScopedFd::new).collect(),
            ControlMessage::Credentials(_) => Vec::new(),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match self {
            ControlMessage::Credentials(credentials) => Some(*credentials),
            ControlMessage::Rights(_) => None,
        }
    }

    /// Raw numbers of the carried descriptors, still owned by `self`.
    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        match self {
            ControlMessage::Rights(fds) => fds.iter().map(AsRawFd::as_raw_fd).collect(),
            ControlMessage::Credentials(_) => Vec::new(),
        }
    }

    /// Adopt a received control message. Received descriptors become owned;
    /// kinds other than rights and credentials are rejected.
    pub(crate) fn from_received(message: ControlMessageOwned) -> io::Result<Self> {
        match message {
            ControlMessageOwned::ScmRights(fds) => Ok(ControlMessage::Rights(
                fds.into_iter()
                    // SAFETY: the kernel installed these descriptors for us.
                    .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
                    .collect(),
            )),
            ControlMessageOwned::ScmCredentials(credentials) => {
                Ok(ControlMessage::Credentials(Credentials::from(credentials)))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected control message {:?}", other),
            )),
        }
    }
}
