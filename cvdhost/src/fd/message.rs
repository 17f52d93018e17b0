//! Record-oriented messages with ancillary data over a UNIX socket.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, MsgFlags, UnixCredentials, getsockopt, recvmsg, sendmsg, setsockopt, sockopt,
};

use cvdhost_shared::errors::{CvdResult, ErrorKind, StackTraceError};
use cvdhost_shared::{ensure, propagate, stack_entry, stack_err};

use super::ScopedFd;
use super::control::{ControlMessage, Credentials};

/// Largest payload accepted by [`UnixMessageSocket::read_message`] by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024;
const CONTROL_BUFFER_SIZE: usize = 4 * 1024;

/// One record: payload bytes plus control messages.
#[derive(Debug, Default)]
pub struct UnixMessage {
    pub data: Vec<u8>,
    pub control: Vec<ControlMessage>,
}

impl UnixMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            control: Vec::new(),
        }
    }

    pub fn with_control(mut self, message: ControlMessage) -> Self {
        self.control.push(message);
        self
    }

    /// True when the message carries neither payload nor control data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.control.is_empty()
    }
}

/// Wrapper around a UNIX socket exchanging [`UnixMessage`]s.
///
/// Works over stream sockets, but only `SOCK_SEQPACKET` and `SOCK_DGRAM`
/// preserve record boundaries.
#[derive(Debug)]
pub struct UnixMessageSocket {
    fd: ScopedFd,
    max_message_size: usize,
}

impl UnixMessageSocket {
    pub fn new(fd: ScopedFd) -> Self {
        Self {
            fd,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn fd(&self) -> &ScopedFd {
        &self.fd
    }

    fn borrowed(&self) -> CvdResult<BorrowedFd<'_>> {
        match self.fd.borrow() {
            Some(fd) => Ok(fd),
            None => Err(stack_err!(kind = ErrorKind::Invariant, "message socket is closed")),
        }
    }

    /// Toggle `SO_PASSCRED` so received messages carry sender credentials.
    pub fn enable_credentials(&self, enable: bool) -> CvdResult<()> {
        let fd = propagate!(self.borrowed());
        propagate!(setsockopt(&fd, sockopt::PassCred, &enable), "setsockopt(SO_PASSCRED)");
        Ok(())
    }

    /// Whether `SO_PASSCRED` is enabled.
    pub fn credentials_enabled(&self) -> CvdResult<bool> {
        let fd = propagate!(self.borrowed());
        Ok(propagate!(getsockopt(&fd, sockopt::PassCred)))
    }

    /// Send one record with `MSG_NOSIGNAL`.
    pub fn write_message(&self, message: &UnixMessage) -> CvdResult<()> {
        let fd = propagate!(self.borrowed());
        let rights: Vec<Vec<RawFd>> = message.control.iter().map(ControlMessage::raw_fds).collect();
        let credentials: Vec<Option<UnixCredentials>> = message
            .control
            .iter()
            .map(|entry| entry.credentials().map(Credentials::to_unix))
            .collect();
        let cmsgs: Vec<socket::ControlMessage<'_>> = rights
            .iter()
            .zip(&credentials)
            .map(|(fds, credentials)| match credentials {
                Some(credentials) => socket::ControlMessage::ScmCredentials(credentials),
                None => socket::ControlMessage::ScmRights(fds),
            })
            .collect();
        let iov = [IoSlice::new(&message.data)];

        let sent = loop {
            match sendmsg::<()>(fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Err(Errno::EINTR) => continue,
                result => break propagate!(result, "sendmsg failed"),
            }
        };
        ensure_sent(sent, message.data.len())
    }

    /// Receive one record. Truncated payload or control data is an error.
    ///
    /// A zero-length record with no control data means the peer hung up.
    pub fn read_message(&self) -> CvdResult<UnixMessage> {
        let fd = propagate!(self.borrowed());
        let mut data = vec![0u8; self.max_message_size];
        let mut control = vec![0u8; CONTROL_BUFFER_SIZE];

        let (received, flags, received_control) = loop {
            let mut iov = [IoSliceMut::new(&mut data)];
            match recvmsg::<()>(
                fd.as_raw_fd(),
                &mut iov,
                Some(&mut control),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(StackTraceError::from(errno)
                        .push_entry(stack_entry!().with_message("recvmsg failed")));
                }
                Ok(msg) => {
                    let Ok(cmsgs) = msg.cmsgs() else {
                        return Err(stack_err!(
                            kind = ErrorKind::Protocol,
                            "message control data truncated"
                        ));
                    };
                    break (msg.bytes, msg.flags, cmsgs.collect::<Vec<_>>());
                }
            }
        };

        // Adopt descriptors first so they are closed even when the record is
        // rejected below.
        let mut parsed = Vec::with_capacity(received_control.len());
        for entry in received_control {
            parsed.push(propagate!(ControlMessage::from_received(entry)));
        }

        ensure!(
            !flags.contains(MsgFlags::MSG_TRUNC),
            kind = ErrorKind::Protocol,
            "message payload truncated (limit {} bytes)",
            self.max_message_size
        );

        data.truncate(received);
        Ok(UnixMessage {
            data,
            control: parsed,
        })
    }
}

fn ensure_sent(sent: usize, expected: usize) -> CvdResult<()> {
    if sent != expected {
        return Err(StackTraceError::with_detail(
            ErrorKind::Io,
            format!("short sendmsg: {} of {} bytes", sent, expected),
        )
        .push_entry(stack_entry!()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::control::Credentials;
    use crate::fd::socket::unix_pair;

    fn pair() -> (UnixMessageSocket, UnixMessageSocket) {
        let (a, b) = unix_pair(libc::SOCK_SEQPACKET).unwrap();
        (UnixMessageSocket::new(a), UnixMessageSocket::new(b))
    }

    #[test]
    fn test_data_only_message() {
        let (a, b) = pair();
        a.write_message(&UnixMessage::new(b"hello".to_vec())).unwrap();
        let message = b.read_message().unwrap();
        assert_eq!(message.data, b"hello");
        assert!(message.control.is_empty());
    }

    #[test]
    fn test_file_descriptors_cross_the_socket() {
        let (a, b) = pair();
        let (read, write) = ScopedFd::pipe().unwrap();
        let rights = ControlMessage::from_file_descriptors(&[&write]).unwrap();
        a.write_message(&UnixMessage::new(b"fd".to_vec()).with_control(rights))
            .unwrap();
        drop(write);

        let message = b.read_message().unwrap();
        assert_eq!(message.data, b"fd");
        assert_eq!(message.control.len(), 1);
        let mut fds = message.control.into_iter().next().unwrap().into_scoped_fds();
        let received = fds.pop().unwrap();
        received.write_all(b"via scm").unwrap();
        drop(received);
        let mut buf = [0u8; 16];
        let n = read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"via scm");
    }

    #[test]
    fn test_credentials_round_trip() {
        let (a, b) = pair();
        b.enable_credentials(true).unwrap();
        assert!(b.credentials_enabled().unwrap());
        let message = UnixMessage::new(b"c".to_vec())
            .with_control(ControlMessage::from_credentials(Credentials::current()));
        a.write_message(&message).unwrap();
        let received = b.read_message().unwrap();
        let credentials = received
            .control
            .iter()
            .find_map(ControlMessage::credentials)
            .unwrap();
        assert_eq!(credentials, Credentials::current());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let (a, b) = pair();
        let b = b.with_max_message_size(4);
        a.write_message(&UnixMessage::new(vec![7u8; 32])).unwrap();
        let err = b.read_message().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_peer_hangup_reads_empty() {
        let (a, b) = pair();
        drop(a);
        assert!(b.read_message().unwrap().is_empty());
    }
}
