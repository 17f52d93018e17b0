//! `poll(2)` over [`ScopedFd`]s.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};

use super::ScopedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Read => PollFlags::POLLIN,
            Interest::Write => PollFlags::POLLOUT,
            Interest::ReadWrite => PollFlags::POLLIN | PollFlags::POLLOUT,
        }
    }
}

/// What `poll` reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_flags(revents: PollFlags) -> Self {
        Self {
            readable: revents.contains(PollFlags::POLLIN),
            writable: revents.contains(PollFlags::POLLOUT),
            hangup: revents.contains(PollFlags::POLLHUP),
            error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
        }
    }

    /// Anything worth acting on: data, hangup or error.
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.hangup || self.error
    }
}

/// Wait until one of `requests` is ready or `timeout` elapses (`None` waits
/// forever). Empty owners are skipped and reported as not ready.
///
/// An interrupted wait returns all-default readiness; callers loop.
pub fn poll(requests: &[(&ScopedFd, Interest)], timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
    let mut slots = Vec::with_capacity(requests.len());
    let mut pollfds = Vec::with_capacity(requests.len());
    for (fd, interest) in requests {
        match fd.borrow() {
            Some(borrowed) => {
                slots.push(Some(pollfds.len()));
                pollfds.push(PollFd::new(borrowed, interest.flags()));
            }
            None => slots.push(None),
        }
    }
    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(timeout) => PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX),
    };
    match nix::poll::poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![Readiness::default(); requests.len()]),
        Err(errno) => return Err(errno.into()),
    }
    Ok(slots
        .iter()
        .map(|slot| {
            slot.and_then(|index| pollfds[index].revents())
                .map(Readiness::from_flags)
                .unwrap_or_default()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_reports_readable_pipe() {
        let (read, write) = ScopedFd::pipe().unwrap();
        let (idle, _idle_write) = ScopedFd::pipe().unwrap();
        write.write_all(b"x").unwrap();
        let ready = poll(
            &[(&idle, Interest::Read), (&read, Interest::Read)],
            Some(Duration::from_millis(500)),
        )
        .unwrap();
        assert!(!ready[0].readable);
        assert!(ready[1].readable);
    }

    #[test]
    fn test_poll_timeout() {
        let (read, _write) = ScopedFd::pipe().unwrap();
        let ready = poll(&[(&read, Interest::Read)], Some(Duration::from_millis(10))).unwrap();
        assert!(!ready[0].any());
    }

    #[test]
    fn test_poll_reports_hangup() {
        let (read, write) = ScopedFd::pipe().unwrap();
        drop(write);
        let ready = poll(&[(&read, Interest::Read)], Some(Duration::from_millis(500))).unwrap();
        assert!(ready[0].hangup);
    }

    #[test]
    fn test_empty_fd_is_skipped() {
        let empty = ScopedFd::empty();
        let ready = poll(&[(&empty, Interest::Read)], Some(Duration::from_millis(1))).unwrap();
        assert!(!ready[0].any());
    }
}
