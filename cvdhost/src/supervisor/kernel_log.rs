//! Copies the shared kernel-log pipe into `kernel.log`.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use nix::fcntl::OFlag;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use crate::fd::ScopedFd;

pub struct KernelLogDrain {
    path: PathBuf,
    thread: Option<JoinHandle<CvdResult<u64>>>,
}

impl KernelLogDrain {
    /// Start copying `pipe_read` until every write end is closed.
    pub fn start(pipe_read: ScopedFd, path: &Path) -> CvdResult<Self> {
        let file = propagate!(
            ScopedFd::open(path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND, 0o644),
            "opening {}",
            path.display()
        );
        let thread = propagate!(
            thread::Builder::new()
                .name("kernel-log-drain".into())
                .spawn(move || drain(&pipe_read, &file)),
            "spawning kernel log drain"
        );
        Ok(Self {
            path: path.to_path_buf(),
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for end-of-file on the pipe. Returns the bytes copied.
    pub fn join(mut self) -> CvdResult<u64> {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(stack_err!("kernel log drain panicked")),
            None => Ok(0),
        }
    }
}

fn drain(from: &ScopedFd, to: &ScopedFd) -> CvdResult<u64> {
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = propagate!(from.read(&mut buf), "reading kernel log pipe");
        if n == 0 {
            tracing::debug!(bytes = total, "Kernel log pipe closed");
            return Ok(total);
        }
        propagate!(to.write_all(&buf[..n]), "writing kernel log");
        total += n as u64;
    }
}
