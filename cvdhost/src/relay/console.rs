//! Serial console ↔ PTY forwarder.
//!
//! One reader thread polls the console output and the current pty master;
//! one writer thread performs every write, taken from a shared queue. The
//! reader never does I/O while holding the queue lock.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::pty::{open_pty, publish_symlink};
use crate::fd::{Interest, ScopedFd, poll};

const READ_CHUNK: usize = 4096;
const QUEUE_CAPACITY: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where a queued frame goes. Decides how write failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Log,
    KernelLog,
    /// The pty master; fails whenever no client is attached.
    Client,
    ConsoleIn,
}

struct Frame {
    target: WriteTarget,
    fd: Arc<ScopedFd>,
    data: Arc<[u8]>,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Bounded FIFO of pending writes.
#[derive(Default)]
struct WriteQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl WriteQueue {
    fn push(&self, frame: Frame) {
        let mut state = self.state.lock();
        while state.frames.len() >= QUEUE_CAPACITY && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return;
        }
        state.frames.push_back(frame);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Next frame, or `None` once closed and drained.
    fn pop(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Builder for the forwarder threads.
pub struct ConsoleForwarder {
    console_path: PathBuf,
    console_in: Arc<ScopedFd>,
    console_out: ScopedFd,
    log: Arc<ScopedFd>,
    kernel_log: Option<Arc<ScopedFd>>,
}

impl ConsoleForwarder {
    /// `console_in` receives client keystrokes for the guest, `console_out`
    /// carries guest output, `log` records all of it. Clients attach through
    /// the pty published at `console_path`.
    pub fn new(
        console_path: impl Into<PathBuf>,
        console_in: ScopedFd,
        console_out: ScopedFd,
        log: ScopedFd,
    ) -> Self {
        Self {
            console_path: console_path.into(),
            console_in: Arc::new(console_in),
            console_out,
            log: Arc::new(log),
            kernel_log: None,
        }
    }

    /// Also copy guest output to the shared kernel-log pipe.
    pub fn with_kernel_log(mut self, kernel_log: ScopedFd) -> Self {
        self.kernel_log = Some(Arc::new(kernel_log));
        self
    }

    /// Publish the first pty and start both threads.
    pub fn start(self) -> CvdResult<ConsoleHandle> {
        let client = propagate!(Client::open(&self.console_path));
        let queue = Arc::new(WriteQueue::default());

        let writer = {
            let queue = Arc::clone(&queue);
            propagate!(
                thread::Builder::new()
                    .name("console-writer".into())
                    .spawn(move || write_loop(&queue)),
                "spawning console writer"
            )
        };
        let reader = {
            let queue = Arc::clone(&queue);
            propagate!(
                thread::Builder::new()
                    .name("console-reader".into())
                    .spawn(move || {
                        let result = ReadLoop {
                            forwarder: self,
                            client,
                            queue: Arc::clone(&queue),
                        }
                        .run();
                        queue.close();
                        result
                    }),
                "spawning console reader"
            )
        };
        Ok(ConsoleHandle {
            reader: Some(reader),
            writer: Some(writer),
            queue,
        })
    }
}

/// Running forwarder.
pub struct ConsoleHandle {
    reader: Option<JoinHandle<CvdResult<()>>>,
    writer: Option<JoinHandle<()>>,
    queue: Arc<WriteQueue>,
}

impl ConsoleHandle {
    /// Wait for the console output to end and every queued write to finish.
    pub fn join(mut self) -> CvdResult<()> {
        let result = match self.reader.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(stack_err!("console reader panicked")),
            None => Ok(()),
        };
        self.queue.close();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                return Err(stack_err!("console writer panicked"));
            }
        }
        result
    }
}

/// The pty currently offered to clients.
struct Client {
    master: Arc<ScopedFd>,
    slave_path: PathBuf,
}

impl Client {
    fn open(console_path: &Path) -> CvdResult<Self> {
        let pty = propagate!(open_pty());
        propagate!(publish_symlink(&pty.slave_path, console_path));
        tracing::debug!(pty = %pty.slave_path.display(), link = %console_path.display(), "Console pty ready");
        Ok(Self {
            master: Arc::new(pty.master),
            slave_path: pty.slave_path,
        })
    }
}

struct ReadLoop {
    forwarder: ConsoleForwarder,
    client: Client,
    queue: Arc<WriteQueue>,
}

impl ReadLoop {
    fn run(mut self) -> CvdResult<()> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let ready = propagate!(poll(
                &[
                    (&self.forwarder.console_out, Interest::Read),
                    (self.client.master.as_ref(), Interest::Read),
                ],
                Some(POLL_INTERVAL),
            ));

            if ready[0].any() {
                match self.forwarder.console_out.read(&mut buf) {
                    Ok(0) => {
                        tracing::info!("Console output closed");
                        return Ok(());
                    }
                    Ok(n) => self.enqueue_console_output(&buf[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        return Err(propagate_io(err, "reading console output"));
                    }
                }
            }

            if ready[1].any() {
                match self.client.master.read(&mut buf) {
                    Ok(n) if n > 0 => self.queue.push(Frame {
                        target: WriteTarget::ConsoleIn,
                        fd: Arc::clone(&self.forwarder.console_in),
                        data: Arc::from(&buf[..n]),
                    }),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    _ => {
                        // Client side went away: offer a fresh pty.
                        tracing::debug!(pty = %self.client.slave_path.display(), "Console client detached");
                        self.client = propagate!(Client::open(&self.forwarder.console_path));
                    }
                }
            }
        }
    }

    fn enqueue_console_output(&self, bytes: &[u8]) {
        let data: Arc<[u8]> = Arc::from(bytes);
        self.queue.push(Frame {
            target: WriteTarget::Log,
            fd: Arc::clone(&self.forwarder.log),
            data: Arc::clone(&data),
        });
        self.queue.push(Frame {
            target: WriteTarget::Client,
            fd: Arc::clone(&self.client.master),
            data: Arc::clone(&data),
        });
        if let Some(kernel_log) = &self.forwarder.kernel_log {
            self.queue.push(Frame {
                target: WriteTarget::KernelLog,
                fd: Arc::clone(kernel_log),
                data,
            });
        }
    }
}

fn propagate_io(err: std::io::Error, what: &str) -> cvdhost_shared::StackTraceError {
    cvdhost_shared::StackTraceError::from(err)
        .push_entry(cvdhost_shared::stack_entry!().with_message(what.to_string()))
}

fn write_loop(queue: &WriteQueue) {
    while let Some(frame) = queue.pop() {
        let Err(err) = frame.fd.write_all(&frame.data) else {
            continue;
        };
        match frame.target {
            // Expected whenever nobody has the pty open.
            WriteTarget::Client => tracing::trace!("Console client write dropped: {}", err),
            WriteTarget::ConsoleIn => {
                tracing::error!("Dropping {} bytes for console input: {}", frame.data.len(), err)
            }
            WriteTarget::Log | WriteTarget::KernelLog => {
                tracing::warn!(target_kind = ?frame.target, "Console log write failed: {}", err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drains_after_close() {
        let queue = WriteQueue::default();
        let (read, write) = ScopedFd::pipe().unwrap();
        let fd = Arc::new(write);
        for chunk in [b"a".as_slice(), b"b", b"c"] {
            queue.push(Frame {
                target: WriteTarget::Log,
                fd: Arc::clone(&fd),
                data: Arc::from(chunk),
            });
        }
        queue.close();
        write_loop(&queue);
        let mut buf = [0u8; 8];
        let n = read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = WriteQueue::default();
        queue.close();
        let (_read, write) = ScopedFd::pipe().unwrap();
        queue.push(Frame {
            target: WriteTarget::Log,
            fd: Arc::new(write),
            data: Arc::from(b"x".as_slice()),
        });
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_log_receives_output_without_client() {
        if !super::super::pty::pty_supported() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (console_out_read, console_out_write) = ScopedFd::pipe().unwrap();
        let (_console_in_read, console_in_write) = ScopedFd::pipe().unwrap();
        let (log_read, log_write) = ScopedFd::pipe().unwrap();
        let handle = ConsoleForwarder::new(
            dir.path().join("console"),
            console_in_write,
            console_out_read,
            log_write,
        )
        .start()
        .unwrap();
        console_out_write.write_all(b"first\nsecond\n").unwrap();
        drop(console_out_write);
        handle.join().unwrap();

        let mut log = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = log_read.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            log.extend_from_slice(&buf[..n]);
        }
        assert_eq!(log, b"first\nsecond\n");
    }
}
