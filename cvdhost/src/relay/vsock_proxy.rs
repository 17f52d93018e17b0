//! Stream proxy between a listening socket and a dialed target.
//!
//! Used as the TCP↔vsock bridge for adb: each accepted connection is paired
//! with a freshly dialed target connection and two detached threads copy
//! bytes in each direction until either side ends.

use std::collections::HashSet;
use std::net::Shutdown;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cvdhost_shared::Transport;
use cvdhost_shared::errors::{CvdResult, StackTraceError};
use cvdhost_shared::propagate;

use crate::fd::{ScopedFd, socket};
use crate::snapshot::SnapshotLatch;

/// Bytes moved per read.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Dial errnos that retrying cannot fix.
const NON_RECOVERABLE_ERRNOS: [i32; 4] = [
    libc::EACCES,
    libc::EAFNOSUPPORT,
    libc::EINVAL,
    libc::EPROTONOSUPPORT,
];

pub fn is_recoverable(err: &StackTraceError) -> bool {
    err.errno()
        .is_none_or(|errno| !NON_RECOVERABLE_ERRNOS.contains(&errno))
}

/// Source of accepted connections.
pub trait Acceptor: Send {
    fn accept(&mut self) -> CvdResult<ScopedFd>;

    fn describe(&self) -> String;
}

/// Dials the far side for each accepted connection.
pub trait Connector: Send + Sync {
    fn connect(&self) -> CvdResult<ScopedFd>;

    fn describe(&self) -> String;
}

/// Listening socket bound to a [`Transport`].
#[derive(Debug)]
pub struct ListenerAcceptor {
    listener: ScopedFd,
    transport: Transport,
}

impl ListenerAcceptor {
    pub fn bind(transport: Transport) -> CvdResult<Self> {
        let listener = propagate!(socket::listen(&transport), "listening on {}", transport);
        Ok(Self {
            listener,
            transport,
        })
    }

    pub fn from_listener(listener: ScopedFd, transport: Transport) -> Self {
        Self {
            listener,
            transport,
        }
    }

    pub fn listener(&self) -> &ScopedFd {
        &self.listener
    }
}

impl Acceptor for ListenerAcceptor {
    fn accept(&mut self) -> CvdResult<ScopedFd> {
        Ok(propagate!(socket::accept(&self.listener), "accepting on {}", self.transport))
    }

    fn describe(&self) -> String {
        self.transport.to_uri()
    }
}

impl Connector for Transport {
    fn connect(&self) -> CvdResult<ScopedFd> {
        socket::connect(self)
    }

    fn describe(&self) -> String {
        self.to_uri()
    }
}

/// Exponential dial backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

/// Dial until success, a non-recoverable errno, or the attempt budget runs
/// out. Each distinct errno is logged once.
pub fn connect_with_retry(connector: &dyn Connector, policy: &RetryPolicy) -> CvdResult<ScopedFd> {
    let mut reported = HashSet::new();
    let mut delay = policy.initial_delay;
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match connector.connect() {
            Ok(fd) => {
                if attempt > 1 {
                    tracing::info!(peer = %connector.describe(), attempt, "Connected after retrying");
                }
                return Ok(fd);
            }
            Err(err) => err,
        };
        if !is_recoverable(&err) {
            return Err(err.push_entry(cvdhost_shared::stack_entry!().with_message(format!(
                "non-recoverable error dialing {}",
                connector.describe()
            ))));
        }
        if reported.insert(err.errno().unwrap_or(0)) {
            tracing::warn!(peer = %connector.describe(), "Dial failed, retrying: {}", err.message());
        }
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(err.push_entry(cvdhost_shared::stack_entry!().with_message(format!(
                "giving up on {} after {} attempts",
                connector.describe(),
                attempt
            ))));
        }
        thread::sleep(delay);
        delay = (delay * 2).min(policy.max_delay);
    }
}

/// Copy `from` into `to` until EOF or a write error, then half-close `to`.
///
/// When a latch is given, each chunk is written under a resumed guard so a
/// suspended instance sees no traffic.
pub fn pump(from: &ScopedFd, to: &ScopedFd, latch: Option<&SnapshotLatch>) -> u64 {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(fd = from.raw(), "Relay read ended: {}", err);
                break;
            }
        };
        let _guard = latch.map(SnapshotLatch::wait_initialized_or_resumed);
        if let Err(err) = to.write_all(&buf[..n]) {
            tracing::debug!(fd = to.raw(), "Relay write failed: {}", err);
            break;
        }
        total += n as u64;
    }
    // The peer may already be gone.
    let _ = to.shutdown(Shutdown::Write);
    total
}

/// Accepts connections and bridges each to a new target connection.
pub struct ProxyServer<A: Acceptor, C: Connector> {
    acceptor: A,
    connector: Arc<C>,
    policy: RetryPolicy,
    latch: Option<Arc<SnapshotLatch>>,
}

impl<A: Acceptor, C: Connector + 'static> ProxyServer<A, C> {
    pub fn new(acceptor: A, connector: C) -> Self {
        Self {
            acceptor,
            connector: Arc::new(connector),
            policy: RetryPolicy::default(),
            latch: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_latch(mut self, latch: Arc<SnapshotLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    /// Accept one connection, dial the target, and start both pump threads.
    pub fn serve_one(&mut self) -> CvdResult<()> {
        let client = propagate!(self.acceptor.accept());
        tracing::debug!(from = %self.acceptor.describe(), "Accepted connection");
        let target = propagate!(
            connect_with_retry(self.connector.as_ref(), &self.policy),
            "dialing {}",
            self.connector.describe()
        );
        spawn_pair(client, target, self.latch.clone());
        Ok(())
    }

    /// Serve forever. Accept and recoverable dial failures are logged; a
    /// non-recoverable dial failure is returned.
    pub fn run(&mut self) -> CvdResult<()> {
        tracing::info!(
            from = %self.acceptor.describe(),
            to = %self.connector.describe(),
            "Proxy running"
        );
        loop {
            if let Err(err) = self.serve_one() {
                if !is_recoverable(&err) {
                    return Err(err);
                }
                tracing::error!("Proxy connection failed: {}", err);
            }
        }
    }
}

/// Start the two detached pump threads for one connection pair.
pub fn spawn_pair(a: ScopedFd, b: ScopedFd, latch: Option<Arc<SnapshotLatch>>) {
    let a = Arc::new(a);
    let b = Arc::new(b);
    for (from, to, name) in [
        (Arc::clone(&a), Arc::clone(&b), "relay-a2b"),
        (b, a, "relay-b2a"),
    ] {
        let latch = latch.clone();
        let spawned = thread::Builder::new().name(name.into()).spawn(move || {
            let bytes = pump(&from, &to, latch.as_deref());
            tracing::debug!(direction = name, bytes, "Relay direction finished");
        });
        if let Err(err) = spawned {
            tracing::error!(direction = name, "Could not start relay thread: {}", err);
        }
    }
}

/// Park the calling thread forever. Used instead of exiting on
/// non-recoverable listener errors so the process is not restarted in a loop.
pub fn sleep_forever() -> ! {
    loop {
        thread::park();
    }
}
