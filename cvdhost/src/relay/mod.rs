//! Byte relays between host endpoints and the guest.
//!
//! - [`vsock_proxy`]: TCP↔vsock (or any stream transport) connection bridge
//! - [`console`]: serial console ↔ PTY forwarder with a single writer thread
//! - [`pty`]: pty allocation and symlink publication

pub mod console;
pub mod pty;
pub mod vsock_proxy;

pub use console::{ConsoleForwarder, ConsoleHandle};
pub use vsock_proxy::{
    Acceptor, Connector, ListenerAcceptor, ProxyServer, RetryPolicy, connect_with_retry,
};
