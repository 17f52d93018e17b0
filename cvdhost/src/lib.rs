//! Host-side launcher core for cloud Android virtual devices.
//!
//! - [`allocator`]: pools of ids, ports and cids with scoped reservations
//! - [`process`]: subprocess builder, stoppers and wait helpers
//! - [`fd`]: owned descriptors and socket plumbing
//! - [`relay`]: TCP↔vsock proxy and console↔PTY forwarder
//! - [`signaling`]: WebSocket hub pairing devices with clients
//! - [`snapshot`]: suspend latch and control-socket coordinator
//! - [`supervisor`]: staged instance bring-up and supervision
//! - [`metrics`]: System V queue drain for device events

pub mod allocator;
pub mod config;
pub mod control_env;
pub mod fd;
pub mod flags;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod relay;
pub mod signaling;
pub mod snapshot;
pub mod supervisor;

pub use cvdhost_shared::{CvdResult, ErrorKind, StackTraceError, Transport};
