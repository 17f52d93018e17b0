//! Types shared between the cvdhost launcher library and its daemons.
//!
//! - [`errors`]: stack-trace error model and propagation macros
//! - [`transport`]: host endpoint addressing (TCP, vsock, UNIX sockets)
//! - [`protocol`]: launcher control records and signaling frame vocabulary

pub mod errors;
pub mod protocol;
pub mod transport;

pub use errors::{CvdResult, ErrorKind, StackTraceError};
pub use transport::Transport;
