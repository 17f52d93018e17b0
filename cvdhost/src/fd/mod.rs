//! File descriptor ownership and socket plumbing.
//!
//! [`ScopedFd`] owns one descriptor. The [`socket`] factories build vsock,
//! TCP and UNIX endpoints on top of it, and [`UnixMessageSocket`] exchanges
//! records carrying [`ControlMessage`]s (`SCM_RIGHTS`, `SCM_CREDENTIALS`).

pub mod control;
pub mod message;
pub mod poll;
mod scoped;
pub mod socket;

pub use control::{ControlMessage, Credentials};
pub use message::{UnixMessage, UnixMessageSocket};
pub use poll::{Interest, Readiness, poll};
pub use scoped::ScopedFd;
