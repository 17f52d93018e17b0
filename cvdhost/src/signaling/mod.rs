//! WebRTC signaling hub: pairs device connections with client connections
//! and forwards opaque JSON between them.

pub mod handler;
pub mod registry;
pub mod server;

pub use handler::{Disposition, Role, SignalingHandler};
pub use registry::{DeviceRegistry, RegistryError, SignalingEndpoint};
pub use server::{SignalingServer, serve_connection};
