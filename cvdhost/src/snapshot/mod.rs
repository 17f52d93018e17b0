//! Suspend, resume and snapshot coordination.

pub mod coordinator;
pub mod latch;

pub use coordinator::{CoordinatorHandle, LauncherHooks, NOT_SUSPENDED_MESSAGE, SnapshotCoordinator};
pub use latch::{ResumedGuard, SnapshotLatch};
