//! Thread-safe table of the instances a supervisor launched.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use cvdhost_shared::ensure;
use cvdhost_shared::errors::{CvdResult, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Suspended,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceStatus {
    /// Whether the cohort may still have live members.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Suspended | Self::Stopping)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared handle; clones see the same table.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<HashMap<u32, InstanceStatus>>>,
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry").finish()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new instance as `Starting`. An active entry with the same id
    /// is an invariant breach.
    pub fn register(&self, instance_id: u32) -> CvdResult<()> {
        let mut inner = self.inner.write();
        let active = inner.get(&instance_id).is_some_and(|status| status.is_active());
        ensure!(
            !active,
            kind = ErrorKind::Invariant,
            "instance {} already registered",
            instance_id
        );
        tracing::debug!(instance_id, "Registering instance");
        inner.insert(instance_id, InstanceStatus::Starting);
        Ok(())
    }

    pub fn set_status(&self, instance_id: u32, status: InstanceStatus) {
        let mut inner = self.inner.write();
        let previous = inner.insert(instance_id, status);
        tracing::debug!(instance_id, ?previous, %status, "Instance status changed");
    }

    pub fn status(&self, instance_id: u32) -> Option<InstanceStatus> {
        self.inner.read().get(&instance_id).copied()
    }

    pub fn remove(&self, instance_id: u32) -> Option<InstanceStatus> {
        self.inner.write().remove(&instance_id)
    }

    /// Ids of instances whose cohort may still be running, ascending.
    pub fn active(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .inner
            .read()
            .iter()
            .filter(|(_, status)| status.is_active())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_transition() {
        let registry = InstanceRegistry::new();
        registry.register(1).unwrap();
        assert_eq!(registry.status(1), Some(InstanceStatus::Starting));
        registry.set_status(1, InstanceStatus::Running);
        assert_eq!(registry.clone().status(1), Some(InstanceStatus::Running));
        assert_eq!(registry.active(), vec![1]);
    }

    #[test]
    fn test_duplicate_active_registration_rejected() {
        let registry = InstanceRegistry::new();
        registry.register(4).unwrap();
        let err = registry.register(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);

        registry.set_status(4, InstanceStatus::Stopped);
        registry.register(4).unwrap();
    }

    #[test]
    fn test_inactive_instances_filtered() {
        let registry = InstanceRegistry::new();
        for id in [3, 1, 2] {
            registry.register(id).unwrap();
        }
        registry.set_status(2, InstanceStatus::Failed);
        assert_eq!(registry.active(), vec![1, 3]);
        assert_eq!(registry.remove(2), Some(InstanceStatus::Failed));
        assert_eq!(registry.status(2), None);
    }
}
