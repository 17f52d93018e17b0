//! Brings up and supervises virtual device instances.
//!
//! [`Supervisor`] owns the resource pools and the instance table.
//! [`Supervisor::launch`] runs the staged bring-up in [`launch`] and returns
//! a [`RunningInstance`], whose [`wait`](RunningInstance::wait) blocks until
//! a stop request or the first unexpected member exit.

pub mod cohort;
pub mod instance;
pub mod kernel_log;
pub mod launch;
pub mod registry;
pub mod resources;

use std::sync::Arc;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use crate::config::LauncherConfig;

pub use cohort::{Cohort, ExitReport};
pub use instance::{InstanceHooks, RunningInstance, SNAPSHOT_META_FILE};
pub use kernel_log::KernelLogDrain;
pub use launch::InstanceLayout;
pub use registry::{InstanceRegistry, InstanceStatus};
pub use resources::{InstanceResources, ResourcePools};

pub struct Supervisor {
    config: LauncherConfig,
    pools: Arc<ResourcePools>,
    registry: InstanceRegistry,
}

impl Supervisor {
    pub fn new(config: LauncherConfig) -> CvdResult<Self> {
        propagate!(config.validate());
        let pools = ResourcePools::from_config(&config);
        Ok(Self {
            config,
            pools,
            registry: InstanceRegistry::new(),
        })
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Launch one more instance from the shared pools.
    pub fn launch(&self) -> CvdResult<RunningInstance> {
        Ok(propagate!(launch::launch(
            self.config.clone(),
            Arc::clone(&self.pools),
            self.registry.clone()
        )))
    }
}
