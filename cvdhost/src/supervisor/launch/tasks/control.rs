//! Task: open the control socket and start the snapshot coordinator.

use std::sync::Arc;
use std::time::Duration;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::{instance_id, task_start};
use crate::fd::socket;
use crate::pipeline::PipelineTask;
use crate::snapshot::SnapshotCoordinator;
use crate::supervisor::instance::InstanceHooks;
use crate::supervisor::launch::LaunchContext;
use crate::supervisor::registry::InstanceStatus;

pub struct ControlChannelTask;

impl PipelineTask<LaunchContext> for ControlChannelTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let id = propagate!(instance_id(&ctx));
        let mut state = ctx.lock();
        let layout = propagate!(state.layout.clone().ok_or_else(|| stack_err!("layout not prepared")));

        let listener = propagate!(
            socket::unix_server(&layout.control_socket, 0o660),
            "listening on {}",
            layout.control_socket.display()
        );
        let hooks = InstanceHooks::new(
            id,
            layout.instance_dir.clone(),
            Arc::clone(&state.cohort),
            state.registry.clone(),
            Arc::clone(&state.stop_requested),
        );
        let coordinator = SnapshotCoordinator::new(Arc::clone(&state.latch), Arc::new(hooks))
            .with_suspend_timeout(Duration::from_secs(state.config.suspend_timeout_secs));
        state.coordinator = Some(propagate!(coordinator.spawn(listener)));
        state.registry.set_status(id, InstanceStatus::Running);
        tracing::info!(
            instance_id = id,
            socket = %layout.control_socket.display(),
            "Control channel ready"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "control_channel"
    }
}
