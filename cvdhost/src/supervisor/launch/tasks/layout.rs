use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use super::{instance_id, task_start};
use crate::pipeline::PipelineTask;
use crate::supervisor::launch::LaunchContext;
use crate::supervisor::launch::types::InstanceLayout;

/// Creates the instance directory tree.
pub struct InstanceLayoutTask;

impl PipelineTask<LaunchContext> for InstanceLayoutTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let id = propagate!(instance_id(&ctx));
        // Filesystem work happens outside the lock so the pipe task can run.
        let layout = InstanceLayout::new(&ctx.lock().config, id);
        propagate!(layout.prepare(), "preparing instance {}", id);
        tracing::info!(instance_id = id, dir = %layout.instance_dir.display(), "Instance layout ready");
        ctx.lock().layout = Some(layout);
        Ok(())
    }

    fn name(&self) -> &str {
        "instance_layout"
    }
}
