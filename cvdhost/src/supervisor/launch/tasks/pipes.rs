use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use super::task_start;
use crate::pipeline::PipelineTask;
use crate::supervisor::launch::LaunchContext;
use crate::supervisor::launch::types::LaunchPipes;

pub struct PipesTask;

impl PipelineTask<LaunchContext> for PipesTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let pipes = propagate!(LaunchPipes::create());
        ctx.lock().pipes = Some(pipes);
        Ok(())
    }

    fn name(&self) -> &str {
        "create_pipes"
    }
}
