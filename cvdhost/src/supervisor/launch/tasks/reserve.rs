use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use super::task_start;
use crate::pipeline::PipelineTask;
use crate::supervisor::launch::LaunchContext;
use crate::supervisor::resources::InstanceResources;

pub struct ReserveResourcesTask;

impl PipelineTask<LaunchContext> for ReserveResourcesTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let mut state = ctx.lock();
        let resources = propagate!(InstanceResources::reserve(
            &state.pools,
            state.config.display_count as usize
        ));
        let id = resources.id();
        propagate!(state.registry.register(id));
        state.guard.set_instance(id);
        state.resources = Some(resources);
        Ok(())
    }

    fn name(&self) -> &str {
        "reserve_resources"
    }
}
