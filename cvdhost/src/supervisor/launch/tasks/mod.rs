//! Launch tasks, one per file.

mod commands;
mod control;
mod layout;
mod pipes;
mod reserve;
mod start;

pub use commands::{BuildCommandsTask, build_commands};
pub use control::ControlChannelTask;
pub use layout::InstanceLayoutTask;
pub use pipes::PipesTask;
pub use reserve::ReserveResourcesTask;
pub use start::StartCohortTask;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::stack_err;

use super::LaunchContext;

/// Instance id of the launch, for log fields. Errors before reservation.
fn instance_id(ctx: &LaunchContext) -> CvdResult<u32> {
    ctx.lock()
        .instance_id()
        .ok_or_else(|| stack_err!("resources must be reserved first"))
}

fn task_start(ctx: &LaunchContext, task_name: &str) {
    let instance_id = ctx.lock().instance_id();
    tracing::debug!(task = task_name, ?instance_id, "Launch task starting");
}
