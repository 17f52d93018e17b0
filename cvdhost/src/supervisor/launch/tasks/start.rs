//! Task: start every command and the kernel-log drain.

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::{instance_id, task_start};
use crate::pipeline::PipelineTask;
use crate::process::SubprocessOptions;
use crate::supervisor::kernel_log::KernelLogDrain;
use crate::supervisor::launch::LaunchContext;

pub struct StartCohortTask;

impl PipelineTask<LaunchContext> for StartCohortTask {
    fn run(self: Box<Self>, ctx: LaunchContext) -> CvdResult<()> {
        task_start(&ctx, self.name());
        let id = propagate!(instance_id(&ctx));
        let mut state = ctx.lock();
        let pipes = propagate!(state.pipes.take().ok_or_else(|| stack_err!("pipes not created")));
        let kernel_log_path = propagate!(
            state
                .layout
                .as_ref()
                .map(|layout| layout.kernel_log.clone())
                .ok_or_else(|| stack_err!("layout not prepared"))
        );

        let options = SubprocessOptions::default().in_group(true).exit_with_parent(true);
        for command in std::mem::take(&mut state.commands) {
            let subprocess = propagate!(
                command.start(options.clone()),
                "starting {} for instance {}",
                command.short_name(),
                id
            );
            state.cohort.push(subprocess);
        }

        let (kernel_log_read, kernel_log_write) = pipes.kernel_log;
        // Only the children may hold write ends, so the drain ends with them.
        drop(kernel_log_write);
        state.kernel_log = Some(propagate!(KernelLogDrain::start(kernel_log_read, &kernel_log_path)));
        tracing::info!(instance_id = id, members = state.cohort.len(), "Cohort started");
        Ok(())
    }

    fn name(&self) -> &str {
        "start_cohort"
    }
}
