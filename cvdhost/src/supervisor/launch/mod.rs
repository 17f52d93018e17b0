//! Instance bring-up as a table of timed stages.
//!
//! ```text
//!   1. ReserveResources           (id, adb port, cid, webrtc block)
//!   2. InstanceLayout  ─┬─        (directories, stale sockets)
//!      CreatePipes     ─┘         (console and kernel-log pipes)
//!   3. BuildCommands              (argv, fds, log files, stoppers)
//!   4. StartCohort                (spawn members, kernel-log drain)
//!   5. ControlChannel             (control socket, snapshot coordinator)
//! ```
//!
//! `CleanupGuard` stops whatever was started when a stage fails.

mod tasks;
pub mod types;

use std::sync::Arc;

use parking_lot::Mutex;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{propagate, stack_err};

use super::instance::RunningInstance;
use super::registry::InstanceRegistry;
use super::resources::ResourcePools;
use crate::config::LauncherConfig;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, Stage};

pub use tasks::build_commands;
use tasks::{
    BuildCommandsTask, ControlChannelTask, InstanceLayoutTask, PipesTask, ReserveResourcesTask,
    StartCohortTask,
};
pub use types::{CleanupGuard, InstanceLayout, LaunchPipes, LaunchState};

pub type LaunchContext = Arc<Mutex<LaunchState>>;

fn execution_plan() -> ExecutionPlan<LaunchContext> {
    let stages: Vec<Stage<BoxedTask<LaunchContext>>> = vec![
        Stage::sequential(vec![Box::new(ReserveResourcesTask)]),
        Stage::parallel(vec![Box::new(InstanceLayoutTask), Box::new(PipesTask)]),
        Stage::sequential(vec![Box::new(BuildCommandsTask)]),
        Stage::sequential(vec![Box::new(StartCohortTask)]),
        Stage::sequential(vec![Box::new(ControlChannelTask)]),
    ];
    ExecutionPlan::new(stages)
}

/// Bring up one instance. On failure everything started so far is stopped
/// and every reservation is returned.
pub fn launch(
    config: LauncherConfig,
    pools: Arc<ResourcePools>,
    registry: InstanceRegistry,
) -> CvdResult<RunningInstance> {
    let ctx: LaunchContext = Arc::new(Mutex::new(LaunchState::new(config, pools, registry)));
    let metrics = propagate!(PipelineExecutor::execute(execution_plan(), Arc::clone(&ctx)));
    metrics.log_summary();

    let state = propagate!(
        Arc::try_unwrap(ctx)
            .map(Mutex::into_inner)
            .map_err(|_| stack_err!("launch context still shared"))
    );
    let LaunchState {
        resources,
        layout,
        cohort,
        registry,
        latch,
        stop_requested,
        coordinator,
        kernel_log,
        mut guard,
        ..
    } = state;

    let (Some(resources), Some(layout)) = (resources, layout) else {
        return Err(stack_err!("launch finished without resources or layout"));
    };
    guard.disarm();
    Ok(RunningInstance {
        resources,
        layout,
        cohort,
        registry,
        latch,
        stop_requested,
        coordinator,
        kernel_log,
        metrics,
    })
}
