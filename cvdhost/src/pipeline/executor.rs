use std::thread;
use std::time::Instant;

use cvdhost_shared::errors::{CvdResult, StackTraceError};
use cvdhost_shared::stack_err;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage of `plan` in order and time each task.
    ///
    /// A parallel stage waits for all of its tasks before reporting the
    /// first failure, so no task outlives the call.
    pub fn execute<Ctx>(plan: ExecutionPlan<Ctx>, ctx: Ctx) -> CvdResult<PipelineMetrics>
    where
        Ctx: Clone + Send,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in plan.stages().into_iter().enumerate() {
            let execution = stage.execution;
            let stage_start = Instant::now();

            let tasks = match execution {
                ExecutionMode::Parallel => run_parallel(stage.tasks, &ctx)?,
                ExecutionMode::Sequential => {
                    let mut tasks = Vec::new();
                    for task in stage.tasks {
                        tasks.push(run_timed(task, ctx.clone())?);
                    }
                    tasks
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                execution,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}

fn run_timed<Ctx>(task: BoxedTask<Ctx>, ctx: Ctx) -> CvdResult<TaskMetrics> {
    let name = task.name().to_string();
    let start = Instant::now();
    tracing::debug!(task = %name, "Starting launch task");
    task.run(ctx).inspect_err(|err| {
        tracing::error!(task = %name, "Launch task failed: {}", err);
    })?;
    Ok(TaskMetrics {
        name,
        duration_ms: start.elapsed().as_millis(),
    })
}

fn run_parallel<Ctx>(tasks: Vec<BoxedTask<Ctx>>, ctx: &Ctx) -> CvdResult<Vec<TaskMetrics>>
where
    Ctx: Clone + Send,
{
    let results: Vec<CvdResult<TaskMetrics>> = thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let ctx = ctx.clone();
                let name = task.name().to_string();
                (name, scope.spawn(move || run_timed(task, ctx)))
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err::<TaskMetrics, StackTraceError>(stack_err!("launch task {} panicked", name))
                })
            })
            .collect()
    });
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use cvdhost_shared::ensure;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record(&'static str);

    impl PipelineTask<Log> for Record {
        fn run(self: Box<Self>, ctx: Log) -> CvdResult<()> {
            ctx.lock().push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    impl PipelineTask<Log> for Fail {
        fn run(self: Box<Self>, _ctx: Log) -> CvdResult<()> {
            ensure!(false, "fail task");
            Ok(())
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[test]
    fn test_sequential_stages_run_in_order() {
        let log = Log::default();
        let plan = ExecutionPlan::new(vec![
            Stage::sequential(vec![Box::new(Record("a")) as BoxedTask<Log>, Box::new(Record("b"))]),
            Stage::sequential(vec![Box::new(Record("c")) as BoxedTask<Log>]),
        ]);
        let metrics = PipelineExecutor::execute(plan, Arc::clone(&log)).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(metrics.stages.len(), 2);
        assert!(metrics.task_duration_ms("c").is_some());
        assert!(metrics.task_duration_ms("missing").is_none());
    }

    #[test]
    fn test_parallel_stage_runs_every_task() {
        let log = Log::default();
        let plan = ExecutionPlan::new(vec![Stage::parallel(vec![
            Box::new(Record("x")) as BoxedTask<Log>,
            Box::new(Record("y")),
            Box::new(Record("z")),
        ])]);
        let metrics = PipelineExecutor::execute(plan, Arc::clone(&log)).unwrap();
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["x", "y", "z"]);
        assert_eq!(metrics.stages[0].execution, ExecutionMode::Parallel);
        assert_eq!(metrics.stages[0].tasks.len(), 3);
    }

    #[test]
    fn test_failure_stops_later_stages() {
        let log = Log::default();
        let plan = ExecutionPlan::new(vec![
            Stage::parallel(vec![Box::new(Record("a")) as BoxedTask<Log>, Box::new(Fail)]),
            Stage::sequential(vec![Box::new(Record("never")) as BoxedTask<Log>]),
        ]);
        let err = PipelineExecutor::execute(plan, Arc::clone(&log)).unwrap_err();
        assert!(err.message().contains("fail task"));
        assert_eq!(*log.lock(), vec!["a"]);
    }
}
