//! Staged execution of launcher bring-up work.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs stages in order, stopping at the first failure
//! - Stage: a group of tasks run on scoped threads or one after another
//! - Task: one unit of bring-up work sharing a context
//! ```
//!
//! ```ignore
//! let plan = ExecutionPlan::new(vec![
//!     Stage::sequential(vec![Box::new(ReserveTask)]),
//!     Stage::parallel(vec![Box::new(LogsTask), Box::new(PipesTask)]),
//! ]);
//! let metrics = PipelineExecutor::execute(plan, ctx)?;
//! metrics.log_summary();
//! ```

mod executor;
mod metrics;
mod stage;
mod task;

pub use executor::{ExecutionPlan, PipelineExecutor};
pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
