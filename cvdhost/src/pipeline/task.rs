use cvdhost_shared::errors::CvdResult;

/// One unit of work in a pipeline.
///
/// Each task receives its own clone of the context; shared outputs go
/// through interior mutability in the context.
pub trait PipelineTask<Ctx>: Send {
    fn run(self: Box<Self>, ctx: Ctx) -> CvdResult<()>;

    /// Stable name used in metrics and logs.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
