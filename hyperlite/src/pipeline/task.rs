use async_trait::async_trait;
use hyperlite_shared::HyperliteResult;

/// A unit of work in a pipeline.
///
/// The context is cloned per task; use interior mutability for writes.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> HyperliteResult<()>;

    /// Stable name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
