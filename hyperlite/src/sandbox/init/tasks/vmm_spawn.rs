//! Task: VMM Spawn - launch the hypervisor and connect its monitor.

use super::{InitCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::vmm::LaunchSpec;
use async_trait::async_trait;
use hyperlite_shared::{HyperliteError, HyperliteResult};

pub struct VmmSpawnTask;

#[async_trait]
impl PipelineTask<InitCtx> for VmmSpawnTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let mut driver = ctx
            .guard
            .take_driver()
            .ok_or_else(|| HyperliteError::Internal("driver was not set".into()))?;
        let spec = LaunchSpec {
            sandbox_id: sandbox_id.clone(),
            boot: ctx.boot.clone(),
            layout: ctx.layout.clone(),
        };

        let result = driver.launch(&spec, ctx.events.clone()).await;
        let pid = driver.pid();
        // Back under the guard so a failed launch still gets killed.
        ctx.guard.set_driver(driver);
        result.inspect_err(|e| log_task_error(&sandbox_id, task_name, e))?;

        tracing::info!(sandbox_id = %sandbox_id, pid = ?pid, "Hypervisor launched");
        Ok(())
    }

    fn name(&self) -> &str {
        "vmm_spawn"
    }
}
