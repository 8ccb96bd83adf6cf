//! Task: VMM Attach - adopt a hypervisor that is already running.
//!
//! Used when a control plane restarts and recovers persisted sandboxes.

use super::{InitCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::sandbox::init::types::BootMode;
use crate::vmm::LaunchSpec;
use async_trait::async_trait;
use hyperlite_shared::{HyperliteError, HyperliteResult};

pub struct VmmAttachTask;

#[async_trait]
impl PipelineTask<InitCtx> for VmmAttachTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let BootMode::Reattach(state) = ctx.mode.clone() else {
            return Err(HyperliteError::Internal(
                "vmm_attach requires a persisted driver state".into(),
            ));
        };
        let mut driver = ctx
            .guard
            .take_driver()
            .ok_or_else(|| HyperliteError::Internal("driver was not set".into()))?;
        let spec = LaunchSpec {
            sandbox_id: sandbox_id.clone(),
            boot: ctx.boot.clone(),
            layout: ctx.layout.clone(),
        };

        let result = driver.associate(&spec, &state, ctx.events.clone()).await;
        ctx.guard.set_driver(driver);
        result.inspect_err(|e| log_task_error(&sandbox_id, task_name, e))?;

        tracing::info!(sandbox_id = %sandbox_id, pid = state.pid(), "Attached to existing VM process");
        Ok(())
    }

    fn name(&self) -> &str {
        "vmm_attach"
    }
}
