//! Task: Filesystem setup.
//!
//! Creates the sandbox directory with its shared dir.

use super::{InitCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use hyperlite_shared::HyperliteResult;

pub struct FilesystemTask;

#[async_trait]
impl PipelineTask<InitCtx> for FilesystemTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> HyperliteResult<()> {
        let task_name = self.name();
        let sandbox_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        ctx.layout
            .prepare()
            .inspect_err(|e| log_task_error(&sandbox_id, task_name, e))?;
        let layout = ctx.layout.clone();
        ctx.guard.set_layout(layout);

        Ok(())
    }

    fn name(&self) -> &str {
        "filesystem_setup"
    }
}
