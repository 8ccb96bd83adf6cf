mod filesystem;
mod guest_connect;
mod vmm_attach;
mod vmm_spawn;

pub use filesystem::FilesystemTask;
pub use guest_connect::{ConsoleTask, InitConnectTask, TtyConnectTask};
pub use vmm_attach::VmmAttachTask;
pub use vmm_spawn::VmmSpawnTask;

use super::types::InitPipelineContext;
use hyperlite_shared::HyperliteError;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type InitCtx = Arc<Mutex<InitPipelineContext>>;

/// Log the start of a task and return the sandbox id for later logs.
async fn task_start(ctx: &InitCtx, task_name: &str) -> String {
    let sandbox_id = ctx.lock().await.sandbox_id.clone();
    tracing::debug!(sandbox_id = %sandbox_id, task = task_name, "Boot task started");
    sandbox_id
}

fn log_task_error(sandbox_id: &str, task_name: &str, error: &HyperliteError) {
    tracing::error!(sandbox_id = %sandbox_id, task = task_name, error = %error, "Boot task failed");
}
