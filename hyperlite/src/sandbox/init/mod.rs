//! Sandbox boot orchestration.
//!
//! ## Architecture
//!
//! Boot is table-driven with a plan per [`BootMode`]:
//!
//! ```text
//! Fresh (new sandbox):
//!   1. Filesystem            (create sandbox directory)
//!   2. VmmSpawn              (launch hypervisor, connect monitor)
//!   3. InitConnect ─┬─       (wait for guest ready)
//!      TtyConnect  ─┤
//!      Console     ─┘        (best effort)
//!
//! Reattach (control plane restarted):
//!   1. VmmAttach             (adopt running hypervisor, connect monitor)
//!   2. InitConnect ─┬─       (no ready frame; the guest is already up)
//!      TtyConnect  ─┤
//!      Console     ─┘
//! ```
//!
//! `CleanupGuard` kills the hypervisor and removes the directory when a
//! fresh boot fails.

mod tasks;
mod types;

pub use types::{BootMode, BootOutput};

use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, Stage};
use crate::portal::FinishPolicy;
use crate::runtime::{BootConfig, SandboxLayout, Timeouts};
use crate::sandbox::context::GuestLinks;
use crate::sandbox::events::EventSender;
use crate::sandbox::report::ReportSink;
use crate::vmm::HypervisorDriver;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

use tasks::{
    ConsoleTask, FilesystemTask, InitConnectTask, InitCtx, TtyConnectTask, VmmAttachTask,
    VmmSpawnTask,
};
use types::{CleanupGuard, InitPipelineContext};

// ============================================================================
// EXECUTION PLAN
// ============================================================================

fn connect_stage() -> Stage<BoxedTask<InitCtx>> {
    Stage::parallel(vec![
        Box::new(InitConnectTask),
        Box::new(TtyConnectTask),
        Box::new(ConsoleTask),
    ])
}

fn get_execution_plan(mode: &BootMode) -> ExecutionPlan<InitCtx> {
    let stages: Vec<Stage<BoxedTask<InitCtx>>> = match mode {
        BootMode::Fresh => vec![
            Stage::sequential(vec![Box::new(FilesystemTask)]),
            Stage::sequential(vec![Box::new(VmmSpawnTask)]),
            connect_stage(),
        ],
        BootMode::Reattach(_) => vec![
            Stage::sequential(vec![Box::new(VmmAttachTask)]),
            connect_stage(),
        ],
    };

    ExecutionPlan::new(stages)
}

/// Boots one sandbox up to the point its control loop can take over.
pub struct SandboxBuilder {
    pub sandbox_id: String,
    pub boot: BootConfig,
    pub layout: SandboxLayout,
    pub timeouts: Timeouts,
    pub finish_policy: FinishPolicy,
    pub reports: ReportSink,
    pub events: EventSender,
    pub driver: Box<dyn HypervisorDriver>,
    pub mode: BootMode,
}

impl SandboxBuilder {
    /// Run the boot plan with automatic cleanup on failure.
    pub async fn build(self) -> HyperliteResult<BootOutput> {
        let SandboxBuilder {
            sandbox_id,
            boot,
            layout,
            timeouts,
            finish_policy,
            reports,
            events,
            driver,
            mode,
        } = self;

        boot.sanitize()?;

        let mut guard = CleanupGuard::new(sandbox_id.clone());
        guard.set_driver(driver);
        // A recovered VM belongs to the workload; never kill it on a failed attach.
        if matches!(mode, BootMode::Reattach(_)) {
            guard.disarm();
        }

        let plan = get_execution_plan(&mode);
        let ctx: InitCtx = Arc::new(Mutex::new(InitPipelineContext {
            sandbox_id: sandbox_id.clone(),
            boot,
            layout,
            timeouts,
            finish_policy,
            reports,
            events,
            mode,
            guard,
            links: GuestLinks::default(),
        }));

        let metrics = PipelineExecutor::execute(plan, Arc::clone(&ctx)).await?;
        metrics.log(&sandbox_id);

        let mut ctx = ctx.lock().await;
        let driver = ctx
            .guard
            .take_driver()
            .ok_or_else(|| HyperliteError::Internal("driver was not returned".into()))?;
        ctx.guard.disarm();

        Ok(BootOutput {
            driver,
            links: std::mem::take(&mut ctx.links),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::RetryPolicy;
    use crate::vmm::{DriverState, QemuDriver};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn builder(home: &TempDir, boot: BootConfig, mode: BootMode) -> SandboxBuilder {
        let (events, _) = mpsc::channel(8);
        let (report_tx, _) = mpsc::unbounded_channel();
        let retry = RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(1),
        };
        SandboxBuilder {
            sandbox_id: "sb".into(),
            boot,
            layout: SandboxLayout::new(home.path().join("sb")),
            timeouts: Timeouts::default(),
            finish_policy: FinishPolicy::default(),
            reports: ReportSink::new("sb", report_tx),
            events,
            driver: Box::new(QemuDriver::new(
                "sb",
                home.path().join("no-such-qemu"),
                retry,
                Duration::from_millis(100),
            )),
            mode,
        }
    }

    #[tokio::test]
    async fn test_invalid_boot_config_creates_nothing() {
        let home = TempDir::new().unwrap();
        let boot = BootConfig {
            cpus: 0,
            ..Default::default()
        };

        let err = builder(&home, boot, BootMode::Fresh).build().await.err().unwrap();
        assert!(matches!(err, HyperliteError::Config(_)));
        assert!(!home.path().join("sb").exists());
    }

    #[tokio::test]
    async fn test_failed_reattach_keeps_sandbox_directory() {
        let home = TempDir::new().unwrap();
        let layout = SandboxLayout::new(home.path().join("sb"));
        layout.prepare().unwrap();

        let mode = BootMode::Reattach(DriverState::Qemu { pid: i32::MAX as u32 });
        let err = builder(&home, BootConfig::default(), mode)
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HyperliteError::Engine(_)));
        assert!(layout.root().exists());
    }
}
