//! Type definitions for the boot pipeline.

use crate::portal::FinishPolicy;
use crate::runtime::{BootConfig, SandboxLayout, Timeouts};
use crate::sandbox::context::GuestLinks;
use crate::sandbox::events::EventSender;
use crate::sandbox::report::ReportSink;
use crate::vmm::{DriverState, HypervisorDriver};

/// How the hypervisor is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootMode {
    /// Prepare the directory and launch a new VM.
    Fresh,
    /// Attach to a VM that outlived a previous control plane.
    Reattach(DriverState),
}

/// Everything a booted sandbox hands to its control loop.
pub struct BootOutput {
    pub driver: Box<dyn HypervisorDriver>,
    pub links: GuestLinks,
}

/// RAII guard for cleanup on boot failure.
///
/// Kills the hypervisor and removes the sandbox directory if dropped
/// while armed.
pub struct CleanupGuard {
    sandbox_id: String,
    layout: Option<SandboxLayout>,
    driver: Option<Box<dyn HypervisorDriver>>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(sandbox_id: String) -> Self {
        Self {
            sandbox_id,
            layout: None,
            driver: None,
            armed: true,
        }
    }

    /// Register layout for cleanup on failure.
    pub fn set_layout(&mut self, layout: SandboxLayout) {
        self.layout = Some(layout);
    }

    pub fn set_driver(&mut self, driver: Box<dyn HypervisorDriver>) {
        self.driver = Some(driver);
    }

    pub fn take_driver(&mut self) -> Option<Box<dyn HypervisorDriver>> {
        self.driver.take()
    }

    /// Disarm the guard (call on success).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(sandbox_id = %self.sandbox_id, "Sandbox boot failed, cleaning up");

        if let Some(ref mut driver) = self.driver {
            if let Err(e) = driver.kill() {
                tracing::warn!(sandbox_id = %self.sandbox_id, "Failed to kill hypervisor during cleanup: {}", e);
            }
            driver.close();
        }

        if let Some(ref layout) = self.layout
            && let Err(e) = layout.cleanup()
        {
            tracing::warn!(sandbox_id = %self.sandbox_id, "Failed to cleanup sandbox directory: {}", e);
        }
    }
}

/// Shared boot pipeline context.
pub struct InitPipelineContext {
    pub sandbox_id: String,
    pub boot: BootConfig,
    pub layout: SandboxLayout,
    pub timeouts: Timeouts,
    pub finish_policy: FinishPolicy,
    pub reports: ReportSink,
    pub events: EventSender,
    pub mode: BootMode,
    pub guard: CleanupGuard,
    pub links: GuestLinks,
}

impl InitPipelineContext {
    pub fn is_reattach(&self) -> bool {
        matches!(self.mode, BootMode::Reattach(_))
    }
}
