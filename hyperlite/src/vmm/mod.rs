//! Hypervisor backends.
//!
//! [`HypervisorDriver`] is the capability set the state machine needs from a
//! hypervisor: start or reattach, hotplug disks and NICs, shut down, kill
//! and dump enough state to reattach later. Hotplug submissions return as
//! soon as the request is queued; outcomes arrive as events.

pub mod qemu;

pub use qemu::QemuDriver;

use crate::net::InterfaceSettings;
use crate::runtime::{BootConfig, SandboxLayout};
use crate::sandbox::events::{EventSender, HardwareEvent};
use async_trait::async_trait;
use hyperlite_shared::HyperliteResult;
use serde::{Deserialize, Serialize};

/// Available hypervisor backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmmKind {
    Qemu,
}

/// Parameters for launching one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub sandbox_id: String,
    pub boot: BootConfig,
    pub layout: SandboxLayout,
}

/// Backend state persisted in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverState {
    Qemu { pid: u32 },
}

impl DriverState {
    pub fn pid(&self) -> u32 {
        match self {
            DriverState::Qemu { pid } => *pid,
        }
    }
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    fn kind(&self) -> VmmKind;

    /// Start the hypervisor and connect its monitor.
    ///
    /// Posts `VmExit` when the process goes away.
    async fn launch(&mut self, spec: &LaunchSpec, events: EventSender) -> HyperliteResult<()>;

    /// Reattach to a hypervisor started by an earlier control plane.
    async fn associate(
        &mut self,
        spec: &LaunchSpec,
        state: &DriverState,
        events: EventSender,
    ) -> HyperliteResult<()>;

    fn add_disk(
        &self,
        filename: &str,
        format: &str,
        scsi_id: u32,
        completion: HardwareEvent,
    ) -> HyperliteResult<()>;

    fn remove_disk(&self, scsi_id: u32, completion: HardwareEvent) -> HyperliteResult<()>;

    fn add_nic(
        &self,
        settings: &InterfaceSettings,
        pci_addr: u32,
        completion: HardwareEvent,
    ) -> HyperliteResult<()>;

    fn remove_nic(
        &self,
        settings: &InterfaceSettings,
        completion: HardwareEvent,
    ) -> HyperliteResult<()>;

    /// Ask the hypervisor to exit.
    fn shutdown(&self) -> HyperliteResult<()>;

    /// Kill the hypervisor process.
    fn kill(&self) -> HyperliteResult<()>;

    fn pid(&self) -> Option<u32>;

    fn dump(&self) -> HyperliteResult<DriverState>;

    /// Drop the monitor connection and stop watching the process.
    fn close(&mut self);
}
