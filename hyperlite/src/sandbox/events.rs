//! Events consumed by the per-sandbox control loop.
//!
//! Every producer (monitor sessions, the init channel, timers, callers)
//! posts into one bounded queue. Each category is a closed enum so every
//! phase handler matches it exhaustively.

use crate::net::InterfaceSettings;
use crate::portal::{GuestCommand, TtyEndpoint};
use crate::sandbox::spec::{ContainerInfo, PodSpec, VolumeInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type EventSender = mpsc::Sender<VmEvent>;
pub type EventReceiver = mpsc::Receiver<VmEvent>;

#[derive(Debug)]
pub enum VmEvent {
    Lifecycle(LifecycleEvent),
    Hardware(HardwareEvent),
    Guest(GuestEvent),
    Command(SandboxCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The hypervisor process is gone.
    VmExit,
    /// The pending deadline fired. Stale generations are ignored.
    Timeout { generation: u64 },
    /// A protocol connection broke.
    Interrupted { reason: String },
    /// A protocol connection could not be established.
    InitFailed { reason: String },
}

/// What a hotplugged block device backs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSource {
    Image { container: usize },
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    BlockdevInserted {
        name: String,
        source: BlockSource,
        device_name: String,
        scsi_id: u32,
    },
    /// Host side of an interface exists; the NIC is not plugged yet.
    InterfaceCreated {
        settings: InterfaceSettings,
        pci_addr: u32,
    },
    NetDevInserted {
        index: usize,
        device: String,
        pci_addr: u32,
    },
    ContainerUnplugged {
        index: usize,
    },
    VolumeUnplugged {
        name: String,
    },
    NetDevRemoved {
        index: usize,
    },
    InterfaceReleased {
        index: usize,
        success: bool,
    },
    /// A hotplug step gave up. `completion` is the event the step would
    /// have raised on success.
    DeviceFailed {
        device: String,
        completion: Option<Box<HardwareEvent>>,
        reason: String,
    },
}

impl HardwareEvent {
    /// Human-readable device label for reports.
    pub fn device_label(&self) -> String {
        match self {
            HardwareEvent::BlockdevInserted { name, .. } => format!("blockdev {}", name),
            HardwareEvent::InterfaceCreated { settings, .. } => {
                format!("interface {}", settings.index)
            }
            HardwareEvent::NetDevInserted { index, .. }
            | HardwareEvent::NetDevRemoved { index }
            | HardwareEvent::InterfaceReleased { index, .. } => format!("interface {}", index),
            HardwareEvent::ContainerUnplugged { index } => format!("container {}", index),
            HardwareEvent::VolumeUnplugged { name } => format!("volume {}", name),
            HardwareEvent::DeviceFailed { device, .. } => device.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestEvent {
    /// The oldest outstanding command was acknowledged.
    Ack {
        command: GuestCommand,
        reply: Vec<u8>,
    },
    /// The oldest outstanding command was rejected by the guest.
    Failed {
        command: GuestCommand,
        reply: Vec<u8>,
    },
    PodFinished {
        exit_codes: Vec<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub row: u16,
    pub column: u16,
}

#[derive(Debug)]
pub struct RunPodRequest {
    pub spec: PodSpec,
    pub containers: Vec<ContainerInfo>,
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Debug)]
pub struct ExecRequest {
    pub container: String,
    pub command: Vec<String>,
    pub endpoint: TtyEndpoint,
}

#[derive(Debug)]
pub struct AttachRequest {
    pub container: String,
    pub endpoint: TtyEndpoint,
}

#[derive(Debug)]
pub enum SandboxCommand {
    RunPod(Box<RunPodRequest>),
    StopPod,
    Exec(ExecRequest),
    Attach(AttachRequest),
    WindowSize { tag: String, size: WindowSize },
    Shutdown,
    /// Detach the control plane and leave the VM running.
    Release,
}

impl SandboxCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SandboxCommand::RunPod(_) => "run_pod",
            SandboxCommand::StopPod => "stop_pod",
            SandboxCommand::Exec(_) => "exec",
            SandboxCommand::Attach(_) => "attach",
            SandboxCommand::WindowSize { .. } => "window_size",
            SandboxCommand::Shutdown => "shutdown",
            SandboxCommand::Release => "release",
        }
    }
}

impl From<LifecycleEvent> for VmEvent {
    fn from(event: LifecycleEvent) -> Self {
        VmEvent::Lifecycle(event)
    }
}

impl From<HardwareEvent> for VmEvent {
    fn from(event: HardwareEvent) -> Self {
        VmEvent::Hardware(event)
    }
}

impl From<GuestEvent> for VmEvent {
    fn from(event: GuestEvent) -> Self {
        VmEvent::Guest(event)
    }
}

impl From<SandboxCommand> for VmEvent {
    fn from(event: SandboxCommand) -> Self {
        VmEvent::Command(event)
    }
}

/// Post an event from a supporting task.
///
/// A closed queue means the control loop already finished; the event is
/// dropped.
pub async fn post(events: &EventSender, event: impl Into<VmEvent>) {
    if events.send(event.into()).await.is_err() {
        tracing::trace!("Control loop gone, dropping event");
    }
}
