//! Mutable state of one sandbox.
//!
//! [`VmContext`] is owned by the control loop. Hardware counters, the device
//! tracker, device bindings and the pod/runtime specs live in [`HwState`]
//! behind one lock; every mutation goes through the context.

use super::events::{BlockSource, EventSender, LifecycleEvent, post};
use super::report::ReportSink;
use super::spec::{ContainerInfo, PodSpec, VmInterface, VmPod, VmRoute, VmVolume, VolumeInfo};
use super::tracker::{Confirmation, DeviceKey, DeviceTracker};
use crate::net::{InterfaceSettings, NetworkAllocator, guest_device_name};
use crate::portal::{InitChannel, TtyMux};
use crate::runtime::{BootConfig, SandboxLayout, Timeouts};
use crate::vmm::HypervisorDriver;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

/// First PCI slot free for hotplugged NICs; lower slots hold built-in devices.
pub const PCI_ADDR_BASE: u32 = 0x05;

// ============================================================================
// HARDWARE STATE
// ============================================================================

/// Address allocators. Only ever incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub pci_addr: u32,
    pub scsi_id: u32,
    pub attach_id: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            pci_addr: PCI_ADDR_BASE,
            scsi_id: 0,
            attach_id: 1,
        }
    }
}

impl Counters {
    pub fn next_pci_addr(&mut self) -> u32 {
        let addr = self.pci_addr;
        self.pci_addr += 1;
        addr
    }

    pub fn next_scsi_id(&mut self) -> u32 {
        let id = self.scsi_id;
        self.scsi_id += 1;
        id
    }

    pub fn next_attach_id(&mut self) -> u64 {
        let id = self.attach_id;
        self.attach_id += 1;
        id
    }

    /// Reinitialize for the next pod. Attach ids stay monotonic.
    pub fn reset(&mut self) {
        *self = Self {
            attach_id: self.attach_id,
            ..Self::default()
        };
    }
}

/// A hotplugged disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBinding {
    pub name: String,
    pub source: BlockSource,
    pub scsi_id: u32,
    pub device_name: String,
}

impl BlockBinding {
    pub fn key(&self) -> DeviceKey {
        block_key(&self.name, &self.source)
    }
}

pub fn block_key(name: &str, source: &BlockSource) -> DeviceKey {
    match source {
        BlockSource::Image { container } => DeviceKey::Container(*container),
        BlockSource::Volume => DeviceKey::Volume(name.to_string()),
    }
}

/// A host interface and the PCI slot its NIC uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub settings: InterfaceSettings,
    pub pci_addr: u32,
}

#[derive(Debug, Default)]
pub struct HwState {
    pub counters: Counters,
    pub tracker: DeviceTracker,
    pub pod: Option<PodSpec>,
    pub runtime: Option<VmPod>,
    pub containers: Vec<ContainerInfo>,
    pub volumes: Vec<VolumeInfo>,
    /// Attached disks by logical name.
    pub block_devices: BTreeMap<String, BlockBinding>,
    /// Host interfaces by index.
    pub networks: BTreeMap<usize, NetworkBinding>,
}

impl HwState {
    /// Container index by runtime id or pod container name.
    pub fn resolve_container(&self, id_or_name: &str) -> Option<usize> {
        self.runtime
            .as_ref()
            .and_then(|r| r.container_index(id_or_name))
            .or_else(|| {
                self.pod
                    .as_ref()
                    .and_then(|p| p.containers.iter().position(|c| c.name == id_or_name))
            })
    }

    /// Record an attached disk and fill its device name into the runtime spec.
    pub fn bind_block_device(&mut self, binding: BlockBinding) -> Confirmation {
        let confirmation = self.tracker.confirm(&binding.key());
        if confirmation == Confirmation::NotPending {
            return confirmation;
        }

        if let Some(runtime) = self.runtime.as_mut() {
            match &binding.source {
                BlockSource::Image { container } => {
                    if let Some(c) = runtime.containers.get_mut(*container) {
                        c.image = binding.device_name.clone();
                    }
                }
                BlockSource::Volume => {
                    let fstype = self
                        .volumes
                        .iter()
                        .find(|v| v.name == binding.name)
                        .map(|v| v.fstype.clone())
                        .unwrap_or_default();
                    if let Some(pod) = self.pod.as_ref() {
                        for (spec, container) in pod.containers.iter().zip(&mut runtime.containers) {
                            for mount in spec.volumes.iter().filter(|m| m.volume == binding.name) {
                                container.volumes.push(VmVolume {
                                    device: binding.device_name.clone(),
                                    mount: mount.path.clone(),
                                    fstype: fstype.clone(),
                                    read_only: mount.read_only,
                                });
                            }
                        }
                    }
                }
            }
        }

        self.block_devices.insert(binding.name.clone(), binding);
        confirmation
    }

    /// Confirm an attached NIC and publish the interface to the guest.
    ///
    /// Routes are computed once, when the last pending interface settles.
    pub fn bind_interface(&mut self, index: usize, device: &str) -> Confirmation {
        let confirmation = self.tracker.confirm(&DeviceKey::Network(index));
        let Confirmation::Added { networks_settled } = confirmation else {
            return confirmation;
        };

        let Some(runtime) = self.runtime.as_mut() else {
            return confirmation;
        };
        if let Some(binding) = self.networks.get(&index) {
            runtime.interfaces.push(VmInterface {
                device: device.to_string(),
                ip_address: binding.settings.ip_addr.to_string(),
                net_mask: binding.settings.netmask().to_string(),
            });
        }

        if networks_settled {
            runtime
                .interfaces
                .sort_by(|a, b| a.device.cmp(&b.device));
            runtime.routes = self
                .networks
                .values()
                .filter(|b| b.settings.is_primary())
                .map(|b| VmRoute {
                    dest: "0.0.0.0/0".to_string(),
                    gateway: b.settings.gateway.to_string(),
                    device: guest_device_name(b.settings.index),
                })
                .collect();
        }
        confirmation
    }

    /// Drop everything tied to the finished pod.
    pub fn reset(&mut self) {
        self.counters.reset();
        self.tracker.reset();
        self.pod = None;
        self.runtime = None;
        self.containers.clear();
        self.volumes.clear();
        self.block_devices.clear();
        self.networks.clear();
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<AbortHandle>,
}

/// Host ends of the guest connections.
#[derive(Default)]
pub struct GuestLinks {
    pub init: Option<InitChannel>,
    pub tty: Option<TtyMux>,
    pub console: Option<JoinHandle<usize>>,
}

impl GuestLinks {
    pub fn close(&mut self) {
        if let Some(tty) = self.tty.take() {
            tty.close_all();
        }
        self.init = None;
        if let Some(console) = self.console.take() {
            console.abort();
        }
    }
}

pub struct VmContext {
    pub id: String,
    pub boot: BootConfig,
    pub layout: SandboxLayout,
    pub timeouts: Timeouts,
    pub reports: ReportSink,
    pub events: EventSender,
    pub driver: Box<dyn HypervisorDriver>,
    pub network: Arc<dyn NetworkAllocator>,
    pub links: GuestLinks,
    hw: Mutex<HwState>,
    timer: Mutex<TimerSlot>,
}

impl VmContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        boot: BootConfig,
        layout: SandboxLayout,
        timeouts: Timeouts,
        reports: ReportSink,
        events: EventSender,
        driver: Box<dyn HypervisorDriver>,
        network: Arc<dyn NetworkAllocator>,
        links: GuestLinks,
    ) -> Self {
        Self {
            id,
            boot,
            layout,
            timeouts,
            reports,
            events,
            driver,
            network,
            links,
            hw: Mutex::new(HwState::default()),
            timer: Mutex::new(TimerSlot::default()),
        }
    }

    pub fn hw(&self) -> MutexGuard<'_, HwState> {
        self.hw.lock()
    }

    pub(crate) fn restore_hw(&self, state: HwState) {
        *self.hw.lock() = state;
    }

    // ------------------------------------------------------------------------
    // Deadline
    // ------------------------------------------------------------------------

    /// Arm the single deadline, replacing any previous one.
    pub fn set_timeout(&self, after: Duration) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }

        let generation = timer.generation;
        let events = self.events.clone();
        timer.handle = Some(
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                post(&events, LifecycleEvent::Timeout { generation }).await;
            })
            .abort_handle(),
        );
        tracing::trace!(sandbox_id = %self.id, generation, ?after, "Deadline armed");
    }

    pub fn unset_timeout(&self) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    /// Whether a timeout event belongs to the deadline currently armed.
    pub fn is_current_timeout(&self, generation: u64) -> bool {
        let timer = self.timer.lock();
        timer.handle.is_some() && timer.generation == generation
    }

    // ------------------------------------------------------------------------
    // Host network
    // ------------------------------------------------------------------------

    /// Release the host side of an interface in the background.
    ///
    /// Completion is posted as `InterfaceReleased`.
    pub fn release_interface(&self, settings: InterfaceSettings) {
        let network = self.network.clone();
        let events = self.events.clone();
        let sandbox_id = self.id.clone();
        tokio::spawn(async move {
            let success = match network.release(&settings).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox_id,
                        device = %settings.host_device,
                        error = %e,
                        "Failed to release interface"
                    );
                    false
                }
            };
            post(
                &events,
                super::events::HardwareEvent::InterfaceReleased {
                    index: settings.index,
                    success,
                },
            )
            .await;
        });
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().handle.take() {
            handle.abort();
        }
    }
}
