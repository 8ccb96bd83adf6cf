//! Per-sandbox control loop.
//!
//! ## Architecture
//!
//! ```text
//!  Init ──run pod──► Starting ──start ack──► Running ──stop pod──► PodStopping
//!   ▲                                                                  │ stop ack
//!   └──────────── ready ack ◄──── Cleaning ◄── unplug all devices ◄────┘
//!
//!  any ──failure / shutdown──► Terminating ──VM exit──► Destroying ──► closed
//! ```
//!
//! The loop consumes one bounded event queue and is the only place the phase
//! changes. Handlers never block: hotplug requests and guest commands are
//! queued to their owners and their outcomes come back as events.

use super::context::{BlockBinding, NetworkBinding, VmContext};
use super::events::{
    AttachRequest, BlockSource, EventReceiver, ExecRequest, GuestEvent, HardwareEvent,
    LifecycleEvent, RunPodRequest, SandboxCommand, VmEvent, WindowSize,
};
use super::persist::Snapshot;
use super::report::ReportKind;
use super::spec::VmPod;
use super::tracker::{Confirmation, DeviceKey};
use crate::monitor::scsi_device_name;
use crate::net::{InterfaceSettings, guest_device_name};
use crate::portal::GuestCommand;
use hyperlite_shared::constants::sockets::SHARE_TAG;
use hyperlite_shared::{HyperliteError, HyperliteResult, InitCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Starting,
    Running,
    PodStopping,
    Cleaning,
    Terminating,
    Destroying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::PodStopping => "pod_stopping",
            Phase::Cleaning => "cleaning",
            Phase::Terminating => "terminating",
            Phase::Destroying => "destroying",
        };
        f.write_str(name)
    }
}

enum Flow {
    Continue,
    Exit,
}

#[derive(Serialize)]
struct ExecPayload<'a> {
    container: &'a str,
    seq: u64,
    cmd: &'a [String],
}

#[derive(Serialize)]
struct WinSizePayload {
    seq: u64,
    row: u16,
    column: u16,
}

pub struct StateMachine {
    ctx: VmContext,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    events: EventReceiver,
    /// Teardown was caused by a failure.
    failed: bool,
    vm_exited: bool,
    start_sent: bool,
    ready_sent: bool,
}

impl StateMachine {
    pub fn new(
        ctx: VmContext,
        phase: Phase,
        events: EventReceiver,
        phase_tx: watch::Sender<Phase>,
    ) -> Self {
        phase_tx.send_replace(phase);
        Self {
            ctx,
            phase,
            phase_tx,
            events,
            failed: false,
            vm_exited: false,
            start_sent: false,
            ready_sent: false,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(sandbox_id = %self.ctx.id, phase = %self.phase, "Control loop started");
        while let Some(event) = self.events.recv().await {
            tracing::trace!(sandbox_id = %self.ctx.id, phase = %self.phase, ?event, "Event");
            if let Flow::Exit = self.handle(event) {
                break;
            }
        }
        tracing::info!(
            sandbox_id = %self.ctx.id,
            phase = %self.phase,
            failed = self.failed,
            "Control loop finished"
        );
    }

    fn handle(&mut self, event: VmEvent) -> Flow {
        match event {
            VmEvent::Lifecycle(event) => self.on_lifecycle(event),
            VmEvent::Hardware(event) => self.on_hardware(event),
            VmEvent::Guest(event) => self.on_guest(event),
            VmEvent::Command(command) => self.on_command(command),
        }
    }

    fn transition(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        tracing::info!(sandbox_id = %self.ctx.id, from = %self.phase, to = %next, "Phase change");
        self.phase = next;
        self.phase_tx.send_replace(next);
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    fn on_command(&mut self, command: SandboxCommand) -> Flow {
        let name = command.name();
        match command {
            SandboxCommand::RunPod(request) => match self.phase {
                Phase::Init => self.run_pod(*request),
                _ => self.busy(name),
            },
            SandboxCommand::StopPod => match self.phase {
                Phase::Running => self.stop_pod(),
                _ => self.busy(name),
            },
            SandboxCommand::Exec(request) => match self.phase {
                Phase::Running => self.exec(request),
                _ => self.busy(name),
            },
            SandboxCommand::Attach(request) => match self.phase {
                Phase::Running => self.attach(request),
                _ => self.busy(name),
            },
            SandboxCommand::WindowSize { tag, size } => match self.phase {
                Phase::Running => self.resize(&tag, size),
                _ => self.busy(name),
            },
            SandboxCommand::Shutdown => match self.phase {
                Phase::Init => self.power_off("shutdown requested"),
                Phase::Starting | Phase::Running | Phase::PodStopping | Phase::Cleaning => {
                    self.exit_vm(false, "shutdown requested")
                }
                Phase::Terminating | Phase::Destroying => self.busy(name),
            },
            SandboxCommand::Release => match self.phase {
                Phase::Init => self.power_off("released without a pod"),
                Phase::Running => self.release(),
                _ => self.busy(name),
            },
        }
    }

    fn busy(&mut self, command: &str) -> Flow {
        tracing::warn!(sandbox_id = %self.ctx.id, command, phase = %self.phase, "Command rejected");
        self.ctx
            .reports
            .busy(format!("cannot {} while {}", command, self.phase));
        Flow::Continue
    }

    fn run_pod(&mut self, request: RunPodRequest) -> Flow {
        let RunPodRequest {
            spec,
            containers,
            volumes,
        } = request;

        if containers.len() != spec.containers.len() {
            self.ctx.reports.bad_request(format!(
                "pod {} declares {} containers but {} were resolved",
                spec.name,
                spec.containers.len(),
                containers.len()
            ));
            return Flow::Continue;
        }
        if let Some(missing) = spec
            .volumes
            .iter()
            .find(|v| !volumes.iter().any(|info| info.name == v.name))
        {
            self.ctx.reports.bad_request(format!(
                "volume {} of pod {} was not resolved",
                missing.name, spec.name
            ));
            return Flow::Continue;
        }

        tracing::info!(
            sandbox_id = %self.ctx.id,
            pod = %spec.name,
            containers = containers.len(),
            volumes = volumes.len(),
            interfaces = spec.interfaces,
            "Starting pod"
        );

        let mut disks = Vec::new();
        let mut nics = Vec::new();
        {
            let mut hw = self.ctx.hw();
            let mut runtime = VmPod::expand(&spec, &containers, &volumes, SHARE_TAG);

            for (index, (user, container)) in spec.containers.iter().zip(&mut runtime.containers).enumerate() {
                if user.tty {
                    container.tty = hw.counters.next_attach_id();
                }
                let info = &containers[index];
                if info.is_block() {
                    hw.tracker.mark_adding(DeviceKey::Container(index));
                    let scsi_id = hw.counters.next_scsi_id();
                    disks.push((
                        info.image.clone(),
                        "raw".to_string(),
                        BlockBinding {
                            name: info.id.clone(),
                            source: BlockSource::Image { container: index },
                            scsi_id,
                            device_name: scsi_device_name(scsi_id),
                        },
                    ));
                }
            }
            for volume in volumes.iter().filter(|v| v.is_block()) {
                hw.tracker.mark_adding(DeviceKey::Volume(volume.name.clone()));
                let scsi_id = hw.counters.next_scsi_id();
                disks.push((
                    volume.filepath.clone(),
                    volume.format.clone(),
                    BlockBinding {
                        name: volume.name.clone(),
                        source: BlockSource::Volume,
                        scsi_id,
                        device_name: scsi_device_name(scsi_id),
                    },
                ));
            }
            for index in 0..spec.interfaces {
                hw.tracker.mark_adding(DeviceKey::Network(index));
                nics.push((index, hw.counters.next_pci_addr()));
            }

            hw.runtime = Some(runtime);
            hw.pod = Some(spec);
            hw.containers = containers;
            hw.volumes = volumes;
        }

        self.start_sent = false;
        self.ctx.set_timeout(self.ctx.timeouts.start_pod);
        self.transition(Phase::Starting);

        for (filename, format, binding) in disks {
            let completion = HardwareEvent::BlockdevInserted {
                name: binding.name,
                source: binding.source,
                device_name: binding.device_name,
                scsi_id: binding.scsi_id,
            };
            if let Err(e) = self
                .ctx
                .driver
                .add_disk(&filename, &format, binding.scsi_id, completion)
            {
                return self.fail(format!("failed to hotplug {}: {}", filename, e), None);
            }
        }
        for (index, pci_addr) in nics {
            self.allocate_interface(index, pci_addr);
        }

        self.maybe_start_pod()
    }

    fn allocate_interface(&self, index: usize, pci_addr: u32) {
        let network = self.ctx.network.clone();
        let events = self.ctx.events.clone();
        let sandbox_id = self.ctx.id.clone();
        tokio::spawn(async move {
            let event = match network.allocate(&sandbox_id, index).await {
                Ok(settings) => HardwareEvent::InterfaceCreated { settings, pci_addr },
                Err(e) => {
                    tracing::error!(sandbox_id = %sandbox_id, index, error = %e, "Interface allocation failed");
                    HardwareEvent::DeviceFailed {
                        device: format!("interface {}", index),
                        completion: Some(Box::new(HardwareEvent::NetDevInserted {
                            index,
                            device: guest_device_name(index),
                            pci_addr,
                        })),
                        reason: e.to_string(),
                    }
                }
            };
            super::events::post(&events, event).await;
        });
    }

    fn maybe_start_pod(&mut self) -> Flow {
        if self.start_sent || !self.ctx.hw().tracker.is_ready() {
            return Flow::Continue;
        }
        // The start deadline stays armed until init acknowledges.

        let command = {
            let hw = self.ctx.hw();
            match hw.runtime.as_ref() {
                Some(runtime) => GuestCommand::json(InitCode::StartPod, runtime),
                None => Err(HyperliteError::InvalidState("no runtime spec".into())),
            }
        };
        self.start_sent = true;
        tracing::info!(sandbox_id = %self.ctx.id, "All devices attached, starting pod");
        match command.and_then(|c| self.send_guest(c)) {
            Ok(()) => Flow::Continue,
            Err(e) => self.fail(format!("failed to start pod: {}", e), None),
        }
    }

    fn stop_pod(&mut self) -> Flow {
        if let Err(e) = self.send_guest(GuestCommand::new(InitCode::StopPod, Vec::new())) {
            return self.fail(format!("failed to stop pod: {}", e), None);
        }
        self.ctx.set_timeout(self.ctx.timeouts.stop_pod);
        self.transition(Phase::PodStopping);
        Flow::Continue
    }

    fn exec(&mut self, request: ExecRequest) -> Flow {
        let ExecRequest {
            container,
            command,
            endpoint,
        } = request;

        let (index, id, seq) = {
            let mut hw = self.ctx.hw();
            let Some(index) = hw.resolve_container(&container) else {
                drop(hw);
                self.ctx
                    .reports
                    .bad_request(format!("no container {} in pod", container));
                return Flow::Continue;
            };
            let id = hw.containers[index].id.clone();
            (index, id, hw.counters.next_attach_id())
        };

        let Some(tty) = self.ctx.links.tty.as_ref() else {
            self.ctx.reports.failed("tty stream is not connected", None);
            return Flow::Continue;
        };
        tty.attach(seq, index, false, endpoint);

        let command = GuestCommand::json(
            InitCode::ExecCmd,
            &ExecPayload {
                container: &id,
                seq,
                cmd: &command,
            },
        )
        .map(|c| c.with_seq(seq));

        tracing::debug!(sandbox_id = %self.ctx.id, container = %id, seq, "Exec");
        if let Err(e) = command.and_then(|c| self.send_guest(c)) {
            if let Some(tty) = self.ctx.links.tty.as_ref() {
                tty.close(seq);
            }
            self.ctx.reports.failed(format!("exec failed: {}", e), None);
        }
        Flow::Continue
    }

    fn attach(&mut self, request: AttachRequest) -> Flow {
        let AttachRequest {
            container,
            endpoint,
        } = request;

        let session = {
            let hw = self.ctx.hw();
            hw.resolve_container(&container).map(|index| {
                let session = hw
                    .runtime
                    .as_ref()
                    .and_then(|r| r.containers.get(index))
                    .map(|c| c.tty)
                    .unwrap_or(0);
                (index, session)
            })
        };

        match (session, self.ctx.links.tty.as_ref()) {
            (None, _) => {
                self.ctx
                    .reports
                    .bad_request(format!("no container {} in pod", container));
            }
            (Some((_, 0)), _) => {
                self.ctx.reports.emit(
                    ReportKind::NoTty,
                    format!("container {} has no terminal", container),
                );
            }
            (Some((index, session)), Some(tty)) => {
                tty.attach(session, index, true, endpoint);
                self.ctx
                    .reports
                    .success(format!("attached to container {}", container));
            }
            (Some(_), None) => {
                self.ctx.reports.failed("tty stream is not connected", None);
            }
        }
        Flow::Continue
    }

    fn resize(&mut self, tag: &str, size: WindowSize) -> Flow {
        let session = self.ctx.links.tty.as_ref().and_then(|t| t.resolve(tag));
        let Some(seq) = session else {
            self.ctx
                .reports
                .bad_request(format!("no tty session tagged {}", tag));
            return Flow::Continue;
        };

        let command = GuestCommand::json(
            InitCode::WinSize,
            &WinSizePayload {
                seq,
                row: size.row,
                column: size.column,
            },
        );
        if let Err(e) = command.and_then(|c| self.send_guest(c)) {
            self.ctx.reports.failed(format!("resize failed: {}", e), None);
        }
        Flow::Continue
    }

    /// Detach the control plane, leaving the VM and pod running.
    fn release(&mut self) -> Flow {
        tracing::info!(sandbox_id = %self.ctx.id, "Releasing sandbox");
        self.ctx.unset_timeout();
        self.ctx.links.close();
        self.ctx.driver.close();
        self.ctx.reports.success("sandbox released");
        Flow::Exit
    }

    fn send_guest(&self, command: GuestCommand) -> HyperliteResult<()> {
        self.ctx
            .links
            .init
            .as_ref()
            .ok_or_else(|| HyperliteError::Guest("init channel is not connected".into()))?
            .send(command)
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Report a failure and tear the sandbox down.
    fn fail(&mut self, cause: String, device: Option<String>) -> Flow {
        tracing::error!(sandbox_id = %self.ctx.id, phase = %self.phase, cause = %cause, "Sandbox failure");
        self.ctx.reports.failed(cause.clone(), device);
        self.exit_vm(true, &cause)
    }

    /// Destroy the pod through the guest, falling back to a power-off.
    fn exit_vm(&mut self, failed: bool, cause: &str) -> Flow {
        self.failed |= failed;
        tracing::info!(sandbox_id = %self.ctx.id, cause, "Destroying pod");
        match self.send_guest(GuestCommand::new(InitCode::DestroyPod, Vec::new())) {
            Ok(()) => {
                self.ctx.set_timeout(self.ctx.timeouts.destroy_pod);
                self.transition(Phase::Terminating);
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.ctx.id, error = %e, "Cannot reach init, powering off");
                self.power_off(cause)
            }
        }
    }

    /// Ask the hypervisor to quit; kill it if it is still there after the grace.
    fn request_quit(&mut self) {
        if let Err(e) = self.ctx.driver.shutdown() {
            tracing::warn!(sandbox_id = %self.ctx.id, error = %e, "Failed to request hypervisor shutdown");
        }
        self.ctx.set_timeout(self.ctx.timeouts.kill_grace);
    }

    fn power_off(&mut self, cause: &str) -> Flow {
        tracing::info!(sandbox_id = %self.ctx.id, cause, "Powering off");
        self.request_quit();
        self.transition(Phase::Destroying);
        Flow::Continue
    }

    fn kill(&mut self) -> Flow {
        if let Err(e) = self.ctx.driver.kill() {
            tracing::warn!(sandbox_id = %self.ctx.id, error = %e, "Failed to kill hypervisor");
        }
        self.on_vm_exit()
    }

    fn on_vm_exit(&mut self) -> Flow {
        if self.vm_exited {
            return self.try_close();
        }
        self.vm_exited = true;
        tracing::info!(sandbox_id = %self.ctx.id, phase = %self.phase, "VM exited");

        self.ctx.reports.vm_shutdown();
        self.ctx.set_timeout(self.ctx.timeouts.close_grace);
        if let Err(e) = self.ctx.driver.kill() {
            tracing::debug!(sandbox_id = %self.ctx.id, error = %e, "Kill after exit failed");
        }
        self.ctx.links.close();
        self.ctx.driver.close();

        // Disks went away with the VM; host interfaces must be released.
        let reclaim: Vec<InterfaceSettings> = {
            let mut hw = self.ctx.hw();
            hw.tracker.reset();
            hw.block_devices.clear();
            let settings: Vec<InterfaceSettings> =
                hw.networks.values().map(|b| b.settings.clone()).collect();
            for s in &settings {
                hw.tracker.mark_deleting(DeviceKey::Network(s.index));
            }
            settings
        };
        for settings in reclaim {
            self.ctx.release_interface(settings);
        }

        self.transition(Phase::Destroying);
        self.try_close()
    }

    fn try_close(&mut self) -> Flow {
        if self.vm_exited && self.ctx.hw().tracker.is_ready() {
            self.close()
        } else {
            Flow::Continue
        }
    }

    fn close(&mut self) -> Flow {
        self.ctx.unset_timeout();
        self.ctx.links.close();
        self.ctx.driver.close();
        if let Err(e) = self.ctx.layout.cleanup() {
            tracing::warn!(sandbox_id = %self.ctx.id, error = %e, "Failed to remove sandbox directory");
        }
        tracing::info!(sandbox_id = %self.ctx.id, "Sandbox closed");
        Flow::Exit
    }

    // ========================================================================
    // LIFECYCLE EVENTS
    // ========================================================================

    fn on_lifecycle(&mut self, event: LifecycleEvent) -> Flow {
        match event {
            LifecycleEvent::VmExit => self.on_vm_exit(),
            LifecycleEvent::Timeout { generation } => {
                if !self.ctx.is_current_timeout(generation) {
                    tracing::trace!(sandbox_id = %self.ctx.id, generation, "Stale timeout");
                    return Flow::Continue;
                }
                self.on_timeout()
            }
            LifecycleEvent::Interrupted { reason } | LifecycleEvent::InitFailed { reason } => {
                match self.phase {
                    Phase::Destroying => {
                        tracing::debug!(sandbox_id = %self.ctx.id, reason = %reason, "Connection lost while destroying");
                        Flow::Continue
                    }
                    Phase::Terminating => {
                        // The guest cannot confirm the destroy anymore.
                        self.request_quit();
                        Flow::Continue
                    }
                    _ => {
                        self.failed = true;
                        self.ctx.reports.failed(reason.clone(), None);
                        self.power_off(&reason)
                    }
                }
            }
        }
    }

    fn on_timeout(&mut self) -> Flow {
        tracing::warn!(sandbox_id = %self.ctx.id, phase = %self.phase, "Deadline expired");
        match self.phase {
            Phase::Init | Phase::Running => Flow::Continue,
            Phase::Starting => self.fail("timed out starting pod".into(), None),
            Phase::PodStopping => self.fail("timed out stopping pod".into(), None),
            Phase::Cleaning => self.fail("timed out detaching devices".into(), None),
            Phase::Terminating => self.kill(),
            Phase::Destroying if !self.vm_exited => self.kill(),
            Phase::Destroying => {
                tracing::warn!(sandbox_id = %self.ctx.id, "Devices still pending, closing anyway");
                self.close()
            }
        }
    }

    // ========================================================================
    // HARDWARE EVENTS
    // ========================================================================

    fn on_hardware(&mut self, event: HardwareEvent) -> Flow {
        match event {
            HardwareEvent::BlockdevInserted {
                name,
                source,
                device_name,
                scsi_id,
            } => {
                tracing::debug!(sandbox_id = %self.ctx.id, name = %name, device = %device_name, "Block device attached");
                let confirmation = self.ctx.hw().bind_block_device(BlockBinding {
                    name,
                    source,
                    scsi_id,
                    device_name,
                });
                self.after_device_change(confirmation)
            }
            HardwareEvent::InterfaceCreated { settings, pci_addr } => {
                self.on_interface_created(settings, pci_addr)
            }
            HardwareEvent::NetDevInserted { index, device, .. } => {
                tracing::debug!(sandbox_id = %self.ctx.id, index, device = %device, "NIC attached");
                let confirmation = self.ctx.hw().bind_interface(index, &device);
                self.after_device_change(confirmation)
            }
            HardwareEvent::ContainerUnplugged { index } => {
                let confirmation = {
                    let mut hw = self.ctx.hw();
                    hw.block_devices
                        .retain(|_, b| b.source != BlockSource::Image { container: index });
                    hw.tracker.confirm(&DeviceKey::Container(index))
                };
                self.after_device_change(confirmation)
            }
            HardwareEvent::VolumeUnplugged { name } => {
                let confirmation = {
                    let mut hw = self.ctx.hw();
                    hw.block_devices.remove(&name);
                    hw.tracker.confirm(&DeviceKey::Volume(name))
                };
                self.after_device_change(confirmation)
            }
            HardwareEvent::NetDevRemoved { index } => {
                let settings = self
                    .ctx
                    .hw()
                    .networks
                    .get(&index)
                    .map(|b| b.settings.clone());
                if let Some(settings) = settings {
                    self.ctx.release_interface(settings);
                }
                Flow::Continue
            }
            HardwareEvent::InterfaceReleased { index, success } => {
                if !success {
                    tracing::warn!(sandbox_id = %self.ctx.id, index, "Interface release reported failure");
                }
                let confirmation = {
                    let mut hw = self.ctx.hw();
                    hw.networks.remove(&index);
                    hw.tracker.confirm(&DeviceKey::Network(index))
                };
                self.after_device_change(confirmation)
            }
            HardwareEvent::DeviceFailed {
                device,
                completion,
                reason,
            } => self.on_device_failed(device, completion, reason),
        }
    }

    fn on_interface_created(&mut self, settings: InterfaceSettings, pci_addr: u32) -> Flow {
        let index = settings.index;
        self.ctx.hw().networks.insert(
            index,
            NetworkBinding {
                settings: settings.clone(),
                pci_addr,
            },
        );

        if self.vm_exited {
            self.ctx.hw().tracker.mark_deleting(DeviceKey::Network(index));
            self.ctx.release_interface(settings);
            return Flow::Continue;
        }
        if self.phase != Phase::Starting {
            // Released with the rest of the pod on VM exit.
            return Flow::Continue;
        }

        let completion = HardwareEvent::NetDevInserted {
            index,
            device: guest_device_name(index),
            pci_addr,
        };
        match self.ctx.driver.add_nic(&settings, pci_addr, completion) {
            Ok(()) => Flow::Continue,
            Err(e) => self.fail(
                format!("failed to hotplug interface {}: {}", index, e),
                Some(format!("interface {}", index)),
            ),
        }
    }

    fn after_device_change(&mut self, confirmation: Confirmation) -> Flow {
        if confirmation == Confirmation::NotPending {
            return Flow::Continue;
        }
        match self.phase {
            Phase::Starting => self.maybe_start_pod(),
            Phase::Cleaning => self.maybe_ping_ready(),
            Phase::Destroying => self.try_close(),
            Phase::Init | Phase::Running | Phase::PodStopping | Phase::Terminating => {
                Flow::Continue
            }
        }
    }

    fn on_device_failed(
        &mut self,
        device: String,
        completion: Option<Box<HardwareEvent>>,
        reason: String,
    ) -> Flow {
        tracing::error!(
            sandbox_id = %self.ctx.id,
            device = %device,
            step = ?completion,
            reason = %reason,
            "Device operation failed"
        );
        match self.phase {
            Phase::Init | Phase::Starting | Phase::Running | Phase::PodStopping | Phase::Cleaning => {
                self.fail(reason, Some(device))
            }
            Phase::Terminating | Phase::Destroying => {
                self.ctx.reports.failed(reason, Some(device));
                Flow::Continue
            }
        }
    }

    /// Unplug everything attached for the pod.
    fn detach_devices(&mut self) -> Flow {
        if let Some(tty) = self.ctx.links.tty.as_ref() {
            tty.close_all();
        }

        let (disks, nics) = {
            let mut hw = self.ctx.hw();
            let disks: Vec<BlockBinding> = hw.block_devices.values().cloned().collect();
            let nics: Vec<NetworkBinding> = hw.networks.values().cloned().collect();
            for disk in &disks {
                hw.tracker.mark_deleting(disk.key());
            }
            for nic in &nics {
                hw.tracker.mark_deleting(DeviceKey::Network(nic.settings.index));
            }
            (disks, nics)
        };

        tracing::info!(
            sandbox_id = %self.ctx.id,
            disks = disks.len(),
            interfaces = nics.len(),
            "Detaching pod devices"
        );
        self.ready_sent = false;
        self.ctx.set_timeout(self.ctx.timeouts.stop_pod);
        self.transition(Phase::Cleaning);

        for disk in disks {
            let completion = match &disk.source {
                BlockSource::Image { container } => HardwareEvent::ContainerUnplugged {
                    index: *container,
                },
                BlockSource::Volume => HardwareEvent::VolumeUnplugged {
                    name: disk.name.clone(),
                },
            };
            if let Err(e) = self.ctx.driver.remove_disk(disk.scsi_id, completion) {
                return self.fail(format!("failed to unplug {}: {}", disk.name, e), Some(disk.name));
            }
        }
        for nic in nics {
            let index = nic.settings.index;
            if let Err(e) = self
                .ctx
                .driver
                .remove_nic(&nic.settings, HardwareEvent::NetDevRemoved { index })
            {
                return self.fail(
                    format!("failed to unplug interface {}: {}", index, e),
                    Some(format!("interface {}", index)),
                );
            }
        }

        self.maybe_ping_ready()
    }

    fn maybe_ping_ready(&mut self) -> Flow {
        if self.ready_sent || !self.ctx.hw().tracker.is_ready() {
            return Flow::Continue;
        }
        self.ready_sent = true;
        match self.send_guest(GuestCommand::new(InitCode::Ready, Vec::new())) {
            Ok(()) => Flow::Continue,
            Err(e) => self.fail(format!("failed to query init: {}", e), None),
        }
    }

    // ========================================================================
    // GUEST EVENTS
    // ========================================================================

    fn on_guest(&mut self, event: GuestEvent) -> Flow {
        match event {
            GuestEvent::Ack { command, reply } => self.on_ack(command, reply),
            GuestEvent::Failed { command, reply } => self.on_guest_failure(command, reply),
            GuestEvent::PodFinished { exit_codes } => self.on_pod_finished(exit_codes),
        }
    }

    fn on_ack(&mut self, command: GuestCommand, _reply: Vec<u8>) -> Flow {
        match (command.code, self.phase) {
            (InitCode::StartPod, Phase::Starting) => self.pod_started(),
            (InitCode::StopPod, Phase::PodStopping) => {
                self.ctx.unset_timeout();
                self.detach_devices()
            }
            (InitCode::Ready, Phase::Cleaning) => self.reinitialize(),
            (InitCode::DestroyPod, Phase::Terminating) => {
                self.request_quit();
                Flow::Continue
            }
            (InitCode::ExecCmd, _) => {
                self.ctx.reports.success("exec started");
                Flow::Continue
            }
            (code, phase) => {
                tracing::debug!(sandbox_id = %self.ctx.id, ?code, %phase, "Acknowledgement needs no action");
                Flow::Continue
            }
        }
    }

    fn on_guest_failure(&mut self, command: GuestCommand, reply: Vec<u8>) -> Flow {
        let cause = format!(
            "init rejected {:?}: {}",
            command.code,
            String::from_utf8_lossy(&reply)
        );
        match (command.code, self.phase) {
            (InitCode::StartPod, Phase::Starting)
            | (InitCode::StopPod, Phase::PodStopping)
            | (InitCode::Ready, Phase::Cleaning) => self.fail(cause, None),
            (InitCode::DestroyPod, Phase::Terminating) => {
                self.request_quit();
                Flow::Continue
            }
            (InitCode::ExecCmd, _) => {
                if let (Some(seq), Some(tty)) = (command.seq, self.ctx.links.tty.as_ref()) {
                    tty.close(seq);
                }
                self.ctx.reports.failed(cause, None);
                Flow::Continue
            }
            _ => {
                self.ctx.reports.failed(cause, None);
                Flow::Continue
            }
        }
    }

    fn on_pod_finished(&mut self, exit_codes: Vec<u32>) -> Flow {
        tracing::info!(sandbox_id = %self.ctx.id, ?exit_codes, "Pod finished");
        self.ctx.reports.emit(
            ReportKind::PodFinished {
                exit_codes: exit_codes.clone(),
            },
            "pod finished",
        );
        match self.phase {
            Phase::Starting | Phase::Running => self.exit_vm(false, "pod finished"),
            Phase::Init
            | Phase::PodStopping
            | Phase::Cleaning
            | Phase::Terminating
            | Phase::Destroying => Flow::Continue,
        }
    }

    fn pod_started(&mut self) -> Flow {
        self.ctx.unset_timeout();

        let consoles: Vec<(usize, u64)> = self
            .ctx
            .hw()
            .runtime
            .as_ref()
            .map(|r| {
                r.containers
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.tty != 0)
                    .map(|(i, c)| (i, c.tty))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(tty) = self.ctx.links.tty.as_ref() {
            for (container, session) in consoles {
                tty.create_persistent(session, container);
            }
        }

        let snapshot = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(sandbox_id = %self.ctx.id, error = %e, "Failed to snapshot sandbox");
                Vec::new()
            }
        };
        self.transition(Phase::Running);
        self.ctx
            .reports
            .emit(ReportKind::PodRunning { snapshot }, "pod is running");
        Flow::Continue
    }

    fn reinitialize(&mut self) -> Flow {
        self.ctx.unset_timeout();
        self.ctx.hw().reset();
        self.start_sent = false;
        self.ready_sent = false;
        self.transition(Phase::Init);
        self.ctx.reports.emit(ReportKind::PodStopped, "pod stopped");
        Flow::Continue
    }

    fn snapshot(&self) -> HyperliteResult<Vec<u8>> {
        let driver = self.ctx.driver.dump()?;
        let sessions = self
            .ctx
            .links
            .tty
            .as_ref()
            .map(|t| t.sessions())
            .unwrap_or_default();
        let hw = self.ctx.hw();
        Snapshot::dump(&self.ctx.id, &self.ctx.boot, driver, &hw, sessions).to_bytes()
    }
}
