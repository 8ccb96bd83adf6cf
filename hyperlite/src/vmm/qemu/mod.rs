//! QEMU backend.

mod args;

use super::{DriverState, HypervisorDriver, LaunchSpec, VmmKind};
use crate::monitor::{Hotplug, RetryPolicy, Session, SessionQueue};
use crate::net::InterfaceSettings;
use crate::sandbox::events::{EventSender, HardwareEvent, LifecycleEvent, post};
use crate::util::{connect_unix, is_process_alive, is_same_process, kill_process};
use async_trait::async_trait;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task::AbortHandle;

const LIVENESS_POLL: Duration = Duration::from_secs(1);

pub struct QemuDriver {
    sandbox_id: String,
    binary: PathBuf,
    retry: RetryPolicy,
    connect_timeout: Duration,
    pid: Option<u32>,
    monitor: Option<SessionQueue>,
    watcher: Option<AbortHandle>,
}

impl QemuDriver {
    pub fn new(
        sandbox_id: impl Into<String>,
        binary: impl Into<PathBuf>,
        retry: RetryPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            binary: binary.into(),
            retry,
            connect_timeout,
            pid: None,
            monitor: None,
            watcher: None,
        }
    }

    /// Serve monitor sessions on an already connected stream.
    pub fn attach_monitor(&mut self, stream: UnixStream, events: EventSender) {
        self.monitor = Some(SessionQueue::spawn(
            self.sandbox_id.clone(),
            stream,
            self.retry,
            self.connect_timeout,
            events,
        ));
    }

    /// Treat `pid` as the hypervisor process without watching it.
    #[cfg(test)]
    pub(crate) fn adopt_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    fn submit(&self, session: Session) -> HyperliteResult<()> {
        tracing::debug!(sandbox_id = %self.sandbox_id, session = %session.label, "Submitting monitor session");
        self.monitor
            .as_ref()
            .ok_or_else(|| HyperliteError::Engine("monitor is not connected".into()))?
            .submit(session)
    }

    async fn connect_monitor(&mut self, socket: &Path, events: EventSender) -> HyperliteResult<()> {
        let stream = connect_unix(socket, self.connect_timeout).await?;
        self.attach_monitor(stream, events);
        Ok(())
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    fn kind(&self) -> VmmKind {
        VmmKind::Qemu
    }

    async fn launch(&mut self, spec: &LaunchSpec, events: EventSender) -> HyperliteResult<()> {
        let kvm = Path::new("/dev/kvm").exists();
        if !kvm {
            tracing::warn!(sandbox_id = %spec.sandbox_id, "/dev/kvm not found, running without acceleration");
        }
        let args = args::build(&spec.sandbox_id, &spec.boot, &spec.layout, kvm);
        tracing::debug!(sandbox_id = %spec.sandbox_id, binary = %self.binary.display(), ?args, "Launching QEMU");

        let log = std::fs::File::create(spec.layout.hypervisor_log())?;
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| {
                HyperliteError::Engine(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| HyperliteError::Engine("QEMU exited immediately".into()))?;
        self.pid = Some(pid);
        tracing::info!(sandbox_id = %spec.sandbox_id, pid, "QEMU started");

        let sandbox_id = spec.sandbox_id.clone();
        let exit_events = events.clone();
        self.watcher = Some(
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::info!(sandbox_id = %sandbox_id, %status, "QEMU exited"),
                    Err(e) => tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to wait for QEMU"),
                }
                post(&exit_events, LifecycleEvent::VmExit).await;
            })
            .abort_handle(),
        );

        self.connect_monitor(&spec.layout.monitor_socket(), events)
            .await
    }

    async fn associate(
        &mut self,
        spec: &LaunchSpec,
        state: &DriverState,
        events: EventSender,
    ) -> HyperliteResult<()> {
        let DriverState::Qemu { pid } = *state;
        if !is_process_alive(pid) || !is_same_process(pid, &spec.sandbox_id) {
            return Err(HyperliteError::Engine(format!(
                "QEMU process {} of sandbox {} is gone",
                pid, spec.sandbox_id
            )));
        }
        self.pid = Some(pid);
        tracing::info!(sandbox_id = %spec.sandbox_id, pid, "Associated with running QEMU");

        let sandbox_id = spec.sandbox_id.clone();
        let exit_events = events.clone();
        self.watcher = Some(
            tokio::spawn(async move {
                while is_process_alive(pid) {
                    tokio::time::sleep(LIVENESS_POLL).await;
                }
                tracing::info!(sandbox_id = %sandbox_id, pid, "QEMU exited");
                post(&exit_events, LifecycleEvent::VmExit).await;
            })
            .abort_handle(),
        );

        self.connect_monitor(&spec.layout.monitor_socket(), events)
            .await
    }

    fn add_disk(
        &self,
        filename: &str,
        format: &str,
        scsi_id: u32,
        completion: HardwareEvent,
    ) -> HyperliteResult<()> {
        self.submit(Session::hotplug(
            Hotplug::DiskAdd {
                filename: filename.to_string(),
                format: format.to_string(),
                scsi_id,
            },
            completion,
        ))
    }

    fn remove_disk(&self, scsi_id: u32, completion: HardwareEvent) -> HyperliteResult<()> {
        self.submit(Session::hotplug(Hotplug::DiskRemove { scsi_id }, completion))
    }

    fn add_nic(
        &self,
        settings: &InterfaceSettings,
        pci_addr: u32,
        completion: HardwareEvent,
    ) -> HyperliteResult<()> {
        let fd = settings.fd.clone().ok_or_else(|| {
            HyperliteError::Network(format!(
                "interface {} has no tap descriptor",
                settings.host_device
            ))
        })?;
        self.submit(Session::hotplug(
            Hotplug::NicAdd {
                device: settings.host_device.clone(),
                fd,
                mac: settings.mac.clone(),
                pci_addr,
            },
            completion,
        ))
    }

    fn remove_nic(
        &self,
        settings: &InterfaceSettings,
        completion: HardwareEvent,
    ) -> HyperliteResult<()> {
        self.submit(Session::hotplug(
            Hotplug::NicRemove {
                device: settings.host_device.clone(),
            },
            completion,
        ))
    }

    fn shutdown(&self) -> HyperliteResult<()> {
        self.submit(Session::quit())
    }

    fn kill(&self) -> HyperliteResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        tracing::info!(sandbox_id = %self.sandbox_id, pid, "Killing QEMU");
        if kill_process(pid) {
            Ok(())
        } else {
            Err(HyperliteError::Engine(format!(
                "failed to kill QEMU process {}",
                pid
            )))
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn dump(&self) -> HyperliteResult<DriverState> {
        self.pid
            .map(|pid| DriverState::Qemu { pid })
            .ok_or_else(|| HyperliteError::InvalidState("QEMU is not running".into()))
    }

    fn close(&mut self) {
        self.monitor = None;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for QemuDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testing::{FakeMonitor, FakeReply};
    use crate::sandbox::events::{BlockSource, VmEvent};
    use tokio::sync::mpsc;

    fn driver_on_fake() -> (QemuDriver, FakeMonitor, mpsc::Receiver<VmEvent>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let monitor = FakeMonitor::spawn(theirs, |_| FakeReply::Ok);
        let (events_tx, events) = mpsc::channel(8);
        let mut driver = QemuDriver::new(
            "sb1",
            "qemu-system-x86_64",
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        driver.attach_monitor(ours, events_tx);
        (driver, monitor, events)
    }

    #[tokio::test]
    async fn test_add_disk_raises_completion() {
        let (driver, monitor, mut events) = driver_on_fake();
        driver
            .add_disk(
                "/dev/dm-7",
                "raw",
                0,
                HardwareEvent::BlockdevInserted {
                    name: "rootfs0".into(),
                    source: BlockSource::Image { container: 0 },
                    device_name: "sda".into(),
                    scsi_id: 0,
                },
            )
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Hardware(HardwareEvent::BlockdevInserted { .. })
        ));
        let received = monitor.received();
        assert_eq!(
            received[1]["arguments"]["command-line"],
            "drive_add dummy file=/dev/dm-7,if=none,id=drive0,format=raw,cache=writeback"
        );
    }

    #[tokio::test]
    async fn test_nic_without_fd_is_rejected() {
        let (driver, _monitor, _events) = driver_on_fake();
        let settings = InterfaceSettings {
            index: 0,
            host_device: "hltap0".into(),
            mac: "52:54:00:00:00:01".into(),
            ip_addr: "192.168.123.2".parse().unwrap(),
            prefix_len: 24,
            gateway: "192.168.123.1".parse().unwrap(),
            bridge: None,
            fd: None,
        };
        let err = driver
            .add_nic(
                &settings,
                5,
                HardwareEvent::NetDevInserted {
                    index: 0,
                    device: "eth0".into(),
                    pci_addr: 5,
                },
            )
            .unwrap_err();
        assert!(matches!(err, HyperliteError::Network(_)));
    }

    #[tokio::test]
    async fn test_shutdown_sends_quit() {
        let (driver, monitor, _events) = driver_on_fake();
        driver.shutdown().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.executes(), vec!["qmp_capabilities", "quit"]);
    }

    #[test]
    fn test_dump_requires_pid() {
        let driver = QemuDriver::new("sb1", "qemu", RetryPolicy::default(), Duration::from_secs(1));
        assert!(driver.dump().is_err());
        assert_eq!(driver.kind(), VmmKind::Qemu);
        assert!(driver.kill().is_ok());
        assert!(driver.submit(Session::quit()).is_err());
    }

    #[tokio::test]
    async fn test_associate_rejects_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            sandbox_id: "sb1".into(),
            boot: Default::default(),
            layout: crate::runtime::SandboxLayout::new(dir.path().to_path_buf()),
        };
        let (events_tx, _events) = mpsc::channel(1);
        let mut driver =
            QemuDriver::new("sb1", "qemu", RetryPolicy::default(), Duration::from_millis(10));
        let err = driver
            .associate(&spec, &DriverState::Qemu { pid: u32::MAX }, events_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, HyperliteError::Engine(_)));
    }
}
