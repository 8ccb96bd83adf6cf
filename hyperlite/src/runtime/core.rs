//! Sandbox runtime: owns every sandbox of one home directory.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::db::{Database, SnapshotStore};
use crate::init_logging_for;
use crate::net::{NetworkAllocator, TapAllocator};
use crate::portal::TtyEndpoint;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::RuntimeLock;
use crate::runtime::options::{BootConfig, RuntimeOptions};
use crate::runtime::types::generate_sandbox_id;
use crate::sandbox::context::VmContext;
use crate::sandbox::init::{BootMode, SandboxBuilder};
use crate::sandbox::persist::Snapshot;
use crate::sandbox::report::{Report, ReportKind, ReportSink};
use crate::sandbox::{ContainerInfo, Phase, PodSpec, Sandbox, VolumeInfo, WindowSize};
use crate::util::{is_process_alive, is_same_process};
use crate::vmm::QemuDriver;
use hyperlite_shared::{HyperliteError, HyperliteResult};

const REPORT_BACKLOG: usize = 256;

type SandboxMap = Arc<RwLock<HashMap<String, Sandbox>>>;

/// Entry point for creating and driving sandboxes.
///
/// **Lock Behavior**: only one `SandboxRuntime` can use a given home
/// directory at a time. The lock is released when the last clone drops.
///
/// **Cloning**: cheap, all clones share the same state.
#[derive(Clone)]
pub struct SandboxRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    options: RuntimeOptions,
    layout: FilesystemLayout,
    store: SnapshotStore,
    network: Arc<dyn NetworkAllocator>,
    sandboxes: SandboxMap,
    report_tx: mpsc::UnboundedSender<Report>,
    subscribers: broadcast::Sender<Report>,
    _runtime_lock: RuntimeLock,
}

/// Summary of one live sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub phase: Phase,
}

impl SandboxRuntime {
    /// Create a runtime and reattach to sandboxes that survived a restart.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(options: RuntimeOptions) -> HyperliteResult<Self> {
        let network: Arc<dyn NetworkAllocator> =
            Arc::new(TapAllocator::new(options.network.clone()));
        Self::with_network(options, network).await
    }

    /// Like [`SandboxRuntime::new`] with a custom host network provider.
    pub async fn with_network(
        options: RuntimeOptions,
        network: Arc<dyn NetworkAllocator>,
    ) -> HyperliteResult<Self> {
        options.sanitize()?;

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            HyperliteError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let runtime_lock = RuntimeLock::acquire(layout.home_dir())?;

        let db_path = layout.db_dir().join("hyperlite.db");
        let db = Database::open(&db_path).map_err(|e| {
            HyperliteError::Storage(format!(
                "Failed to initialize database at {}: {}",
                db_path.display(),
                e
            ))
        })?;
        let store = SnapshotStore::new(db);

        let sandboxes: SandboxMap = Arc::default();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(REPORT_BACKLOG);
        tokio::spawn(pump_reports(
            report_rx,
            store.clone(),
            Arc::clone(&sandboxes),
            subscribers.clone(),
        ));

        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                options,
                layout,
                store,
                network,
                sandboxes,
                report_tx,
                subscribers,
                _runtime_lock: runtime_lock,
            }),
        };
        tracing::debug!(home = %runtime.inner.layout.home_dir().display(), "Initialized runtime");

        let recovered = runtime.recover().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered sandboxes");
        }
        Ok(runtime)
    }

    /// Receive the status reports of every sandbox.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.inner.subscribers.subscribe()
    }

    /// Boot a new sandbox. It starts without a pod.
    pub async fn create(&self, boot: BootConfig) -> HyperliteResult<Sandbox> {
        let id = generate_sandbox_id();
        let options = &self.inner.options;
        let layout = self.inner.layout.sandbox_layout(&id);
        let (events_tx, events_rx) = mpsc::channel(options.event_queue_capacity);
        let reports = ReportSink::new(id.clone(), self.inner.report_tx.clone());

        tracing::info!(sandbox_id = %id, cpus = boot.cpus, memory_mib = boot.memory_mib, "Creating sandbox");
        let output = SandboxBuilder {
            sandbox_id: id.clone(),
            boot: boot.clone(),
            layout: layout.clone(),
            timeouts: options.timeouts,
            finish_policy: options.finish_policy,
            reports: reports.clone(),
            events: events_tx.clone(),
            driver: Box::new(self.new_driver(&id)),
            mode: BootMode::Fresh,
        }
        .build()
        .await?;

        let ctx = VmContext::new(
            id.clone(),
            boot,
            layout,
            options.timeouts,
            reports.clone(),
            events_tx,
            output.driver,
            Arc::clone(&self.inner.network),
            output.links,
        );
        let sandbox = Sandbox::start(ctx, events_rx, Phase::Init);
        self.inner.sandboxes.write().insert(id, sandbox.clone());
        reports.vm_running();
        Ok(sandbox)
    }

    pub fn get(&self, id: &str) -> Option<Sandbox> {
        self.inner.sandboxes.read().get(id).cloned()
    }

    /// Live sandboxes, oldest first.
    pub fn list(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self
            .inner
            .sandboxes
            .read()
            .values()
            .map(|s| SandboxInfo {
                id: s.id().to_string(),
                pid: s.pid(),
                phase: s.phase(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn run_pod(
        &self,
        id: &str,
        spec: PodSpec,
        containers: Vec<ContainerInfo>,
        volumes: Vec<VolumeInfo>,
    ) -> HyperliteResult<()> {
        self.require(id)?.run_pod(spec, containers, volumes).await
    }

    pub async fn stop_pod(&self, id: &str) -> HyperliteResult<()> {
        self.require(id)?.stop_pod().await
    }

    pub async fn exec(
        &self,
        id: &str,
        container: &str,
        command: Vec<String>,
        endpoint: TtyEndpoint,
    ) -> HyperliteResult<()> {
        self.require(id)?.exec(container, command, endpoint).await
    }

    pub async fn attach(
        &self,
        id: &str,
        container: &str,
        endpoint: TtyEndpoint,
    ) -> HyperliteResult<()> {
        self.require(id)?.attach(container, endpoint).await
    }

    pub async fn resize(&self, id: &str, tag: &str, size: WindowSize) -> HyperliteResult<()> {
        self.require(id)?.resize(tag, size).await
    }

    pub async fn shutdown(&self, id: &str) -> HyperliteResult<()> {
        self.require(id)?.shutdown().await
    }

    /// Stop managing a sandbox and leave its VM running.
    ///
    /// The persisted snapshot is kept so a later runtime can recover it.
    pub async fn release(&self, id: &str) -> HyperliteResult<()> {
        let sandbox = self.require(id)?;
        sandbox.release().await?;
        sandbox.wait().await;
        self.inner.sandboxes.write().remove(id);
        Ok(())
    }

    pub async fn kill(&self, id: &str) -> HyperliteResult<()> {
        self.require(id)?.kill().await
    }

    /// Reattach to every persisted sandbox whose hypervisor is still alive.
    ///
    /// Entries of dead sandboxes are purged. Returns the recovered ids.
    pub async fn recover(&self) -> HyperliteResult<Vec<String>> {
        let mut recovered = Vec::new();

        for record in self.inner.store.list()? {
            let id = record.sandbox_id.clone();
            if self.inner.sandboxes.read().contains_key(&id) {
                continue;
            }

            let snapshot = match Snapshot::from_bytes(&record.snapshot) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Dropping unreadable snapshot");
                    self.purge(&id);
                    continue;
                }
            };

            let pid = snapshot.driver.pid();
            if !is_process_alive(pid) || !is_same_process(pid, &id) {
                tracing::info!(sandbox_id = %id, pid, "Hypervisor gone, purging snapshot");
                for binding in &snapshot.networks {
                    if let Err(e) = self.inner.network.release(&binding.settings).await {
                        tracing::warn!(sandbox_id = %id, error = %e, "Failed to release interface");
                    }
                }
                self.purge(&id);
                continue;
            }

            match self.reattach(snapshot).await {
                Ok(sandbox) => {
                    self.inner.sandboxes.write().insert(id.clone(), sandbox);
                    recovered.push(id);
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %id, pid, error = %e, "Failed to reattach sandbox");
                }
            }
        }

        Ok(recovered)
    }

    async fn reattach(&self, snapshot: Snapshot) -> HyperliteResult<Sandbox> {
        let id = snapshot.id.clone();
        let options = &self.inner.options;
        let layout = self.inner.layout.sandbox_layout(&id);
        let (events_tx, events_rx) = mpsc::channel(options.event_queue_capacity);
        let reports = ReportSink::new(id.clone(), self.inner.report_tx.clone());

        let output = SandboxBuilder {
            sandbox_id: id.clone(),
            boot: snapshot.boot.clone(),
            layout: layout.clone(),
            timeouts: options.timeouts,
            finish_policy: options.finish_policy,
            reports: reports.clone(),
            events: events_tx.clone(),
            driver: Box::new(self.new_driver(&id)),
            mode: BootMode::Reattach(snapshot.driver.clone()),
        }
        .build()
        .await?;

        for binding in &snapshot.networks {
            self.inner.network.restore(&binding.settings);
        }
        if let Some(tty) = output.links.tty.as_ref() {
            for session in &snapshot.tty_sessions {
                tty.create_persistent(session.session, session.container);
            }
        }

        let ctx = VmContext::new(
            id,
            snapshot.boot.clone(),
            layout,
            options.timeouts,
            reports,
            events_tx,
            output.driver,
            Arc::clone(&self.inner.network),
            output.links,
        );
        ctx.restore_hw(snapshot.load());
        Ok(Sandbox::start(ctx, events_rx, Phase::Running))
    }

    fn new_driver(&self, id: &str) -> QemuDriver {
        let options = &self.inner.options;
        QemuDriver::new(
            id,
            options.qemu_binary.clone(),
            options.monitor_retry,
            options.timeouts.monitor_handshake,
        )
    }

    fn purge(&self, id: &str) {
        if let Err(e) = self.inner.store.delete(id) {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to delete snapshot");
        }
        if let Err(e) = self.inner.layout.sandbox_layout(id).cleanup() {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to remove sandbox directory");
        }
    }

    fn require(&self, id: &str) -> HyperliteResult<Sandbox> {
        self.get(id)
            .ok_or_else(|| HyperliteError::NotFound(format!("sandbox {}", id)))
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .field("sandboxes", &self.inner.sandboxes.read().len())
            .finish()
    }
}

/// Persist snapshots and fan reports out to subscribers.
async fn pump_reports(
    mut reports: mpsc::UnboundedReceiver<Report>,
    store: SnapshotStore,
    sandboxes: SandboxMap,
    subscribers: broadcast::Sender<Report>,
) {
    while let Some(report) = reports.recv().await {
        match &report.kind {
            ReportKind::PodRunning { snapshot } if !snapshot.is_empty() => {
                let pid = sandboxes
                    .read()
                    .get(&report.sandbox_id)
                    .and_then(|s| s.pid());
                match pid {
                    Some(pid) => {
                        if let Err(e) = store.save(&report.sandbox_id, pid, snapshot) {
                            tracing::error!(sandbox_id = %report.sandbox_id, error = %e, "Failed to persist snapshot");
                        }
                    }
                    None => {
                        tracing::warn!(sandbox_id = %report.sandbox_id, "No hypervisor pid, snapshot not persisted");
                    }
                }
            }
            ReportKind::VmShutdown => {
                sandboxes.write().remove(&report.sandbox_id);
                if let Err(e) = store.delete(&report.sandbox_id) {
                    tracing::warn!(sandbox_id = %report.sandbox_id, error = %e, "Failed to delete snapshot");
                }
            }
            _ => {}
        }
        // No subscribers is fine.
        let _ = subscribers.send(report);
    }
    tracing::debug!("Report pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::persist::SNAPSHOT_VERSION;
    use crate::vmm::DriverState;
    use tempfile::TempDir;

    fn options(home: &TempDir) -> RuntimeOptions {
        RuntimeOptions {
            home_dir: home.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn dead_snapshot(id: &str) -> Vec<u8> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            id: id.to_string(),
            boot: BootConfig::default(),
            // Never a live hypervisor of this sandbox.
            driver: DriverState::Qemu { pid: i32::MAX as u32 },
            counters: Default::default(),
            pod: None,
            runtime: None,
            containers: Vec::new(),
            volumes: Vec::new(),
            block_devices: Vec::new(),
            networks: Vec::new(),
            tty_sessions: Vec::new(),
        };
        snapshot.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_second_runtime_on_same_home_fails() {
        let home = TempDir::new().unwrap();
        let _runtime = SandboxRuntime::new(options(&home)).await.unwrap();
        assert!(SandboxRuntime::new(options(&home)).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_purges_dead_sandboxes() {
        let home = TempDir::new().unwrap();
        {
            let db = Database::open(&home.path().join("db").join("hyperlite.db")).unwrap();
            let store = SnapshotStore::new(db);
            store.save("01DEAD", i32::MAX as u32, &dead_snapshot("01DEAD")).unwrap();
            store.save("01JUNK", 1, b"not json").unwrap();
        }
        std::fs::create_dir_all(home.path().join("sandboxes").join("01DEAD")).unwrap();

        let runtime = SandboxRuntime::new(options(&home)).await.unwrap();
        assert!(runtime.list().is_empty());
        assert!(runtime.inner.store.list().unwrap().is_empty());
        assert!(!home.path().join("sandboxes").join("01DEAD").exists());
    }

    #[tokio::test]
    async fn test_unknown_sandbox_is_not_found() {
        let home = TempDir::new().unwrap();
        let runtime = SandboxRuntime::new(options(&home)).await.unwrap();
        assert!(matches!(
            runtime.stop_pod("nope").await,
            Err(HyperliteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_fails_cleanly_without_hypervisor() {
        let home = TempDir::new().unwrap();
        let mut options = options(&home);
        options.qemu_binary = home.path().join("no-such-qemu");
        let runtime = SandboxRuntime::new(options).await.unwrap();

        let err = runtime.create(BootConfig::default()).await.unwrap_err();
        assert!(matches!(err, HyperliteError::Engine(_)));
        assert!(runtime.list().is_empty());
        // The guard removed the half-created directory.
        let leftovers = std::fs::read_dir(home.path().join("sandboxes")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
