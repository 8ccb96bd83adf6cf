//! One sandbox: a VM hosting a pod, driven by a single control loop.
//!
//! ## Architecture
//!
//! ```text
//!  Sandbox (handle) ──commands──┐
//!  monitor sessions ──hotplug───┤
//!  init channel ─────guest──────┼──► event queue ──► StateMachine ──► reports
//!  timers / VM exit ─lifecycle──┘                        │
//!                                                         └──► watch<Phase>
//! ```
//!
//! Every caller operation is posted as an event; outcomes arrive on the
//! report channel. The handle only observes the phase.

pub(crate) mod context;
pub mod events;
pub(crate) mod init;
mod machine;
pub(crate) mod persist;
pub mod report;
pub mod spec;
pub(crate) mod tracker;

pub use events::WindowSize;
pub use machine::Phase;
pub use report::{Report, ReportKind};
pub use spec::{ContainerInfo, PodSpec, VolumeInfo};

use crate::portal::TtyEndpoint;
use crate::util::kill_process;
use context::VmContext;
use events::{
    AttachRequest, EventReceiver, EventSender, ExecRequest, LifecycleEvent, RunPodRequest,
    SandboxCommand, VmEvent,
};
use hyperlite_shared::{HyperliteError, HyperliteResult};
use machine::StateMachine;
use tokio::sync::watch;

/// Handle to a running sandbox.
///
/// Cheap to clone. Dropping every handle does not stop the sandbox.
#[derive(Debug, Clone)]
pub struct Sandbox {
    id: String,
    pid: Option<u32>,
    events: EventSender,
    phase: watch::Receiver<Phase>,
}

impl Sandbox {
    /// Start the control loop over a booted context.
    pub(crate) fn start(ctx: VmContext, events: EventReceiver, phase: Phase) -> Self {
        let (phase_tx, phase_rx) = watch::channel(phase);
        let handle = Self {
            id: ctx.id.clone(),
            pid: ctx.driver.pid(),
            events: ctx.events.clone(),
            phase: phase_rx,
        };
        tokio::spawn(StateMachine::new(ctx, phase, events, phase_tx).run());
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hypervisor process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// True once the control loop finished.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Wait for the control loop to finish.
    pub async fn wait(&self) {
        let mut phase = self.phase.clone();
        while phase.changed().await.is_ok() {}
    }

    pub async fn run_pod(
        &self,
        spec: PodSpec,
        containers: Vec<ContainerInfo>,
        volumes: Vec<VolumeInfo>,
    ) -> HyperliteResult<()> {
        self.send(SandboxCommand::RunPod(Box::new(RunPodRequest {
            spec,
            containers,
            volumes,
        })))
        .await
    }

    pub async fn stop_pod(&self) -> HyperliteResult<()> {
        self.send(SandboxCommand::StopPod).await
    }

    /// Run a command in a container, streaming through `endpoint`.
    pub async fn exec(
        &self,
        container: impl Into<String>,
        command: Vec<String>,
        endpoint: TtyEndpoint,
    ) -> HyperliteResult<()> {
        self.send(SandboxCommand::Exec(ExecRequest {
            container: container.into(),
            command,
            endpoint,
        }))
        .await
    }

    /// Attach to the terminal of a container started with a TTY.
    pub async fn attach(
        &self,
        container: impl Into<String>,
        endpoint: TtyEndpoint,
    ) -> HyperliteResult<()> {
        self.send(SandboxCommand::Attach(AttachRequest {
            container: container.into(),
            endpoint,
        }))
        .await
    }

    /// Resize the terminal of the session an endpoint tag belongs to.
    pub async fn resize(&self, tag: impl Into<String>, size: WindowSize) -> HyperliteResult<()> {
        self.send(SandboxCommand::WindowSize {
            tag: tag.into(),
            size,
        })
        .await
    }

    pub async fn shutdown(&self) -> HyperliteResult<()> {
        self.send(SandboxCommand::Shutdown).await
    }

    /// Stop managing the sandbox but leave the VM running.
    pub async fn release(&self) -> HyperliteResult<()> {
        self.send(SandboxCommand::Release).await
    }

    /// Kill the hypervisor without asking the guest.
    pub async fn kill(&self) -> HyperliteResult<()> {
        if let Some(pid) = self.pid
            && !kill_process(pid)
        {
            tracing::warn!(sandbox_id = %self.id, pid, "SIGKILL failed");
        }
        self.post(LifecycleEvent::VmExit.into()).await
    }

    async fn send(&self, command: SandboxCommand) -> HyperliteResult<()> {
        tracing::debug!(sandbox_id = %self.id, command = command.name(), "Sandbox command");
        self.post(command.into()).await
    }

    async fn post(&self, event: VmEvent) -> HyperliteResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| HyperliteError::InvalidState(format!("sandbox {} is closed", self.id)))
    }
}
