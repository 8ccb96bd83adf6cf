//! Hyperlite: control plane for pods running inside hypervisor-isolated VMs.
//!
//! A [`SandboxRuntime`] boots one QEMU VM per sandbox, hotplugs the disks
//! and NICs a pod needs through the QEMU monitor, and drives the guest init
//! process over virtio-serial. Each sandbox is owned by a single control loop
//! fed by one event queue; outcomes are published as [`Report`]s.

pub mod db;
pub mod monitor;
pub mod net;
pub mod pipeline;
pub mod portal;
pub mod runtime;
pub mod sandbox;
pub mod util;
pub mod vmm;

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub use hyperlite_shared::{HyperliteError, HyperliteResult};
pub use portal::{TtyClient, TtyEndpoint};
pub use runtime::{
    BootConfig, FilesystemLayout, RuntimeOptions, SandboxInfo, SandboxRuntime, Timeouts,
};
pub use sandbox::{
    ContainerInfo, Phase, PodSpec, Report, ReportKind, Sandbox, VolumeInfo, WindowSize,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install file logging under `<home>/logs`.
///
/// Only the first call installs a subscriber; later calls, or a subscriber
/// installed by the embedding application, leave logging untouched.
pub fn init_logging_for(layout: &FilesystemLayout) -> HyperliteResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        HyperliteError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "hyperlite.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_ansi(false);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .is_ok()
    {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
