//! Status reports emitted to the daemon.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    VmRunning,
    VmShutdown,
    PodRunning { snapshot: Vec<u8> },
    PodStopped,
    PodFinished { exit_codes: Vec<u32> },
    Success,
    Failed { device: Option<String> },
    Busy,
    BadRequest,
    ExecFinished { session: u64 },
    NoTty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub sandbox_id: String,
    pub kind: ReportKind,
    pub cause: String,
}

/// Sending half of the report channel, bound to one sandbox.
///
/// Reporting never blocks the control loop.
#[derive(Debug, Clone)]
pub struct ReportSink {
    sandbox_id: String,
    tx: mpsc::UnboundedSender<Report>,
}

impl ReportSink {
    pub fn new(sandbox_id: impl Into<String>, tx: mpsc::UnboundedSender<Report>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            tx,
        }
    }

    pub fn emit(&self, kind: ReportKind, cause: impl Into<String>) {
        let report = Report {
            sandbox_id: self.sandbox_id.clone(),
            kind,
            cause: cause.into(),
        };
        if self.tx.send(report).is_err() {
            tracing::debug!(sandbox_id = %self.sandbox_id, "Report receiver dropped");
        }
    }

    pub fn vm_running(&self) {
        self.emit(ReportKind::VmRunning, "sandbox is running");
    }

    pub fn vm_shutdown(&self) {
        self.emit(ReportKind::VmShutdown, "sandbox shut down");
    }

    pub fn success(&self, cause: impl Into<String>) {
        self.emit(ReportKind::Success, cause);
    }

    pub fn failed(&self, cause: impl Into<String>, device: Option<String>) {
        self.emit(ReportKind::Failed { device }, cause);
    }

    pub fn busy(&self, cause: impl Into<String>) {
        self.emit(ReportKind::Busy, cause);
    }

    pub fn bad_request(&self, cause: impl Into<String>) {
        self.emit(ReportKind::BadRequest, cause);
    }
}
