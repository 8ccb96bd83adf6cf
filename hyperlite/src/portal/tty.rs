//! TTY session multiplexing over the shared `tty.sock` stream.
//!
//! Each attach id names one guest-side session. A session fans its output
//! out to every attached endpoint; each endpoint's input is forwarded by its
//! own task, tagged with the session id. Persistent sessions (container
//! consoles) outlive their endpoints; one-shot sessions (exec) close with
//! their last endpoint.

use crate::sandbox::events::{EventSender, LifecycleEvent, post};
use crate::sandbox::report::{ReportKind, ReportSink};
use hyperlite_shared::TtyFrame;
use hyperlite_shared::constants::tty::DETACH_KEY;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

const INPUT_BUFFER: usize = 64;

/// Caller side of a TTY attachment.
#[derive(Debug)]
pub struct TtyEndpoint {
    /// Client tag used to address the session later (window resize).
    pub tag: String,
    /// Closing the sending side detaches the endpoint.
    pub input: Option<mpsc::Receiver<Vec<u8>>>,
    /// Dropping the receiver detaches the endpoint on the next output.
    pub output: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Fired when the endpoint is detached or its session closes.
    pub on_close: Option<oneshot::Sender<()>>,
}

/// The other ends of a [`TtyEndpoint`] created with [`TtyEndpoint::pair`].
#[derive(Debug)]
pub struct TtyClient {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub closed: oneshot::Receiver<()>,
}

impl TtyEndpoint {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            input: None,
            output: None,
            on_close: None,
        }
    }

    pub fn pair(tag: impl Into<String>) -> (Self, TtyClient) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let endpoint = Self {
            tag: tag.into(),
            input: Some(input_rx),
            output: Some(output_tx),
            on_close: Some(close_tx),
        };
        let client = TtyClient {
            input: input_tx,
            output: output_rx,
            closed: close_rx,
        };
        (endpoint, client)
    }
}

/// Persisted description of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: u64,
    pub container: usize,
    pub persistent: bool,
}

struct Attachment {
    id: u64,
    tag: String,
    output: Option<mpsc::UnboundedSender<Vec<u8>>>,
    on_close: Option<oneshot::Sender<()>>,
    forwarder: Option<AbortHandle>,
}

impl Attachment {
    fn finish(self) {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        if let Some(on_close) = self.on_close {
            let _ = on_close.send(());
        }
    }
}

struct TtySession {
    container: usize,
    persistent: bool,
    attachments: Vec<Attachment>,
}

#[derive(Default)]
struct MuxState {
    sessions: HashMap<u64, TtySession>,
    tags: HashMap<String, u64>,
    next_endpoint: u64,
}

struct MuxInner {
    sandbox_id: String,
    state: Mutex<MuxState>,
    outbound: mpsc::UnboundedSender<TtyFrame>,
    reports: ReportSink,
}

/// Multiplexer owning the TTY stream of one sandbox.
pub struct TtyMux {
    inner: Arc<MuxInner>,
    tasks: [AbortHandle; 2],
}

impl TtyMux {
    pub fn spawn(
        sandbox_id: String,
        stream: UnixStream,
        reports: ReportSink,
        events: EventSender,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, frames) = mpsc::unbounded_channel();
        let inner = Arc::new(MuxInner {
            sandbox_id,
            state: Mutex::new(MuxState::default()),
            outbound,
            reports,
        });

        let read_task = tokio::spawn(read_loop(inner.clone(), reader, events)).abort_handle();
        let write_task =
            tokio::spawn(write_loop(inner.sandbox_id.clone(), writer, frames)).abort_handle();

        Self {
            inner,
            tasks: [read_task, write_task],
        }
    }

    /// Register a session that survives without endpoints.
    pub fn create_persistent(&self, session: u64, container: usize) {
        let mut state = self.inner.state.lock();
        state
            .sessions
            .entry(session)
            .or_insert_with(|| TtySession {
                container,
                persistent: true,
                attachments: Vec::new(),
            })
            .persistent = true;
    }

    /// Attach an endpoint, creating the session on first use.
    ///
    /// Returns the endpoint id for [`TtyMux::detach`].
    pub fn attach(
        &self,
        session: u64,
        container: usize,
        persistent: bool,
        endpoint: TtyEndpoint,
    ) -> u64 {
        let TtyEndpoint {
            tag,
            input,
            output,
            on_close,
        } = endpoint;

        let mut state = self.inner.state.lock();
        state.next_endpoint += 1;
        let id = state.next_endpoint;

        let forwarder = input.map(|input| {
            tokio::spawn(forward_input(self.inner.clone(), session, id, input)).abort_handle()
        });

        state.tags.insert(tag.clone(), session);
        let entry = state.sessions.entry(session).or_insert_with(|| TtySession {
            container,
            persistent,
            attachments: Vec::new(),
        });
        entry.persistent |= persistent;
        entry.attachments.push(Attachment {
            id,
            tag,
            output,
            on_close,
            forwarder,
        });

        tracing::debug!(
            sandbox_id = %self.inner.sandbox_id,
            session,
            container,
            endpoints = entry.attachments.len(),
            "TTY endpoint attached"
        );
        id
    }

    pub fn detach(&self, session: u64, endpoint: u64) {
        self.inner.detach(session, endpoint);
    }

    /// Close a session from the host side and tell the guest.
    pub fn close(&self, session: u64) {
        self.inner.close_session(session, true);
    }

    /// Close every session without notifying the guest.
    pub fn close_all(&self) {
        let sessions: Vec<u64> = self.inner.state.lock().sessions.keys().copied().collect();
        for session in sessions {
            self.inner.close_session(session, false);
        }
    }

    pub fn resolve(&self, tag: &str) -> Option<u64> {
        self.inner.state.lock().tags.get(tag).copied()
    }

    pub fn has_session(&self, session: u64) -> bool {
        self.inner.state.lock().sessions.contains_key(&session)
    }

    /// Persistent session of a container, if it has one.
    pub fn persistent_session(&self, container: usize) -> Option<u64> {
        self.inner
            .state
            .lock()
            .sessions
            .iter()
            .find(|(_, s)| s.persistent && s.container == container)
            .map(|(id, _)| *id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.inner.state.lock();
        let mut sessions: Vec<SessionInfo> = state
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                session: *id,
                container: s.container,
                persistent: s.persistent,
            })
            .collect();
        sessions.sort_by_key(|s| s.session);
        sessions
    }
}

impl Drop for TtyMux {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.close_all();
    }
}

impl MuxInner {
    fn deliver(&self, frame: TtyFrame) {
        if frame.is_close() {
            tracing::debug!(sandbox_id = %self.sandbox_id, session = frame.session, "Guest closed TTY session");
            self.close_session(frame.session, false);
            return;
        }

        let gone: Vec<u64> = {
            let state = self.state.lock();
            let Some(session) = state.sessions.get(&frame.session) else {
                tracing::trace!(sandbox_id = %self.sandbox_id, session = frame.session, "Output for unknown TTY session");
                return;
            };
            session
                .attachments
                .iter()
                .filter(|a| {
                    a.output
                        .as_ref()
                        .is_some_and(|output| output.send(frame.payload.clone()).is_err())
                })
                .map(|a| a.id)
                .collect()
        };
        // Receivers that went away take their endpoint with them.
        for endpoint in gone {
            self.detach(frame.session, endpoint);
        }
    }

    fn detach(&self, session: u64, endpoint: u64) {
        let (attachment, close) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.sessions.get_mut(&session) else {
                return;
            };
            let Some(pos) = entry.attachments.iter().position(|a| a.id == endpoint) else {
                return;
            };
            let attachment = entry.attachments.remove(pos);
            let close = entry.attachments.is_empty() && !entry.persistent;
            if !entry.attachments.iter().any(|a| a.tag == attachment.tag) {
                state.tags.remove(&attachment.tag);
            }
            (attachment, close)
        };

        tracing::debug!(sandbox_id = %self.sandbox_id, session, endpoint, "TTY endpoint detached");
        attachment.finish();
        if close {
            self.close_session(session, true);
        }
    }

    fn close_session(&self, session: u64, notify_guest: bool) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.sessions.remove(&session);
            if removed.is_some() {
                state.tags.retain(|_, s| *s != session);
            }
            removed
        };
        let Some(removed) = removed else {
            return;
        };

        if notify_guest {
            let _ = self.outbound.send(TtyFrame::close(session));
        }
        for attachment in removed.attachments {
            attachment.finish();
        }
        if !removed.persistent {
            self.reports.emit(
                ReportKind::ExecFinished { session },
                format!("tty session {} closed", session),
            );
        }
    }
}

async fn forward_input(
    inner: Arc<MuxInner>,
    session: u64,
    endpoint: u64,
    mut input: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(chunk) = input.recv().await {
        if let Some(pos) = chunk.iter().position(|b| *b == DETACH_KEY) {
            if pos > 0 {
                let _ = inner
                    .outbound
                    .send(TtyFrame::new(session, chunk[..pos].to_vec()));
            }
            inner.detach(session, endpoint);
            return;
        }
        if !chunk.is_empty() && inner.outbound.send(TtyFrame::new(session, chunk)).is_err() {
            return;
        }
    }
    tracing::debug!(sandbox_id = %inner.sandbox_id, session, endpoint, "TTY input closed");
    inner.detach(session, endpoint);
}

async fn read_loop(inner: Arc<MuxInner>, mut reader: OwnedReadHalf, events: EventSender) {
    loop {
        match TtyFrame::read_from(&mut reader).await {
            Ok(frame) => inner.deliver(frame),
            Err(e) => {
                tracing::warn!(sandbox_id = %inner.sandbox_id, error = %e, "TTY socket failed");
                post(
                    &events,
                    LifecycleEvent::Interrupted {
                        reason: format!("tty socket failed: {}", e),
                    },
                )
                .await;
                return;
            }
        }
    }
}

async fn write_loop(
    sandbox_id: String,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<TtyFrame>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "TTY write failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::report::Report;
    use std::time::Duration;

    struct Harness {
        mux: TtyMux,
        guest: UnixStream,
        reports: mpsc::UnboundedReceiver<Report>,
        _events: mpsc::Receiver<crate::sandbox::events::VmEvent>,
    }

    fn harness() -> Harness {
        let (ours, guest) = UnixStream::pair().unwrap();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(8);
        let mux = TtyMux::spawn(
            "test".into(),
            ours,
            ReportSink::new("test", report_tx),
            events_tx,
        );
        Harness {
            mux,
            guest,
            reports,
            _events: events,
        }
    }

    #[tokio::test]
    async fn test_output_fans_out_to_every_endpoint() {
        let mut h = harness();
        h.mux.create_persistent(1, 0);
        let (a, mut client_a) = TtyEndpoint::pair("a");
        let (b, mut client_b) = TtyEndpoint::pair("b");
        h.mux.attach(1, 0, true, a);
        h.mux.attach(1, 0, true, b);

        TtyFrame::new(1, b"hello".to_vec())
            .write_to(&mut h.guest)
            .await
            .unwrap();

        assert_eq!(client_a.output.recv().await.unwrap(), b"hello");
        assert_eq!(client_b.output.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_input_is_tagged_with_session() {
        let mut h = harness();
        let (endpoint, client) = TtyEndpoint::pair("exec-1");
        h.mux.attach(2, 0, false, endpoint);
        assert_eq!(h.mux.resolve("exec-1"), Some(2));

        client.input.send(b"ls\n".to_vec()).await.unwrap();
        let frame = TtyFrame::read_from(&mut h.guest).await.unwrap();
        assert_eq!(frame, TtyFrame::new(2, b"ls\n".to_vec()));
    }

    #[tokio::test]
    async fn test_detach_key_keeps_persistent_session() {
        let mut h = harness();
        h.mux.create_persistent(3, 1);
        let (endpoint, client) = TtyEndpoint::pair("console");
        h.mux.attach(3, 1, true, endpoint);

        client.input.send(vec![b'x', DETACH_KEY]).await.unwrap();
        client.closed.await.unwrap();

        let frame = TtyFrame::read_from(&mut h.guest).await.unwrap();
        assert_eq!(frame, TtyFrame::new(3, b"x".to_vec()));
        assert!(h.mux.has_session(3));
        assert_eq!(h.mux.resolve("console"), None);
        assert_eq!(h.mux.persistent_session(1), Some(3));
        assert!(h.reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guest_close_finishes_exec_session() {
        let mut h = harness();
        let (endpoint, client) = TtyEndpoint::pair("exec-5");
        h.mux.attach(5, 0, false, endpoint);

        TtyFrame::close(5).write_to(&mut h.guest).await.unwrap();
        client.closed.await.unwrap();

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.kind, ReportKind::ExecFinished { session: 5 });
        assert!(!h.mux.has_session(5));
        assert_eq!(h.mux.resolve("exec-5"), None);
    }

    #[tokio::test]
    async fn test_last_detach_closes_one_shot_session() {
        let mut h = harness();
        let (endpoint, _client) = TtyEndpoint::pair("exec-7");
        let id = h.mux.attach(7, 0, false, endpoint);

        h.mux.detach(7, id);
        let frame = tokio::time::timeout(
            Duration::from_secs(1),
            TtyFrame::read_from(&mut h.guest),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(frame.is_close());
        assert_eq!(frame.session, 7);
        assert!(!h.mux.has_session(7));
        assert!(matches!(
            h.reports.recv().await.unwrap().kind,
            ReportKind::ExecFinished { session: 7 }
        ));
    }

    #[tokio::test]
    async fn test_input_eof_detaches_endpoint() {
        let mut h = harness();
        let (endpoint, client) = TtyEndpoint::pair("exec-8");
        h.mux.attach(8, 0, false, endpoint);

        let TtyClient { input, closed, .. } = client;
        drop(input);
        closed.await.unwrap();

        let frame = TtyFrame::read_from(&mut h.guest).await.unwrap();
        assert_eq!(frame, TtyFrame::close(8));
        assert!(!h.mux.has_session(8));
        assert_eq!(h.mux.resolve("exec-8"), None);
        assert!(matches!(
            h.reports.recv().await.unwrap().kind,
            ReportKind::ExecFinished { session: 8 }
        ));
    }

    #[tokio::test]
    async fn test_dropped_output_detaches_on_next_delivery() {
        let mut h = harness();
        h.mux.create_persistent(9, 0);
        let (gone, gone_client) = TtyEndpoint::pair("gone");
        let (alive, mut alive_client) = TtyEndpoint::pair("alive");
        h.mux.attach(9, 0, true, gone);
        h.mux.attach(9, 0, true, alive);

        let TtyClient { output, closed, input } = gone_client;
        drop(output);

        TtyFrame::new(9, b"out".to_vec())
            .write_to(&mut h.guest)
            .await
            .unwrap();
        assert_eq!(alive_client.output.recv().await.unwrap(), b"out");
        closed.await.unwrap();

        assert_eq!(h.mux.resolve("gone"), None);
        assert_eq!(h.mux.resolve("alive"), Some(9));
        assert!(h.mux.has_session(9));
        drop(input);
    }

    #[tokio::test]
    async fn test_sessions_listing() {
        let h = harness();
        h.mux.create_persistent(4, 1);
        h.mux.attach(2, 0, false, TtyEndpoint::new("exec"));
        assert_eq!(
            h.mux.sessions(),
            vec![
                SessionInfo {
                    session: 2,
                    container: 0,
                    persistent: false
                },
                SessionInfo {
                    session: 4,
                    container: 1,
                    persistent: true
                },
            ]
        );
    }
}
