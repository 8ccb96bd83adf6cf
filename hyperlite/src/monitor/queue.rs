use super::{MonitorCommand, MonitorError, MonitorMessage, RetryPolicy, Session};
use crate::sandbox::events::{EventSender, HardwareEvent, LifecycleEvent, post};
use hyperlite_shared::{HyperliteError, HyperliteResult};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Interest, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// FIFO executor of monitor sessions for one sandbox.
///
/// Owns the monitor connection. Results are reported only as events.
pub struct SessionQueue {
    tx: mpsc::UnboundedSender<Session>,
    task: JoinHandle<()>,
}

impl SessionQueue {
    /// Start serving sessions on `stream`.
    ///
    /// Sessions submitted before the capabilities handshake finishes are
    /// buffered. A failed handshake raises `InitFailed`.
    pub fn spawn(
        sandbox_id: String,
        stream: UnixStream,
        policy: RetryPolicy,
        handshake_timeout: Duration,
        events: EventSender,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            sandbox_id,
            stream,
            rx,
            policy,
            handshake_timeout,
            events,
        ));
        Self { tx, task }
    }

    pub fn submit(&self, session: Session) -> HyperliteResult<()> {
        self.tx
            .send(session)
            .map_err(|_| HyperliteError::Engine("monitor session queue is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for SessionQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Reply {
    Return,
    Error(MonitorError),
}

/// The monitor connection broke; the queue stops.
struct Disconnected;

/// Raises `Interrupted` at most once per connection, whichever half notices first.
#[derive(Clone)]
struct Interrupt {
    raised: Arc<AtomicBool>,
    events: EventSender,
}

impl Interrupt {
    fn new(events: EventSender) -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    async fn raise(&self, reason: String) {
        if self.raised.swap(true, Ordering::SeqCst) {
            return;
        }
        post(&self.events, LifecycleEvent::Interrupted { reason }).await;
    }
}

async fn run(
    sandbox_id: String,
    stream: UnixStream,
    mut sessions: mpsc::UnboundedReceiver<Session>,
    policy: RetryPolicy,
    handshake_timeout: Duration,
    events: EventSender,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    match tokio::time::timeout(handshake_timeout, handshake(&mut lines, &mut writer)).await {
        Ok(Ok(())) => tracing::debug!(sandbox_id = %sandbox_id, "Monitor handshake complete"),
        Ok(Err(e)) => {
            tracing::error!(sandbox_id = %sandbox_id, error = %e, "Monitor handshake failed");
            post(
                &events,
                LifecycleEvent::InitFailed {
                    reason: format!("monitor handshake failed: {}", e),
                },
            )
            .await;
            return;
        }
        Err(_) => {
            tracing::error!(sandbox_id = %sandbox_id, "Monitor handshake timed out");
            post(
                &events,
                LifecycleEvent::InitFailed {
                    reason: "monitor handshake timed out".into(),
                },
            )
            .await;
            return;
        }
    }

    let interrupt = Interrupt::new(events.clone());
    let (reply_tx, replies) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_replies(
        sandbox_id.clone(),
        lines,
        reply_tx,
        interrupt.clone(),
    ));

    let mut executor = Executor {
        sandbox_id,
        writer,
        replies,
        policy,
        events,
        interrupt,
    };
    while let Some(session) = sessions.recv().await {
        if executor.execute(session).await.is_err() {
            break;
        }
    }

    reader.abort();
}

async fn next_line<R>(lines: &mut Lines<R>) -> HyperliteResult<String>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(line),
            None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }
}

async fn handshake<R>(lines: &mut Lines<R>, writer: &mut OwnedWriteHalf) -> HyperliteResult<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match MonitorMessage::parse(&next_line(lines).await?)? {
            MonitorMessage::Greeting(_) => break,
            MonitorMessage::Event(_) => continue,
            other => {
                return Err(HyperliteError::Protocol(format!(
                    "expected monitor greeting, got {:?}",
                    other
                )));
            }
        }
    }

    writer
        .write_all(&MonitorCommand::new("qmp_capabilities").encode()?)
        .await?;
    writer.flush().await?;

    loop {
        match MonitorMessage::parse(&next_line(lines).await?)? {
            MonitorMessage::Return(_) => return Ok(()),
            MonitorMessage::Event(_) => continue,
            MonitorMessage::Error(e) => {
                return Err(HyperliteError::Engine(format!(
                    "qmp_capabilities rejected: {}",
                    e.desc
                )));
            }
            MonitorMessage::Greeting(_) => {
                return Err(HyperliteError::Protocol("duplicate monitor greeting".into()));
            }
        }
    }
}

async fn read_replies(
    sandbox_id: String,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    replies: mpsc::UnboundedSender<Reply>,
    interrupt: Interrupt,
) {
    let reason = loop {
        let line = match next_line(&mut lines).await {
            Ok(line) => line,
            Err(e) => break format!("monitor socket failed: {}", e),
        };

        match MonitorMessage::parse(&line) {
            Ok(MonitorMessage::Return(_)) => {
                let _ = replies.send(Reply::Return);
            }
            Ok(MonitorMessage::Error(e)) => {
                let _ = replies.send(Reply::Error(e));
            }
            Ok(MonitorMessage::Event(event)) => {
                tracing::debug!(
                    sandbox_id = %sandbox_id,
                    event = %event.event,
                    data = ?event.data.as_ref().map(|v| v.to_string()),
                    "Monitor event"
                );
            }
            Ok(MonitorMessage::Greeting(_)) => {
                tracing::warn!(sandbox_id = %sandbox_id, "Unexpected monitor greeting");
            }
            Err(e) => break format!("undecodable monitor message: {}", e),
        }
    };

    tracing::warn!(sandbox_id = %sandbox_id, reason = %reason, "Monitor connection lost");
    interrupt.raise(reason).await;
}

struct Executor {
    sandbox_id: String,
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Reply>,
    policy: RetryPolicy,
    events: EventSender,
    interrupt: Interrupt,
}

impl Executor {
    async fn execute(&mut self, session: Session) -> Result<(), Disconnected> {
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            session = %session.label,
            commands = session.commands.len(),
            "Executing monitor session"
        );

        for command in &session.commands {
            let mut counter = self.policy.counter();
            loop {
                if let Err(e) = self.send(command).await {
                    self.interrupt
                        .raise(format!("monitor write failed: {}", e))
                        .await;
                    return Err(Disconnected);
                }

                let Some(reply) = self.replies.recv().await else {
                    return Err(Disconnected);
                };

                let err = match reply {
                    Reply::Return => break,
                    Reply::Error(err) => err,
                };

                match counter.record_failure() {
                    Some(backoff) => {
                        tracing::warn!(
                            sandbox_id = %self.sandbox_id,
                            session = %session.label,
                            command = %command.execute,
                            attempt = counter.failures(),
                            error = %err.desc,
                            "Monitor command failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    None => {
                        tracing::error!(
                            sandbox_id = %self.sandbox_id,
                            session = %session.label,
                            command = %command.execute,
                            attempts = counter.failures(),
                            error = %err.desc,
                            "Monitor command failed, aborting session"
                        );
                        let device = session
                            .completion
                            .as_ref()
                            .map(HardwareEvent::device_label)
                            .unwrap_or_else(|| session.label.clone());
                        post(
                            &self.events,
                            HardwareEvent::DeviceFailed {
                                device,
                                completion: session.completion.map(Box::new),
                                reason: format!(
                                    "{} failed after {} attempts: {} ({})",
                                    command.execute,
                                    counter.failures(),
                                    err.desc,
                                    err.class
                                ),
                            },
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }

        if let Some(completion) = session.completion {
            post(&self.events, completion).await;
        }
        Ok(())
    }

    async fn send(&mut self, command: &MonitorCommand) -> io::Result<()> {
        let bytes = command.encode().map_err(io::Error::other)?;
        match &command.fd {
            Some(fd) => send_with_fd(&mut self.writer, &bytes, fd.0.as_raw_fd()).await?,
            None => self.writer.write_all(&bytes).await?,
        }
        self.writer.flush().await
    }
}

/// Write `bytes` with `fd` attached as `SCM_RIGHTS`.
async fn send_with_fd(writer: &mut OwnedWriteHalf, bytes: &[u8], fd: RawFd) -> io::Result<()> {
    let sent = {
        let stream: &UnixStream = writer.as_ref();
        loop {
            stream.writable().await?;
            let result = stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(bytes)];
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            });
            match result {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    };

    if sent < bytes.len() {
        writer.write_all(&bytes[sent..]).await?;
    }
    Ok(())
}
