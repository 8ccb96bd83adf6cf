use crate::sandbox::events::{EventSender, GuestEvent, LifecycleEvent, post};
use hyperlite_shared::codec::decode_exit_codes;
use hyperlite_shared::{GuestFrame, HyperliteError, HyperliteResult, InitCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep_until};

/// A command for the guest init process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    pub code: InitCode,
    pub payload: Vec<u8>,
    /// Attach id of the TTY session the command belongs to, if any.
    pub seq: Option<u64>,
}

impl GuestCommand {
    pub fn new(code: InitCode, payload: Vec<u8>) -> Self {
        Self {
            code,
            payload,
            seq: None,
        }
    }

    pub fn json<T: Serialize>(code: InitCode, body: &T) -> HyperliteResult<Self> {
        Ok(Self::new(code, serde_json::to_vec(body)?))
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    fn frame(&self) -> GuestFrame {
        GuestFrame::new(self.code, self.payload.clone())
    }
}

/// What to do with a `FinishPod` notification while `DestroyPod` is queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishPolicy {
    /// Only the destroy acknowledgement is raised.
    #[default]
    SuppressWhenDestroying,
    /// Raise the destroy acknowledgement and the pod-finished event.
    Forward,
}

#[derive(Debug, Clone, Copy)]
pub struct InitChannelConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub finish_policy: FinishPolicy,
}

/// Wait for the `Ready` frame the init process sends once it is up.
pub async fn await_ready(stream: &mut UnixStream, timeout: Duration) -> HyperliteResult<()> {
    let frame = tokio::time::timeout(timeout, GuestFrame::read_from(stream))
        .await
        .map_err(|_| HyperliteError::Guest(format!("init not ready within {:?}", timeout)))??;

    match frame.init_code() {
        Ok(InitCode::Ready) => Ok(()),
        _ => Err(HyperliteError::Guest(format!(
            "unexpected first init message {}",
            frame.code
        ))),
    }
}

/// Command connection to the guest init process.
///
/// Commands are written in send order and acknowledged FIFO. Outcomes are
/// posted to the control loop as [`GuestEvent`]s.
pub struct InitChannel {
    tx: mpsc::UnboundedSender<GuestCommand>,
    dispatch: JoinHandle<()>,
    reader: AbortHandle,
}

impl InitChannel {
    pub fn spawn(
        sandbox_id: String,
        stream: UnixStream,
        config: InitChannelConfig,
        events: EventSender,
    ) -> Self {
        let (read_half, writer) = stream.into_split();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(
            sandbox_id.clone(),
            read_half,
            frame_tx,
            events.clone(),
        ))
        .abort_handle();

        let (tx, commands) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            sandbox_id,
            writer,
            pending: VecDeque::new(),
            ping_at: None,
            pong_at: None,
            config,
            events,
        };
        let dispatch = tokio::spawn(dispatcher.run(commands, frames, reader.clone()));

        Self {
            tx,
            dispatch,
            reader,
        }
    }

    pub fn send(&self, command: GuestCommand) -> HyperliteResult<()> {
        self.tx
            .send(command)
            .map_err(|_| HyperliteError::Guest("init channel is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for InitChannel {
    fn drop(&mut self) {
        self.dispatch.abort();
        self.reader.abort();
    }
}

async fn read_frames(
    sandbox_id: String,
    mut reader: OwnedReadHalf,
    frames: mpsc::UnboundedSender<GuestFrame>,
    events: EventSender,
) {
    loop {
        let frame = match GuestFrame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Init socket failed");
                post(
                    &events,
                    LifecycleEvent::Interrupted {
                        reason: format!("init socket failed: {}", e),
                    },
                )
                .await;
                return;
            }
        };

        match frame.init_code() {
            Ok(InitCode::Ack | InitCode::Error | InitCode::FinishPod) => {
                if frames.send(frame).is_err() {
                    return;
                }
            }
            Ok(code) => {
                tracing::trace!(sandbox_id = %sandbox_id, code = ?code, "Ignoring init message");
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %sandbox_id, code = frame.code, "Unknown init message");
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Dispatcher {
    sandbox_id: String,
    writer: OwnedWriteHalf,
    /// Sent and not yet acknowledged, oldest first.
    pending: VecDeque<GuestCommand>,
    ping_at: Option<Instant>,
    pong_at: Option<Instant>,
    config: InitChannelConfig,
    events: EventSender,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<GuestCommand>,
        mut frames: mpsc::UnboundedReceiver<GuestFrame>,
        reader: AbortHandle,
    ) {
        loop {
            let ping_at = self.ping_at;
            let pong_at = self.pong_at;

            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.send(command).await,
                    None => Flow::Stop,
                },
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => Flow::Stop,
                },
                _ = sleep_until(ping_at.unwrap_or_else(Instant::now)), if ping_at.is_some() => {
                    self.ping_at = None;
                    tracing::trace!(sandbox_id = %self.sandbox_id, "Sending ping to init");
                    self.send(GuestCommand::new(InitCode::Ping, Vec::new())).await
                }
                _ = sleep_until(pong_at.unwrap_or_else(Instant::now)), if pong_at.is_some() => {
                    tracing::error!(
                        sandbox_id = %self.sandbox_id,
                        pending = self.pending.len(),
                        "Init did not acknowledge in time"
                    );
                    post(
                        &self.events,
                        LifecycleEvent::Interrupted {
                            reason: "init did not reply in time".into(),
                        },
                    )
                    .await;
                    Flow::Stop
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        reader.abort();
        tracing::debug!(sandbox_id = %self.sandbox_id, "Init dispatch finished");
    }

    async fn send(&mut self, command: GuestCommand) -> Flow {
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            code = ?command.code,
            len = command.payload.len(),
            "Sending command to init"
        );

        if let Err(e) = command.frame().write_to(&mut self.writer).await {
            post(
                &self.events,
                LifecycleEvent::Interrupted {
                    reason: format!("init write failed: {}", e),
                },
            )
            .await;
            return Flow::Stop;
        }

        self.pending.push_back(command);
        // Pings only go out on an idle channel.
        self.ping_at = None;
        if self.pong_at.is_none() {
            self.pong_at = Some(Instant::now() + self.config.pong_timeout);
        }
        Flow::Continue
    }

    async fn on_frame(&mut self, frame: GuestFrame) -> Flow {
        match frame.init_code() {
            Ok(InitCode::FinishPod) => self.on_finish(frame.payload).await,
            Ok(code @ (InitCode::Ack | InitCode::Error)) => {
                self.on_reply(code == InitCode::Ack, frame.payload).await
            }
            _ => Flow::Continue,
        }
    }

    async fn on_reply(&mut self, ok: bool, reply: Vec<u8>) -> Flow {
        let Some(command) = self.pending.pop_front() else {
            tracing::error!(sandbox_id = %self.sandbox_id, "Init reply with no command pending");
            return Flow::Continue;
        };

        if self.pending.is_empty() {
            self.pong_at = None;
            self.ping_at = Some(Instant::now() + self.config.ping_interval);
        } else {
            self.pong_at = Some(Instant::now() + self.config.pong_timeout);
        }

        let last = command.code == InitCode::DestroyPod;
        if last {
            tracing::info!(sandbox_id = %self.sandbox_id, "Destroy acknowledged, closing init channel");
        }

        if !ok {
            tracing::warn!(
                sandbox_id = %self.sandbox_id,
                code = ?command.code,
                reply = %String::from_utf8_lossy(&reply),
                "Init rejected command"
            );
            post(&self.events, GuestEvent::Failed { command, reply }).await;
        } else if command.code != InitCode::Ping {
            post(&self.events, GuestEvent::Ack { command, reply }).await;
        }

        if last { Flow::Stop } else { Flow::Continue }
    }

    async fn on_finish(&mut self, payload: Vec<u8>) -> Flow {
        let exit_codes = decode_exit_codes(&payload);
        tracing::info!(sandbox_id = %self.sandbox_id, exit_codes = ?exit_codes, "Pod finished");

        let destroying = self
            .pending
            .iter()
            .position(|c| c.code == InitCode::DestroyPod);

        let Some(index) = destroying else {
            post(&self.events, GuestEvent::PodFinished { exit_codes }).await;
            return Flow::Continue;
        };

        if let Some(command) = self.pending.remove(index) {
            post(
                &self.events,
                GuestEvent::Ack {
                    command,
                    reply: Vec::new(),
                },
            )
            .await;
        }
        match self.config.finish_policy {
            FinishPolicy::Forward => {
                post(&self.events, GuestEvent::PodFinished { exit_codes }).await;
            }
            FinishPolicy::SuppressWhenDestroying => {
                tracing::debug!(sandbox_id = %self.sandbox_id, "Pod finish superseded by destroy");
            }
        }
        Flow::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::FakeInit;
    use crate::sandbox::events::VmEvent;
    use hyperlite_shared::codec::encode_exit_codes;

    fn config(policy: FinishPolicy) -> InitChannelConfig {
        InitChannelConfig {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_secs(5),
            finish_policy: policy,
        }
    }

    fn ack() -> GuestFrame {
        GuestFrame::new(InitCode::Ack, Vec::new())
    }

    fn start(
        policy: FinishPolicy,
        script: impl FnMut(&GuestFrame) -> Vec<GuestFrame> + Send + 'static,
    ) -> (InitChannel, FakeInit, mpsc::Receiver<VmEvent>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let init = FakeInit::spawn(theirs, script);
        let (events_tx, events) = mpsc::channel(16);
        let channel = InitChannel::spawn("test".into(), ours, config(policy), events_tx);
        (channel, init, events)
    }

    async fn assert_quiet(events: &mut mpsc::Receiver<VmEvent>) {
        match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Some(event)) => panic!("unexpected event {:?}", event),
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_acks_match_send_order() {
        let (channel, _init, mut events) = start(FinishPolicy::default(), |_| vec![ack()]);
        channel
            .send(GuestCommand::new(InitCode::StartPod, b"a".to_vec()))
            .unwrap();
        channel
            .send(GuestCommand::new(InitCode::ExecCmd, b"b".to_vec()).with_seq(3))
            .unwrap();

        match events.recv().await.unwrap() {
            VmEvent::Guest(GuestEvent::Ack { command, .. }) => {
                assert_eq!(command.code, InitCode::StartPod)
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            VmEvent::Guest(GuestEvent::Ack { command, .. }) => {
                assert_eq!(command.code, InitCode::ExecCmd);
                assert_eq!(command.seq, Some(3));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_reply_raises_failed() {
        let (channel, _init, mut events) = start(FinishPolicy::default(), |_| {
            vec![GuestFrame::new(InitCode::Error, b"no such container".to_vec())]
        });
        channel
            .send(GuestCommand::new(InitCode::ExecCmd, Vec::new()))
            .unwrap();

        match events.recv().await.unwrap() {
            VmEvent::Guest(GuestEvent::Failed { command, reply }) => {
                assert_eq!(command.code, InitCode::ExecCmd);
                assert_eq!(reply, b"no such container");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_channel_pings_silently() {
        let (channel, init, mut events) = start(FinishPolicy::default(), |_| vec![ack()]);
        channel
            .send(GuestCommand::new(InitCode::Ready, Vec::new()))
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Guest(GuestEvent::Ack { .. })
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let codes = init.codes();
        assert_eq!(codes[0], InitCode::Ready.as_u32());
        assert!(codes[1..].iter().all(|c| *c == InitCode::Ping.as_u32()));
        assert!(codes.len() >= 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_ping_while_command_pending() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let init = FakeInit::spawn(theirs, |frame| {
            if frame.code == InitCode::ExecCmd.as_u32() {
                Vec::new()
            } else {
                vec![ack()]
            }
        });
        let (events_tx, mut events) = mpsc::channel(16);
        let channel = InitChannel::spawn(
            "test".into(),
            ours,
            InitChannelConfig {
                ping_interval: Duration::from_millis(100),
                pong_timeout: Duration::from_secs(5),
                finish_policy: FinishPolicy::default(),
            },
            events_tx,
        );
        channel
            .send(GuestCommand::new(InitCode::Ready, Vec::new()))
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Guest(GuestEvent::Ack { .. })
        ));

        // Queued right after the ack armed the idle ping.
        channel
            .send(GuestCommand::new(InitCode::ExecCmd, Vec::new()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            init.codes(),
            vec![InitCode::Ready.as_u32(), InitCode::ExecCmd.as_u32()]
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unanswered_command_interrupts() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let _init = FakeInit::spawn(theirs, |_| Vec::new());
        let (events_tx, mut events) = mpsc::channel(16);
        let channel = InitChannel::spawn(
            "test".into(),
            ours,
            InitChannelConfig {
                ping_interval: Duration::from_secs(30),
                pong_timeout: Duration::from_millis(50),
                finish_policy: FinishPolicy::default(),
            },
            events_tx,
        );
        channel
            .send(GuestCommand::new(InitCode::StartPod, Vec::new()))
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Lifecycle(LifecycleEvent::Interrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_pod_finished_out_of_band() {
        let (_channel, init, mut events) = start(FinishPolicy::default(), |_| vec![ack()]);
        init.inject(GuestFrame::new(
            InitCode::FinishPod,
            encode_exit_codes(&[0, 137]),
        ));

        match events.recv().await.unwrap() {
            VmEvent::Guest(GuestEvent::PodFinished { exit_codes }) => {
                assert_eq!(exit_codes, vec![0, 137])
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finish_suppressed_while_destroying() {
        let (channel, _init, mut events) = start(FinishPolicy::SuppressWhenDestroying, |frame| {
            if frame.code == InitCode::DestroyPod.as_u32() {
                vec![GuestFrame::new(InitCode::FinishPod, encode_exit_codes(&[0]))]
            } else {
                vec![ack()]
            }
        });
        channel
            .send(GuestCommand::new(InitCode::DestroyPod, Vec::new()))
            .unwrap();

        match events.recv().await.unwrap() {
            VmEvent::Guest(GuestEvent::Ack { command, .. }) => {
                assert_eq!(command.code, InitCode::DestroyPod)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_quiet(&mut events).await;
        // Dispatch stopped after the destroy.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_finish_forwarded_while_destroying() {
        let (channel, _init, mut events) = start(FinishPolicy::Forward, |frame| {
            if frame.code == InitCode::DestroyPod.as_u32() {
                vec![GuestFrame::new(InitCode::FinishPod, encode_exit_codes(&[1]))]
            } else {
                vec![ack()]
            }
        });
        channel
            .send(GuestCommand::new(InitCode::DestroyPod, Vec::new()))
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Guest(GuestEvent::Ack { .. })
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            VmEvent::Guest(GuestEvent::PodFinished { ref exit_codes }) if exit_codes == &[1]
        ));
    }

    #[tokio::test]
    async fn test_await_ready() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();
        GuestFrame::new(InitCode::Ready, Vec::new())
            .write_to(&mut theirs)
            .await
            .unwrap();
        await_ready(&mut ours, Duration::from_secs(1)).await.unwrap();

        GuestFrame::new(InitCode::Ack, Vec::new())
            .write_to(&mut theirs)
            .await
            .unwrap();
        assert!(matches!(
            await_ready(&mut ours, Duration::from_secs(1)).await,
            Err(HyperliteError::Guest(_))
        ));
        assert!(await_ready(&mut ours, Duration::from_millis(50)).await.is_err());
    }
}
