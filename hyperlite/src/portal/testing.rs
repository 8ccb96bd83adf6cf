//! Scripted init process for tests.

use hyperlite_shared::{GuestFrame, InitCode};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct FakeInit {
    received: Arc<Mutex<Vec<GuestFrame>>>,
    inject: mpsc::UnboundedSender<GuestFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeInit {
    /// Announce `Ready`, then answer each received frame with the frames
    /// returned by `script`.
    pub(crate) fn spawn(
        stream: UnixStream,
        mut script: impl FnMut(&GuestFrame) -> Vec<GuestFrame> + Send + 'static,
    ) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (mut reader, mut writer) = stream.into_split();
        let (inject, mut injected) = mpsc::unbounded_channel::<GuestFrame>();

        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(async move {
            while let Ok(frame) = GuestFrame::read_from(&mut reader).await {
                if frame_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let log = received.clone();
        let write_task = tokio::spawn(async move {
            if GuestFrame::new(InitCode::Ready, Vec::new())
                .write_to(&mut writer)
                .await
                .is_err()
            {
                return;
            }
            loop {
                let replies = tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            log.lock().push(frame.clone());
                            script(&frame)
                        }
                        None => return,
                    },
                    frame = injected.recv() => match frame {
                        Some(frame) => vec![frame],
                        None => return,
                    },
                };
                for reply in replies {
                    if reply.write_to(&mut writer).await.is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            received,
            inject,
            tasks: vec![read_task, write_task],
        }
    }

    /// Send an unsolicited frame.
    pub(crate) fn inject(&self, frame: GuestFrame) {
        let _ = self.inject.send(frame);
    }

    pub(crate) fn frames(&self) -> Vec<GuestFrame> {
        self.received.lock().clone()
    }

    pub(crate) fn codes(&self) -> Vec<u32> {
        self.received.lock().iter().map(|f| f.code).collect()
    }
}

impl Drop for FakeInit {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
