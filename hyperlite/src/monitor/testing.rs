//! Scripted monitor peer for tests.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::task::JoinHandle;

pub(crate) enum FakeReply {
    Ok,
    Error(&'static str),
    /// Close the connection without answering.
    Hangup,
}

pub(crate) struct FakeMonitor {
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeMonitor {
    /// Greet, accept capabilities, then answer each request via `script`.
    pub(crate) fn spawn(
        stream: UnixStream,
        mut script: impl FnMut(&Value) -> FakeReply + Send + 'static,
    ) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let task = tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            let greeting = json!({"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": []}});
            if writer
                .write_all(format!("{}\r\n", greeting).as_bytes())
                .await
                .is_err()
            {
                return;
            }

            let mut buf = Vec::new();
            while let Some(request) = next_object(&mut reader, &mut buf).await {
                log.lock().push(request.clone());
                let reply = if request["execute"] == "qmp_capabilities" {
                    FakeReply::Ok
                } else {
                    script(&request)
                };
                let line = match reply {
                    FakeReply::Ok => json!({"return": {}}),
                    FakeReply::Error(desc) => {
                        json!({"error": {"class": "GenericError", "desc": desc}})
                    }
                    FakeReply::Hangup => return,
                };
                // Interleave an asynchronous event to exercise filtering.
                let event = json!({"event": "NIC_RX_FILTER_CHANGED", "data": {}});
                let out = format!("{}\r\n{}\r\n", event, line);
                if writer.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        Self { received, task }
    }

    pub(crate) fn executes(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|v| v["execute"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }
}

impl Drop for FakeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Requests carry no delimiter, so parse objects off a byte stream.
async fn next_object(reader: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Option<Value> {
    loop {
        let parsed = {
            let mut objects = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
            match objects.next() {
                Some(Ok(value)) => Some(Some((value, objects.byte_offset()))),
                Some(Err(e)) if !e.is_eof() => Some(None),
                _ => None,
            }
        };
        match parsed {
            Some(Some((value, used))) => {
                buf.drain(..used);
                return Some(value);
            }
            Some(None) => return None,
            None => {}
        }

        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
