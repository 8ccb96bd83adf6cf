use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Log the guest serial console line by line until it closes.
pub fn spawn_console_logger<R>(sandbox_id: String, console: R) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(console).lines();
        let mut count = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    count += 1;
                    tracing::debug!(
                        target: "hyperlite::console",
                        sandbox_id = %sandbox_id,
                        "{}",
                        line.trim_end_matches('\r')
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(sandbox_id = %sandbox_id, error = %e, "Console stream failed");
                    break;
                }
            }
        }
        tracing::debug!(sandbox_id = %sandbox_id, lines = count, "Console closed");
        count
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_console_drains_until_eof() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let task = spawn_console_logger("test".into(), ours);
        theirs
            .write_all(b"[    0.000] Linux version\r\nhyperstart started\npartial")
            .await
            .unwrap();
        drop(theirs);
        assert_eq!(task.await.unwrap(), 3);
    }
}
