use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Connect to a unix socket the hypervisor creates asynchronously.
///
/// Retries until the socket accepts a connection or `timeout` elapses.
pub async fn connect_unix(path: &Path, timeout: Duration) -> HyperliteResult<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(HyperliteError::Engine(format!(
                    "failed to connect to {} within {:?}: {}",
                    path.display(),
                    timeout,
                    e
                )));
            }
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "socket not ready, retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}
