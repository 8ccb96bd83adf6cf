//! Binary framing for the guest command stream and the TTY multiplex stream.
//!
//! ```text
//! guest frame:  | code: u32 BE | total_len: u32 BE | payload (total_len - 8) |
//! tty frame:    | session: u64 BE | total_len: u32 BE | payload (total_len - 12) |
//! ```
//!
//! Both lengths include the header. Reads loop until the declared length is
//! satisfied since the underlying sockets deliver partial reads.

use crate::constants::InitCode;
use crate::constants::framing::{GUEST_HEADER_LEN, MAX_PAYLOAD_LEN, TTY_HEADER_LEN};
use crate::errors::{HyperliteError, HyperliteResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn payload_len(total: u32, header: usize) -> HyperliteResult<usize> {
    let total = total as usize;
    if total < header {
        return Err(HyperliteError::Protocol(format!(
            "frame length {} shorter than header {}",
            total, header
        )));
    }
    let len = total - header;
    if len > MAX_PAYLOAD_LEN {
        return Err(HyperliteError::Protocol(format!(
            "frame payload of {} bytes exceeds limit",
            len
        )));
    }
    Ok(len)
}

/// One frame on the guest init channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFrame {
    pub code: u32,
    pub payload: Vec<u8>,
}

impl GuestFrame {
    pub fn new(code: InitCode, payload: Vec<u8>) -> Self {
        Self {
            code: code.as_u32(),
            payload,
        }
    }

    /// Decoded command code, if known.
    pub fn init_code(&self) -> HyperliteResult<InitCode> {
        InitCode::try_from(self.code)
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = GUEST_HEADER_LEN + self.payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> HyperliteResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; GUEST_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let total = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; payload_len(total, GUEST_HEADER_LEN)?];
        reader.read_exact(&mut payload).await?;
        Ok(Self { code, payload })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> HyperliteResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// One frame on the TTY multiplex stream.
///
/// An empty payload means the peer closed the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyFrame {
    pub session: u64,
    pub payload: Vec<u8>,
}

impl TtyFrame {
    pub fn new(session: u64, payload: Vec<u8>) -> Self {
        Self { session, payload }
    }

    pub fn close(session: u64) -> Self {
        Self {
            session,
            payload: Vec::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = TTY_HEADER_LEN + self.payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.session.to_be_bytes());
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> HyperliteResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; TTY_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let mut session = [0u8; 8];
        session.copy_from_slice(&header[..8]);
        let total = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        let mut payload = vec![0u8; payload_len(total, TTY_HEADER_LEN)?];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            session: u64::from_be_bytes(session),
            payload,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> HyperliteResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Decode the exit-code array carried by a `FinishPod` frame.
///
/// Trailing bytes that do not form a whole u32 are ignored.
pub fn decode_exit_codes(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn encode_exit_codes(codes: &[u32]) -> Vec<u8> {
    codes.iter().flat_map(|c| c.to_be_bytes()).collect()
}
