//! Protocol constants.

use crate::errors::HyperliteError;

/// Guest init command codes.
///
/// The numbering is fixed by the init process running inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InitCode {
    Reserved = 0,
    StartPod = 1,
    GetPod = 2,
    StopPod = 3,
    DestroyPod = 4,
    RestartContainer = 5,
    ExecCmd = 6,
    FinishCmd = 7,
    Ready = 8,
    Ack = 9,
    Error = 10,
    WinSize = 11,
    Ping = 12,
    FinishPod = 13,
    Next = 14,
}

impl InitCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for InitCode {
    type Error = HyperliteError;

    fn try_from(value: u32) -> Result<Self, HyperliteError> {
        Ok(match value {
            0 => InitCode::Reserved,
            1 => InitCode::StartPod,
            2 => InitCode::GetPod,
            3 => InitCode::StopPod,
            4 => InitCode::DestroyPod,
            5 => InitCode::RestartContainer,
            6 => InitCode::ExecCmd,
            7 => InitCode::FinishCmd,
            8 => InitCode::Ready,
            9 => InitCode::Ack,
            10 => InitCode::Error,
            11 => InitCode::WinSize,
            12 => InitCode::Ping,
            13 => InitCode::FinishPod,
            14 => InitCode::Next,
            other => {
                return Err(HyperliteError::Protocol(format!(
                    "unknown init command code {}",
                    other
                )));
            }
        })
    }
}

/// Frame layout.
pub mod framing {
    /// Guest frame header: u32 code + u32 total length.
    pub const GUEST_HEADER_LEN: usize = 8;

    /// TTY frame header: u64 session + u32 total length.
    pub const TTY_HEADER_LEN: usize = 12;

    /// Largest payload accepted from either stream.
    pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;
}

/// Socket and directory names inside a sandbox working directory.
pub mod sockets {
    pub const INIT: &str = "hyper.sock";
    pub const TTY: &str = "tty.sock";
    pub const MONITOR: &str = "qmp.sock";
    pub const CONSOLE: &str = "console.sock";
    pub const SHARE_DIR: &str = "share_dir";

    /// Virtio serial port names the guest init looks for.
    pub const INIT_PORT: &str = "sh.hyper.channel.0";
    pub const TTY_PORT: &str = "sh.hyper.channel.1";

    /// 9p mount tag of the shared directory.
    pub const SHARE_TAG: &str = "share_dir";
}

/// Interactive session constants.
pub mod tty {
    /// A single input byte of this value detaches the endpoint (ctrl-p).
    pub const DETACH_KEY: u8 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_code_numbering() {
        for value in 0..=14u32 {
            let code = InitCode::try_from(value).unwrap();
            assert_eq!(code.as_u32(), value);
        }
        assert_eq!(InitCode::try_from(10).unwrap(), InitCode::Error);
    }

    #[test]
    fn test_unknown_init_code_is_protocol_error() {
        let err = InitCode::try_from(15).unwrap_err();
        assert!(matches!(err, HyperliteError::Protocol(_)));
    }
}
