//! Error type shared by every hyperlite crate.

use thiserror::Error;

pub type HyperliteResult<T> = Result<T, HyperliteError>;

#[derive(Debug, Error)]
pub enum HyperliteError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Hypervisor process or monitor failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// Guest init channel failure.
    #[error("guest error: {0}")]
    Guest(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    /// Malformed frame or message on one of the wire protocols.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HyperliteError {
    /// True when the error came from a closed or broken connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, HyperliteError::Io(_))
    }
}
