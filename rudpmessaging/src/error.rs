use thiserror::Error;

/// Errors produced by the framed messaging layers.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    PreconditionFailed { size: usize, max: usize },

    #[error("channel-tagged framing requires a channel header on every buffer")]
    ExpectationFailed,

    #[error("network failure: {0}")]
    NetworkConnectTimeout(String),

    #[error("session is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessagingError {
    /// The numeric code reported on the terminal state notification.
    pub fn code(&self) -> u16 {
        match self {
            MessagingError::PreconditionFailed { .. } => 412,
            MessagingError::ExpectationFailed => 417,
            MessagingError::NetworkConnectTimeout(_) | MessagingError::Io(_) => 599,
            MessagingError::ShuttingDown => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
