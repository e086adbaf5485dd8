use thiserror::Error;

/// Numeric codes carried on terminal state notifications.
///
/// Protocol rejections reuse STUN error codes (400/401/438/508); session
/// failures reuse the HTTP codes the wire peers expect (408/412/417/599).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 400,
    Unauthorized = 401,
    RequestTimeout = 408,
    PreconditionFailed = 412,
    ExpectationFailed = 417,
    StaleNonce = 438,
    InsufficientCapacity = 508,
    NetworkConnectTimeout = 599,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// All errors produced by the RUDP transport core.
#[derive(Debug, Error)]
pub enum RudpError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("not an RUDP packet: leading channel number 0x{0:04x} outside [0x4000, 0x8000)")]
    NotRudp(u16),

    #[error("selective-ack vector length {0} exceeds 127 bytes")]
    VectorTooLong(usize),

    #[error("selective-ack vector contains a zero-length run")]
    VectorZeroRun,

    #[error("channel open failed: {0}")]
    OpenFailure(String),

    #[error("no packet received within the channel lifetime")]
    Timeout,

    #[error("peer violated stream invariants: {0}")]
    IllegalStreamState(String),

    #[error("component is shutting down")]
    ShuttingDown,

    #[error("no free channel number found within {0} attempts")]
    InsufficientCapacity(u32),

    #[error("request rejected: unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("channel {0} not found")]
    ChannelNotFound(u16),

    #[error("channel {0} already exists")]
    ChannelAlreadyExists(u16),

    #[error("stream is shut down")]
    StreamShutdown,

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RudpError {
    /// The numeric code reported on the terminal state notification.
    pub fn code(&self) -> ErrorCode {
        match self {
            RudpError::OpenFailure(_) => ErrorCode::BadRequest,
            RudpError::Timeout => ErrorCode::RequestTimeout,
            RudpError::IllegalStreamState(_) => ErrorCode::PreconditionFailed,
            RudpError::InsufficientCapacity(_) => ErrorCode::InsufficientCapacity,
            RudpError::Unauthorized => ErrorCode::Unauthorized,
            RudpError::Io(_) => ErrorCode::NetworkConnectTimeout,
            _ => ErrorCode::BadRequest,
        }
    }
}

pub type Result<T> = std::result::Result<T, RudpError>;
