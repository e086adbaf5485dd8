//! Framed messaging layers over the rudpstream transport core.
//!
//! - **TCPMessaging**: length-prefixed frames (optionally
//!   channel-tagged) over a TCP byte stream, for when no UDP path can
//!   be established
//! - **RUDPMessaging**: message-boundary restoration over an RUDP
//!   channel's ordered byte stream
//! - **driver**: the tokio pump gluing a TCP session to any
//!   `AsyncRead + AsyncWrite`

pub mod driver;
pub mod error;
pub mod rudp;
pub mod tcp;

// Re-export key public types at crate root.
pub use error::{MessagingError, Result};
pub use rudp::RudpMessaging;
pub use tcp::{FrameMode, SessionEvent, SessionState, TcpMessaging};
