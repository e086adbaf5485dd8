//! Reliable-UDP transport core.
//!
//! A sliding-window reliable byte stream (selective ACK, windowed
//! congestion control, RTT estimation) running over STUN-signalled
//! unreliable datagram paths, plus the back-pressured TransportStream
//! pipe that feeds every messaging layer:
//! - **TransportStream**: in-process FIFO byte pipe with per-buffer
//!   headers and latched readiness notifications
//! - **ChannelStream**: the reliable pipe itself (send/recv windows,
//!   SACK vectors, fast retransmit, RTO backoff)
//! - **Channel**: the STUN-authenticated control plane per stream
//! - **Transport** / **Listener**: per-path and per-socket demux,
//!   channel-open accept flows
//! - **driver**: the tokio pump gluing a transport to a UDP socket

pub mod channel;
pub mod channel_stream;
pub mod config;
pub mod congestion;
pub mod driver;
pub mod error;
pub mod listener;
pub mod packet;
pub mod requester;
pub mod rtt;
pub mod stream;
pub mod stun;
pub mod transport;

// Re-export key public types at crate root.
pub use channel::{Channel, ChannelOutput, ChannelParams, ChannelState};
pub use channel_stream::{
    ChannelStream, ChannelStreamParams, ChannelStreamState, ShutdownDirection, StreamOutput,
};
pub use config::{MessagingConfig, RudpConfig};
pub use congestion::{CongestionController, TcpLikeWindow};
pub use error::{ErrorCode, Result, RudpError};
pub use listener::{Listener, ListenerOutput, ListenerParams, ListenerState};
pub use packet::{RudpFlags, RudpPacket};
pub use requester::StunRequesterEngine;
pub use rtt::RttEstimator;
pub use stream::{
    ChannelHeader, Header, StreamHeader, StreamReader, StreamReaderEvents, StreamWriter,
    StreamWriterEvents, TransportStream,
};
pub use stun::{CongestionAlgorithm, CryptoProvider, StunClass, StunCodec, StunMethod, StunPacket};
pub use transport::{SubstrateState, Transport, TransportOutput, TransportParams, TransportState};
