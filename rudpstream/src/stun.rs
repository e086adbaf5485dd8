//! Parsed STUN values and the capability seams around them.
//!
//! The STUN wire codec is an external collaborator: the core consumes
//! already-parsed [`StunPacket`] values and emits values for the codec
//! to serialise. Request retransmission/backoff belongs to a requester
//! (see [`crate::requester`]); integrity needs a [`CryptoProvider`].

use bytes::{BufMut, Bytes, BytesMut};

/// STUN message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// The RUDP control methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMethod {
    ReliableChannelOpen,
    ReliableChannelAck,
    ReliableChannelClose,
}

/// STUN error codes the control plane produces or reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StunErrorCode {
    BadRequest = 400,
    Unauthorized = 401,
    StaleNonce = 438,
    InsufficientCapacity = 508,
}

impl StunErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Congestion-control algorithms a channel open may offer.
///
/// Exactly one scheme is defined; open requests must list at least one
/// algorithm for each direction and the responder picks the first it
/// knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CongestionAlgorithm {
    TcpLikeWindow = 1,
}

/// A parsed STUN message restricted to the attributes the RUDP control
/// plane uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunPacket {
    pub class: StunClass,
    pub method: StunMethod,
    pub transaction_id: [u8; 12],

    pub username: Option<String>,
    pub message_integrity: Option<Bytes>,
    pub channel_number: Option<u16>,
    pub next_sequence_number: Option<u64>,
    pub minimum_rtt_ms: Option<u32>,
    pub lifetime_seconds: Option<u32>,
    pub local_congestion_control: Vec<CongestionAlgorithm>,
    pub remote_congestion_control: Vec<CongestionAlgorithm>,
    pub connection_info: Option<String>,
    pub gsnr: Option<u64>,
    pub gsnfr: Option<u64>,
    pub ack_vector: Option<Bytes>,
    pub error_code: Option<u16>,
    pub error_reason: Option<String>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
}

impl StunPacket {
    pub fn new(class: StunClass, method: StunMethod, transaction_id: [u8; 12]) -> Self {
        Self {
            class,
            method,
            transaction_id,
            username: None,
            message_integrity: None,
            channel_number: None,
            next_sequence_number: None,
            minimum_rtt_ms: None,
            lifetime_seconds: None,
            local_congestion_control: Vec::new(),
            remote_congestion_control: Vec::new(),
            connection_info: None,
            gsnr: None,
            gsnfr: None,
            ack_vector: None,
            error_code: None,
            error_reason: None,
            realm: None,
            nonce: None,
        }
    }

    /// A success response answering `request`, with the transaction id
    /// carried over.
    pub fn success_response(request: &StunPacket) -> Self {
        Self::new(
            StunClass::SuccessResponse,
            request.method,
            request.transaction_id,
        )
    }

    /// An error response answering `request`.
    pub fn error_response(request: &StunPacket, code: StunErrorCode, reason: &str) -> Self {
        let mut response = Self::new(
            StunClass::ErrorResponse,
            request.method,
            request.transaction_id,
        );
        response.error_code = Some(code.as_u16());
        response.error_reason = Some(reason.to_string());
        response
    }

    pub fn is_error(&self) -> bool {
        self.class == StunClass::ErrorResponse
    }

    /// The deterministic byte form the message-integrity HMAC covers.
    ///
    /// The real frame serialisation belongs to the external codec; the
    /// canonical form here covers every attribute that matters to the
    /// handshake so both ends agree on the digest input.
    pub fn integrity_input(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(match self.class {
            StunClass::Request => 0,
            StunClass::Indication => 1,
            StunClass::SuccessResponse => 2,
            StunClass::ErrorResponse => 3,
        });
        buf.put_u8(match self.method {
            StunMethod::ReliableChannelOpen => 1,
            StunMethod::ReliableChannelAck => 2,
            StunMethod::ReliableChannelClose => 3,
        });
        buf.put_slice(&self.transaction_id);
        if let Some(username) = &self.username {
            buf.put_slice(username.as_bytes());
        }
        if let Some(channel) = self.channel_number {
            buf.put_u16(channel);
        }
        if let Some(seq) = self.next_sequence_number {
            buf.put_u64(seq);
        }
        if let Some(gsnr) = self.gsnr {
            buf.put_u64(gsnr);
        }
        if let Some(gsnfr) = self.gsnfr {
            buf.put_u64(gsnfr);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            buf.put_u32(lifetime);
        }
        if let Some(nonce) = &self.nonce {
            buf.put_slice(nonce.as_bytes());
        }
        buf.freeze()
    }

    /// Stamp message integrity using `password`.
    pub fn apply_integrity(&mut self, crypto: &dyn CryptoProvider, password: &str) {
        let digest = crypto.hmac(password.as_bytes(), &self.integrity_input());
        self.message_integrity = Some(Bytes::from(digest));
    }

    /// Validate message integrity against `password`. A packet without
    /// an integrity attribute never validates.
    pub fn valid_integrity(&self, crypto: &dyn CryptoProvider, password: &str) -> bool {
        match &self.message_integrity {
            Some(present) => {
                let expected = crypto.hmac(password.as_bytes(), &self.integrity_input());
                present.as_ref() == expected.as_slice()
            }
            None => false,
        }
    }
}

/// External crypto collaborator: HMAC for STUN message integrity and a
/// random source for transaction ids.
pub trait CryptoProvider: Send + Sync {
    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;
    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

/// External wire codec collaborator: serialises the STUN values the
/// core emits and parses inbound datagrams that are not RUDP.
pub trait StunCodec: Send + Sync {
    fn encode(&self, packet: &StunPacket) -> Bytes;
    fn decode(&self, data: &[u8]) -> Option<StunPacket>;
}

/// Token correlating a STUN request with its eventual response or
/// timeout.
pub type RequesterId = u64;
