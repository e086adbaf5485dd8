//! Per-channel control plane.
//!
//! A channel runs the STUN-authenticated handshakes (open, keep-alive
//! ACK, close) for one reliable stream and owns that stream's life
//! cycle. It never touches the wire itself: encoded RUDP packets and
//! STUN values leave as outputs for the transport to route.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::channel_stream::{
    ChannelStream, ChannelStreamParams, ChannelStreamState, ShutdownDirection, StreamOutput,
};
use crate::config::RudpConfig;
use crate::error::ErrorCode;
use crate::packet::{decode_vector_bytes, RudpPacket};
use crate::stream::{StreamReader, StreamWriter};
use crate::stun::{
    CongestionAlgorithm, CryptoProvider, RequesterId, StunClass, StunErrorCode, StunMethod,
    StunPacket,
};

/// Raw packets buffered on an accepted channel until the application
/// claims it and attaches streams.
const MAX_BUFFERED_PACKETS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    ShuttingDown,
    Shutdown,
}

/// Everything a channel pushes up to its transport.
#[derive(Debug, Clone)]
pub enum ChannelOutput {
    /// Encoded RUDP bytes for the remote address.
    SendPacket(Bytes),
    /// Submit a request through a STUN requester (owns retransmission).
    IssueStunRequest {
        id: RequesterId,
        packet: StunPacket,
    },
    CancelStunRequest(RequesterId),
    /// Fire-and-forget STUN indication.
    SendStunIndication(StunPacket),
    StateChanged {
        state: ChannelState,
        error: Option<(u16, String)>,
    },
}

/// Identity and wiring shared by both open directions.
pub struct ChannelParams {
    pub remote_addr: SocketAddr,
    pub local_channel: u16,
    pub local_frag: String,
    pub local_password: String,
    pub remote_frag: String,
    pub remote_password: String,
    pub local_sequence_start: u64,
    pub config: RudpConfig,
    pub crypto: Arc<dyn CryptoProvider>,
    pub requester_ids: Arc<AtomicU64>,
}

pub struct Channel {
    state: ChannelState,
    error: Option<(u16, String)>,
    incoming: bool,

    remote_addr: SocketAddr,
    local_frag: String,
    local_password: String,
    remote_frag: String,
    remote_password: String,
    realm: Option<String>,
    nonce: Option<String>,

    local_channel: u16,
    remote_channel: u16,
    local_seq_start: u64,
    remote_seq_start: u64,

    min_rtt: Duration,
    lifetime: Duration,
    segment_size: usize,
    local_info: Option<String>,
    remote_info: Option<String>,

    stream: Option<ChannelStream>,
    pending_streams: Option<(StreamWriter, StreamReader)>,
    buffered_rudp: VecDeque<RudpPacket>,

    open_request: Option<RequesterId>,
    close_request: Option<RequesterId>,
    open_response: Option<StunPacket>,
    credentials_refreshed: bool,
    stun_timed_out: bool,
    connect_issued: bool,
    outstanding_acks: HashMap<RequesterId, u64>,

    last_sent_data: Option<Instant>,
    keepalive_deadline: Instant,

    crypto: Arc<dyn CryptoProvider>,
    requester_ids: Arc<AtomicU64>,
    outputs: VecDeque<ChannelOutput>,
}

impl Channel {
    fn base(params: ChannelParams, incoming: bool, now: Instant) -> Self {
        let keepalive = keepalive_interval(params.config.lifetime, params.config.min_rtt);
        Self {
            state: ChannelState::Connecting,
            error: None,
            incoming,
            remote_addr: params.remote_addr,
            local_frag: params.local_frag,
            local_password: params.local_password,
            remote_frag: params.remote_frag,
            remote_password: params.remote_password,
            realm: None,
            nonce: None,
            local_channel: params.local_channel,
            remote_channel: 0,
            local_seq_start: params.local_sequence_start,
            remote_seq_start: 0,
            min_rtt: params.config.min_rtt,
            lifetime: params.config.lifetime,
            segment_size: params.config.segment_size,
            local_info: None,
            remote_info: None,
            stream: None,
            pending_streams: None,
            buffered_rudp: VecDeque::new(),
            open_request: None,
            close_request: None,
            open_response: None,
            credentials_refreshed: false,
            stun_timed_out: false,
            connect_issued: false,
            outstanding_acks: HashMap::new(),
            last_sent_data: None,
            keepalive_deadline: now + keepalive,
            crypto: params.crypto,
            requester_ids: params.requester_ids,
            outputs: VecDeque::new(),
        }
    }

    /// Locally-initiated channel. The open request goes out when the
    /// transport reaches Ready and calls `issue_connect_if_not_issued`.
    pub fn outgoing(
        params: ChannelParams,
        connection_info: Option<String>,
        receive_writer: StreamWriter,
        send_reader: StreamReader,
        now: Instant,
    ) -> Self {
        let mut channel = Self::base(params, false, now);
        channel.local_info = connection_info;
        channel.pending_streams = Some((receive_writer, send_reader));
        channel
    }

    /// Remotely-initiated channel, built from a validated-by-transport
    /// `ReliableChannelOpen` request. Returns the channel and the
    /// response to send; on rejection, only an error response.
    pub fn incoming(
        params: ChannelParams,
        open: &StunPacket,
        now: Instant,
    ) -> std::result::Result<(Self, StunPacket), StunPacket> {
        let username = open.username.clone().unwrap_or_default();
        let Some((prefix, suffix)) = username.split_once(':') else {
            return Err(StunPacket::error_response(
                open,
                StunErrorCode::Unauthorized,
                "malformed username",
            ));
        };
        if prefix != params.local_frag {
            return Err(StunPacket::error_response(
                open,
                StunErrorCode::Unauthorized,
                "username fragment mismatch",
            ));
        }
        if !open.valid_integrity(params.crypto.as_ref(), &params.local_password) {
            return Err(StunPacket::error_response(
                open,
                StunErrorCode::Unauthorized,
                "message integrity failed",
            ));
        }
        let (Some(remote_channel), Some(remote_seq_start)) =
            (open.channel_number, open.next_sequence_number)
        else {
            return Err(StunPacket::error_response(
                open,
                StunErrorCode::BadRequest,
                "missing channel attributes",
            ));
        };
        if !open
            .local_congestion_control
            .contains(&CongestionAlgorithm::TcpLikeWindow)
            || !open
                .remote_congestion_control
                .contains(&CongestionAlgorithm::TcpLikeWindow)
        {
            return Err(StunPacket::error_response(
                open,
                StunErrorCode::BadRequest,
                "no common congestion algorithm",
            ));
        }

        let suffix = suffix.to_string();
        let mut channel = Self::base(params, true, now);
        channel.remote_frag = suffix;
        channel.remote_channel = remote_channel;
        channel.remote_seq_start = remote_seq_start;
        channel.remote_info = open.connection_info.clone();
        if let Some(rtt) = open.minimum_rtt_ms {
            channel.min_rtt = channel.min_rtt.max(Duration::from_millis(rtt as u64));
        }
        if let Some(lifetime) = open.lifetime_seconds {
            channel.lifetime = Duration::from_secs(lifetime as u64);
        }
        channel.keepalive_deadline = now + keepalive_interval(channel.lifetime, channel.min_rtt);

        let mut response = StunPacket::success_response(open);
        response.channel_number = Some(channel.local_channel);
        response.next_sequence_number = Some(channel.local_seq_start);
        response.minimum_rtt_ms = Some(channel.min_rtt.as_millis() as u32);
        response.lifetime_seconds = Some(channel.lifetime.as_secs() as u32);
        response.local_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
        response.remote_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
        response.apply_integrity(channel.crypto.as_ref(), &channel.local_password);
        channel.open_response = Some(response.clone());

        channel.set_state(ChannelState::Connected);
        Ok((channel, response))
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn last_error(&self) -> Option<&(u16, String)> {
        self.error.as_ref()
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn local_channel(&self) -> u16 {
        self.local_channel
    }

    pub fn remote_channel(&self) -> u16 {
        self.remote_channel
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_connection_info(&self) -> Option<&str> {
        self.remote_info.as_deref()
    }

    pub fn drain_outputs(&mut self) -> Vec<ChannelOutput> {
        self.outputs.drain(..).collect()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == ChannelState::Shutdown {
            return None;
        }
        let mut deadline = Some(self.keepalive_deadline);
        if let Some(stream_deadline) = self.stream.as_ref().and_then(ChannelStream::next_timeout) {
            deadline = Some(deadline.map_or(stream_deadline, |d| d.min(stream_deadline)));
        }
        deadline
    }

    // ------------------------------------------------------------------
    // open handshake
    // ------------------------------------------------------------------

    /// Send the `ReliableChannelOpen` request once the substrate is
    /// usable. Idempotent.
    pub fn issue_connect_if_not_issued(&mut self, _now: Instant) {
        if self.connect_issued || self.incoming || self.state != ChannelState::Connecting {
            return;
        }
        self.connect_issued = true;
        let request = self.build_open_request();
        let id = self.next_requester_id();
        self.open_request = Some(id);
        trace!(channel = self.local_channel, "issuing channel open");
        self.outputs
            .push_back(ChannelOutput::IssueStunRequest { id, packet: request });
    }

    fn build_open_request(&self) -> StunPacket {
        let mut request = StunPacket::new(
            StunClass::Request,
            StunMethod::ReliableChannelOpen,
            self.transaction_id(),
        );
        request.username = Some(format!("{}:{}", self.remote_frag, self.local_frag));
        request.channel_number = Some(self.local_channel);
        request.next_sequence_number = Some(self.local_seq_start);
        request.minimum_rtt_ms = Some(self.min_rtt.as_millis() as u32);
        request.lifetime_seconds = Some(self.lifetime.as_secs() as u32);
        request.local_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
        request.remote_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
        request.connection_info = self.local_info.clone();
        request.realm = self.realm.clone();
        request.nonce = self.nonce.clone();
        request.apply_integrity(self.crypto.as_ref(), &self.remote_password);
        request
    }

    /// Attach the application streams to an accepted channel and start
    /// its reliable stream, replaying anything that arrived early.
    pub fn attach_streams(
        &mut self,
        receive_writer: StreamWriter,
        send_reader: StreamReader,
        now: Instant,
    ) {
        if self.stream.is_some() || self.state == ChannelState::Shutdown {
            return;
        }
        self.start_stream(receive_writer, send_reader, now);
        let buffered: Vec<RudpPacket> = self.buffered_rudp.drain(..).collect();
        for packet in buffered {
            if let Some(stream) = self.stream.as_mut() {
                stream.handle_packet(&packet, now);
            }
        }
        self.pump_stream(now);
    }

    fn start_stream(&mut self, receive_writer: StreamWriter, send_reader: StreamReader, now: Instant) {
        let params = ChannelStreamParams {
            sending_channel: self.remote_channel,
            receiving_channel: self.local_channel,
            local_sequence_start: self.local_seq_start,
            remote_sequence_start: self.remote_seq_start,
            min_rtt: self.min_rtt,
            lifetime: self.lifetime,
            segment_size: self.segment_size,
        };
        self.stream = Some(ChannelStream::new(params, receive_writer, send_reader, now));
    }

    // ------------------------------------------------------------------
    // inbound traffic
    // ------------------------------------------------------------------

    /// Raw RUDP packet demuxed to this channel.
    pub fn handle_rudp(&mut self, packet: &RudpPacket, now: Instant) {
        if self.state == ChannelState::Shutdown {
            return;
        }
        match self.stream.as_mut() {
            Some(stream) => {
                stream.handle_packet(packet, now);
                self.pump_stream(now);
            }
            None => {
                if self.buffered_rudp.len() == MAX_BUFFERED_PACKETS {
                    self.buffered_rudp.pop_front();
                }
                self.buffered_rudp.push_back(packet.clone());
            }
        }
    }

    /// STUN traffic demuxed to this channel. Returns the response to
    /// send, when the packet was a request.
    pub fn handle_stun(&mut self, packet: &StunPacket, now: Instant) -> Option<StunPacket> {
        if self.state == ChannelState::Shutdown {
            return None;
        }
        match (packet.method, packet.class) {
            (StunMethod::ReliableChannelOpen, StunClass::Request) => {
                // a retransmitted open: replay the original answer
                self.open_response.clone()
            }
            (StunMethod::ReliableChannelAck, class)
                if matches!(class, StunClass::Request | StunClass::Indication) =>
            {
                if !packet.valid_integrity(self.crypto.as_ref(), &self.local_password) {
                    return (class == StunClass::Request).then(|| {
                        StunPacket::error_response(
                            packet,
                            StunErrorCode::Unauthorized,
                            "message integrity failed",
                        )
                    });
                }
                if let (Some(gsnr), Some(gsnfr)) = (packet.gsnr, packet.gsnfr) {
                    let vector = packet
                        .ack_vector
                        .as_ref()
                        .and_then(|bytes| decode_vector_bytes(bytes).ok())
                        .unwrap_or_default();
                    if let Some(stream) = self.stream.as_mut() {
                        stream.handle_external_ack(gsnr, gsnfr, &vector, now);
                    }
                    self.pump_stream(now);
                }
                (class == StunClass::Request).then(|| {
                    let mut response = StunPacket::success_response(packet);
                    response.apply_integrity(self.crypto.as_ref(), &self.local_password);
                    response
                })
            }
            (StunMethod::ReliableChannelClose, StunClass::Request) => {
                if !packet.valid_integrity(self.crypto.as_ref(), &self.local_password) {
                    return Some(StunPacket::error_response(
                        packet,
                        StunErrorCode::Unauthorized,
                        "message integrity failed",
                    ));
                }
                debug!(channel = self.local_channel, "peer requested close");
                if self.state != ChannelState::ShuttingDown {
                    self.set_state(ChannelState::ShuttingDown);
                }
                if let Some(stream) = self.stream.as_mut() {
                    stream.close_from_peer(now);
                }
                self.pump_stream(now);
                if self
                    .stream
                    .as_ref()
                    .map_or(true, |s| s.state() == ChannelStreamState::Shutdown)
                {
                    self.set_state(ChannelState::Shutdown);
                }
                let mut response = StunPacket::success_response(packet);
                response.apply_integrity(self.crypto.as_ref(), &self.local_password);
                Some(response)
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // requester callbacks
    // ------------------------------------------------------------------

    pub fn on_stun_response(&mut self, id: RequesterId, response: &StunPacket, now: Instant) {
        if Some(id) == self.open_request {
            self.open_request = None;
            self.handle_open_response(response, now);
            return;
        }
        if Some(id) == self.close_request {
            self.close_request = None;
            self.set_state(ChannelState::Shutdown);
            return;
        }
        if let Some(stream_request) = self.outstanding_acks.remove(&id) {
            if let Some(stream) = self.stream.as_mut() {
                stream.external_ack_delivered(stream_request);
            }
            self.pump_stream(now);
        }
    }

    fn handle_open_response(&mut self, response: &StunPacket, now: Instant) {
        if response.is_error() {
            let code = response.error_code.unwrap_or(0);
            let stale = code == StunErrorCode::Unauthorized.as_u16()
                || code == StunErrorCode::StaleNonce.as_u16();
            if stale && !self.credentials_refreshed && response.nonce.is_some() {
                // standard long-term-credential recovery, once
                self.realm = response.realm.clone();
                self.nonce = response.nonce.clone();
                self.credentials_refreshed = true;
                let request = self.build_open_request();
                let id = self.next_requester_id();
                self.open_request = Some(id);
                debug!(channel = self.local_channel, "retrying open with fresh nonce");
                self.outputs
                    .push_back(ChannelOutput::IssueStunRequest { id, packet: request });
                return;
            }
            let code = if code == 0 {
                ErrorCode::BadRequest.as_u16()
            } else {
                code
            };
            self.fail_code(code, "channel open rejected");
            return;
        }

        if !response.valid_integrity(self.crypto.as_ref(), &self.remote_password) {
            self.fail(ErrorCode::Unauthorized, "open response integrity failed");
            return;
        }
        let (Some(remote_channel), Some(remote_seq)) =
            (response.channel_number, response.next_sequence_number)
        else {
            self.fail(
                ErrorCode::BadRequest,
                "open response missing channel attributes",
            );
            return;
        };

        self.remote_channel = remote_channel;
        self.remote_seq_start = remote_seq;
        self.remote_info = response.connection_info.clone();
        if let Some(rtt) = response.minimum_rtt_ms {
            self.min_rtt = self.min_rtt.max(Duration::from_millis(rtt as u64));
        }
        if let Some(lifetime) = response.lifetime_seconds {
            self.lifetime = Duration::from_secs(lifetime as u64);
        }

        if let Some((receive_writer, send_reader)) = self.pending_streams.take() {
            self.start_stream(receive_writer, send_reader, now);
        }
        self.set_state(ChannelState::Connected);
        // flush anything the application queued before the handshake
        if let Some(stream) = self.stream.as_mut() {
            stream.notify_send_data(now);
        }
        self.pump_stream(now);
    }

    pub fn on_stun_request_timeout(&mut self, id: RequesterId, _now: Instant) {
        self.stun_timed_out = true;
        if Some(id) == self.open_request {
            self.open_request = None;
            if let Some(stream) = self.stream.as_mut() {
                stream.cancel();
            }
            self.fail(ErrorCode::RequestTimeout, "channel open timed out");
            return;
        }
        if Some(id) == self.close_request {
            self.close_request = None;
            self.set_state(ChannelState::Shutdown);
            return;
        }
        if self.outstanding_acks.remove(&id).is_some() {
            warn!(channel = self.local_channel, "guaranteed ack delivery timed out");
        }
    }

    // ------------------------------------------------------------------
    // timers / write readiness
    // ------------------------------------------------------------------

    pub fn on_timer(&mut self, now: Instant) {
        if self.state == ChannelState::Shutdown {
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.on_timer(now);
        }
        self.pump_stream(now);
        if self.state == ChannelState::Shutdown {
            return;
        }

        if now >= self.keepalive_deadline {
            let interval = keepalive_interval(self.lifetime, self.min_rtt);
            let stream_active = match now.checked_sub(interval) {
                Some(quiet_since) => self.last_sent_data.is_some_and(|t| t >= quiet_since),
                None => false,
            };
            if !stream_active && self.state == ChannelState::Connected {
                let ack = self.build_ack_packet(StunClass::Indication);
                self.outputs.push_back(ChannelOutput::SendStunIndication(ack));
            }
            self.keepalive_deadline = now + interval;
        }
    }

    /// Substrate became writable: let the stream drain inside its
    /// window.
    pub fn notify_write_ready(&mut self, now: Instant) {
        if let Some(stream) = self.stream.as_mut() {
            stream.notify_send_data(now);
        }
        self.pump_stream(now);
    }

    /// The outgoing TransportStream has data to send.
    pub fn notify_send_data(&mut self, now: Instant) {
        self.notify_write_ready(now);
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Close one direction of the stream without tearing the channel
    /// down.
    pub fn shutdown_direction(&mut self, direction: ShutdownDirection, now: Instant) {
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown_direction(direction, now);
        }
        self.pump_stream(now);
    }

    /// Graceful local shutdown: drain, then say goodbye over STUN --
    /// unless a request already timed out on this channel, in which
    /// case the peer is assumed unreachable and no goodbye is sent.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            ChannelState::Shutdown => return,
            ChannelState::ShuttingDown => return,
            _ => {}
        }

        if self.stun_timed_out {
            debug!(
                channel = self.local_channel,
                "shutdown without goodbye after request timeout"
            );
            if let Some(stream) = self.stream.as_mut() {
                stream.cancel();
            }
            self.pump_stream(now);
            self.set_state(ChannelState::Shutdown);
            return;
        }

        self.set_state(ChannelState::ShuttingDown);

        // register the goodbye before the stream drains so a stream
        // that finishes instantly cannot shortcut past the handshake
        let mut request = StunPacket::new(
            StunClass::Request,
            StunMethod::ReliableChannelClose,
            self.transaction_id(),
        );
        request.username = Some(format!("{}:{}", self.remote_frag, self.local_frag));
        request.channel_number = Some(self.local_channel);
        request.lifetime_seconds = Some(0);
        request.realm = self.realm.clone();
        request.nonce = self.nonce.clone();
        request.apply_integrity(self.crypto.as_ref(), &self.remote_password);

        let id = self.next_requester_id();
        self.close_request = Some(id);
        self.outputs
            .push_back(ChannelOutput::IssueStunRequest { id, packet: request });

        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown(now);
        }
        self.pump_stream(now);
    }

    /// Terminal teardown on a transport-level failure: no goodbye.
    pub fn shutdown_from_timeout(&mut self) {
        if self.state == ChannelState::Shutdown {
            return;
        }
        if let Some(id) = self.open_request.take() {
            self.outputs.push_back(ChannelOutput::CancelStunRequest(id));
        }
        if let Some(id) = self.close_request.take() {
            self.outputs.push_back(ChannelOutput::CancelStunRequest(id));
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.cancel();
        }
        self.fail(ErrorCode::RequestTimeout, "transport terminated");
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn pump_stream(&mut self, now: Instant) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let outputs = stream.drain_outputs();
        for output in outputs {
            match output {
                StreamOutput::SendPacket(bytes) => {
                    self.last_sent_data = Some(now);
                    self.outputs.push_back(ChannelOutput::SendPacket(bytes));
                }
                StreamOutput::AckNow {
                    guarantee,
                    request_id,
                } => {
                    let ack = self.build_ack_packet(if guarantee {
                        StunClass::Request
                    } else {
                        StunClass::Indication
                    });
                    if guarantee {
                        let id = self.next_requester_id();
                        self.outstanding_acks.insert(id, request_id);
                        self.outputs
                            .push_back(ChannelOutput::IssueStunRequest { id, packet: ack });
                    } else {
                        self.outputs.push_back(ChannelOutput::SendStunIndication(ack));
                        if let Some(stream) = self.stream.as_mut() {
                            stream.external_ack_delivered(request_id);
                        }
                    }
                }
                StreamOutput::StateChanged { state, error } => {
                    self.on_stream_state(state, error);
                }
            }
        }
    }

    fn on_stream_state(&mut self, state: ChannelStreamState, error: Option<(u16, String)>) {
        if state != ChannelStreamState::Shutdown {
            return;
        }
        match error {
            Some((code, reason)) => {
                // lifetime expiry and peer violations are fatal and
                // silent: the close handshake is skipped
                self.fail_code(code, &reason);
            }
            None => {
                if self.state == ChannelState::ShuttingDown && self.close_request.is_none() {
                    self.set_state(ChannelState::Shutdown);
                }
            }
        }
    }

    fn build_ack_packet(&self, class: StunClass) -> StunPacket {
        let mut ack = StunPacket::new(class, StunMethod::ReliableChannelAck, self.transaction_id());
        ack.username = Some(format!("{}:{}", self.remote_frag, self.local_frag));
        ack.channel_number = Some(self.local_channel);
        if let Some(stream) = self.stream.as_ref() {
            let info = stream.ack_info();
            ack.gsnr = Some(info.gsnr);
            ack.gsnfr = Some(info.gsnfr);
            if !info.vector.is_empty() {
                ack.ack_vector = Some(info.vector);
            }
        }
        ack.apply_integrity(self.crypto.as_ref(), &self.remote_password);
        ack
    }

    fn transaction_id(&self) -> [u8; 12] {
        let bytes = self.crypto.random_bytes(12);
        let mut id = [0u8; 12];
        id.copy_from_slice(&bytes[..12]);
        id
    }

    fn next_requester_id(&self) -> RequesterId {
        self.requester_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state == state {
            return;
        }
        debug!(channel = self.local_channel, ?state, "channel state");
        self.state = state;
        self.outputs.push_back(ChannelOutput::StateChanged {
            state,
            error: self.error.clone(),
        });
    }

    fn fail(&mut self, code: ErrorCode, reason: &str) {
        self.fail_code(code.as_u16(), reason);
    }

    fn fail_code(&mut self, code: u16, reason: &str) {
        if self.state == ChannelState::Shutdown {
            warn!(code, reason, "error after terminal state");
            return;
        }
        self.error = Some((code, reason.to_string()));
        self.set_state(ChannelState::Shutdown);
    }
}

fn keepalive_interval(lifetime: Duration, min_rtt: Duration) -> Duration {
    (lifetime / 3).max(min_rtt * 8)
}
