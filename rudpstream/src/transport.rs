//! Per-path transport: owns every channel sharing one unreliable
//! substrate, demultiplexes inbound traffic, and fields channel-open
//! requests from the peer.
//!
//! RUDP datagrams route by their leading channel number (the receiver's
//! local number); STUN control traffic routes by the sender's channel
//! number through a second index. Channels are owned values addressed
//! by their local number; everything a channel wants to say to the wire
//! is drained through the transport's output queue.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelOutput, ChannelParams, ChannelState};
use crate::config::RudpConfig;
use crate::error::{Result, RudpError};
use crate::packet::{RudpPacket, CHANNEL_RANGE_END, CHANNEL_RANGE_START, SEQUENCE_MASK};
use crate::stream::TransportStream;
use crate::stun::{
    CryptoProvider, RequesterId, StunClass, StunErrorCode, StunMethod, StunPacket,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Pending,
    Ready,
    ShuttingDown,
    Shutdown,
}

/// State reported by the underlying ICE-style substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstrateState {
    Pending,
    Nominated,
    Completed,
    Shutdown,
}

/// Everything the transport asks its driver to do.
#[derive(Debug, Clone)]
pub enum TransportOutput {
    /// Raw RUDP bytes for the substrate.
    SendPacket { dest: SocketAddr, packet: Bytes },
    /// A STUN value for the external codec to serialise and send.
    SendStun { dest: SocketAddr, packet: StunPacket },
    /// Submit to the STUN requester engine.
    IssueStunRequest {
        id: RequesterId,
        dest: SocketAddr,
        packet: StunPacket,
    },
    CancelStunRequest(RequesterId),
    /// An accepted channel is waiting in the accept queue.
    ChannelWaiting,
    StateChanged {
        state: TransportState,
        error: Option<(u16, String)>,
    },
    ChannelStateChanged {
        local_channel: u16,
        state: ChannelState,
        error: Option<(u16, String)>,
    },
}

/// Identity of the ICE path this transport rides.
pub struct TransportParams {
    pub local_frag: String,
    pub local_password: String,
    pub remote_frag: String,
    pub remote_password: String,
    pub remote_addr: SocketAddr,
    pub config: RudpConfig,
    pub crypto: Arc<dyn CryptoProvider>,
    pub rng: Box<dyn Rng + Send>,
}

/// An OS-seeded RNG for production use; tests inject deterministic
/// sequences instead.
pub fn default_rng() -> Box<dyn Rng + Send> {
    Box::new(StdRng::from_rng(&mut rand::rng()))
}

pub struct Transport {
    state: TransportState,
    error: Option<(u16, String)>,

    local_frag: String,
    local_password: String,
    remote_frag: String,
    remote_password: String,
    remote_addr: SocketAddr,
    config: RudpConfig,
    crypto: Arc<dyn CryptoProvider>,
    rng: Box<dyn Rng + Send>,

    channels: HashMap<u16, Channel>,
    remote_index: HashMap<u16, u16>,
    pending_accepts: Arc<SegQueue<u16>>,
    requester_routes: HashMap<RequesterId, u16>,
    requester_ids: Arc<AtomicU64>,

    outputs: VecDeque<TransportOutput>,
}

impl Transport {
    pub fn new(params: TransportParams) -> Self {
        Self {
            state: TransportState::Pending,
            error: None,
            local_frag: params.local_frag,
            local_password: params.local_password,
            remote_frag: params.remote_frag,
            remote_password: params.remote_password,
            remote_addr: params.remote_addr,
            config: params.config,
            crypto: params.crypto,
            rng: params.rng,
            channels: HashMap::new(),
            remote_index: HashMap::new(),
            pending_accepts: Arc::new(SegQueue::new()),
            requester_routes: HashMap::new(),
            requester_ids: Arc::new(AtomicU64::new(1)),
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn last_error(&self) -> Option<&(u16, String)> {
        self.error.as_ref()
    }

    pub fn local_frag(&self) -> &str {
        &self.local_frag
    }

    pub fn remote_frag(&self) -> &str {
        &self.remote_frag
    }

    pub fn drain_outputs(&mut self) -> Vec<TransportOutput> {
        self.outputs.drain(..).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_state(&self, local_channel: u16) -> Option<ChannelState> {
        self.channels.get(&local_channel).map(Channel::state)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(Channel::next_timeout)
            .min()
    }

    // ------------------------------------------------------------------
    // substrate edges
    // ------------------------------------------------------------------

    pub fn on_substrate_state(&mut self, substrate: SubstrateState, now: Instant) {
        match substrate {
            SubstrateState::Pending => {}
            SubstrateState::Nominated | SubstrateState::Completed => {
                if self.state == TransportState::Pending {
                    self.set_state(TransportState::Ready);
                    let locals: Vec<u16> = self.channels.keys().copied().collect();
                    for local in locals {
                        if let Some(channel) = self.channels.get_mut(&local) {
                            channel.issue_connect_if_not_issued(now);
                        }
                        self.drain_channel(local, now);
                    }
                }
            }
            SubstrateState::Shutdown => {
                // the path died under us: every channel goes down the
                // timeout path, no goodbyes
                let locals: Vec<u16> = self.channels.keys().copied().collect();
                for local in locals {
                    if let Some(channel) = self.channels.get_mut(&local) {
                        channel.shutdown_from_timeout();
                    }
                    self.drain_channel(local, now);
                }
                self.fail(RudpError::Timeout.code().as_u16(), "substrate shut down");
            }
        }
    }

    /// The substrate became writable: every channel may drain inside
    /// its window.
    pub fn notify_write_ready(&mut self, now: Instant) {
        let locals: Vec<u16> = self.channels.keys().copied().collect();
        for local in locals {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.notify_write_ready(now);
            }
            self.drain_channel(local, now);
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        if self.state == TransportState::Shutdown {
            return;
        }
        let locals: Vec<u16> = self.channels.keys().copied().collect();
        for local in locals {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.on_timer(now);
            }
            self.drain_channel(local, now);
        }
        self.step_shutdown();
    }

    // ------------------------------------------------------------------
    // opening and accepting channels
    // ------------------------------------------------------------------

    /// Open a channel toward the peer. The receive stream's writer and
    /// the send stream's reader are claimed by the channel.
    pub fn open_channel(
        &mut self,
        connection_info: Option<String>,
        receive_stream: &TransportStream,
        send_stream: &TransportStream,
        now: Instant,
    ) -> Result<u16> {
        if matches!(
            self.state,
            TransportState::ShuttingDown | TransportState::Shutdown
        ) {
            return Err(RudpError::ShuttingDown);
        }

        let local_channel = self.pick_channel_number()?;
        let params = self.channel_params(local_channel);
        let channel = Channel::outgoing(
            params,
            connection_info,
            receive_stream.writer(),
            send_stream.reader(),
            now,
        );
        self.channels.insert(local_channel, channel);
        debug!(local_channel, "channel opened");

        if self.state == TransportState::Ready {
            if let Some(channel) = self.channels.get_mut(&local_channel) {
                channel.issue_connect_if_not_issued(now);
            }
        }
        self.drain_channel(local_channel, now);
        Ok(local_channel)
    }

    /// Claim the oldest accepted-but-unclaimed incoming channel.
    pub fn accept_channel(
        &mut self,
        receive_stream: &TransportStream,
        send_stream: &TransportStream,
        now: Instant,
    ) -> Option<u16> {
        while let Some(local) = self.pending_accepts.pop() {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.attach_streams(receive_stream.writer(), send_stream.reader(), now);
                self.drain_channel(local, now);
                return Some(local);
            }
            // the channel died while queued; try the next one
        }
        None
    }

    fn channel_params(&mut self, local_channel: u16) -> ChannelParams {
        ChannelParams {
            remote_addr: self.remote_addr,
            local_channel,
            local_frag: self.local_frag.clone(),
            local_password: self.local_password.clone(),
            remote_frag: self.remote_frag.clone(),
            remote_password: self.remote_password.clone(),
            local_sequence_start: (self.rng.next_u64() & SEQUENCE_MASK).max(1),
            config: self.config.clone(),
            crypto: self.crypto.clone(),
            requester_ids: self.requester_ids.clone(),
        }
    }

    /// Probe for an unused local channel number, bounded attempts.
    fn pick_channel_number(&mut self) -> Result<u16> {
        let span = (CHANNEL_RANGE_END - CHANNEL_RANGE_START) as u32;
        for _ in 0..self.config.max_channel_attempts {
            let candidate = (self.rng.next_u32() % span) as u16 + CHANNEL_RANGE_START;
            if !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RudpError::InsufficientCapacity(
            self.config.max_channel_attempts,
        ))
    }

    // ------------------------------------------------------------------
    // inbound demux
    // ------------------------------------------------------------------

    /// Feed one raw datagram from the substrate. Returns `true` when
    /// the bytes were an RUDP packet (even if dropped); `false` means
    /// the caller should try its STUN codec.
    pub fn handle_packet(&mut self, data: &[u8], now: Instant) -> bool {
        if !RudpPacket::is_rudp(data) {
            return false;
        }
        let packet = match RudpPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(%err, "undecodable rudp datagram dropped");
                return true;
            }
        };
        let local = packet.channel_number;
        if self.channels.contains_key(&local) {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.handle_rudp(&packet, now);
            }
            self.drain_channel(local, now);
        } else {
            trace!(channel = local, "rudp for unknown channel dropped");
        }
        true
    }

    /// Feed one parsed STUN packet from the substrate. Returns `false`
    /// when the credentials are not ours and someone else should handle
    /// it.
    pub fn handle_stun(
        &mut self,
        packet: &StunPacket,
        local_frag: &str,
        _remote_frag: &str,
        now: Instant,
    ) -> bool {
        if local_frag != self.local_frag {
            return false;
        }
        if self.state == TransportState::Shutdown {
            return false;
        }

        if let Some(remote_channel) = packet.channel_number {
            if let Some(&local) = self.remote_index.get(&remote_channel) {
                let response = self
                    .channels
                    .get_mut(&local)
                    .and_then(|channel| channel.handle_stun(packet, now));
                self.drain_channel(local, now);
                if let Some(response) = response {
                    self.send_stun(response);
                }
                return true;
            }
        }

        if packet.method == StunMethod::ReliableChannelOpen
            && packet.class == StunClass::Request
        {
            self.accept_new_channel(packet, now);
            return true;
        }

        // anything else aimed at us with no channel behind it
        self.send_stun(StunPacket::error_response(
            packet,
            StunErrorCode::BadRequest,
            "no such channel",
        ));
        true
    }

    fn accept_new_channel(&mut self, open: &StunPacket, now: Instant) {
        if matches!(
            self.state,
            TransportState::ShuttingDown | TransportState::Shutdown
        ) {
            self.send_stun(StunPacket::error_response(
                open,
                StunErrorCode::BadRequest,
                "shutting down",
            ));
            return;
        }

        // mandatory attributes before anything else
        if open.username.is_none()
            || open.message_integrity.is_none()
            || open.next_sequence_number.is_none()
            || open.local_congestion_control.is_empty()
            || open.remote_congestion_control.is_empty()
            || open.channel_number.is_none()
        {
            self.send_stun(StunPacket::error_response(
                open,
                StunErrorCode::BadRequest,
                "missing mandatory attributes",
            ));
            return;
        }

        let local_channel = match self.pick_channel_number() {
            Ok(candidate) => candidate,
            Err(_) => {
                warn!("no free channel number for incoming open");
                self.send_stun(StunPacket::error_response(
                    open,
                    StunErrorCode::InsufficientCapacity,
                    "no free channel numbers",
                ));
                return;
            }
        };

        let params = self.channel_params(local_channel);
        match Channel::incoming(params, open, now) {
            Ok((channel, response)) => {
                let remote_channel = channel.remote_channel();
                self.channels.insert(local_channel, channel);
                self.remote_index.insert(remote_channel, local_channel);
                self.pending_accepts.push(local_channel);
                debug!(local_channel, remote_channel, "incoming channel accepted");
                self.send_stun(response);
                self.outputs.push_back(TransportOutput::ChannelWaiting);
                self.drain_channel(local_channel, now);
            }
            Err(response) => {
                self.send_stun(response);
            }
        }
    }

    // ------------------------------------------------------------------
    // requester callbacks
    // ------------------------------------------------------------------

    pub fn on_stun_response(&mut self, id: RequesterId, response: &StunPacket, now: Instant) {
        let Some(local) = self.requester_routes.remove(&id) else {
            return;
        };
        if let Some(channel) = self.channels.get_mut(&local) {
            channel.on_stun_response(id, response, now);
        }
        self.drain_channel(local, now);
        self.step_shutdown();
    }

    pub fn on_stun_request_timeout(&mut self, id: RequesterId, now: Instant) {
        let Some(local) = self.requester_routes.remove(&id) else {
            return;
        };
        if let Some(channel) = self.channels.get_mut(&local) {
            channel.on_stun_request_timeout(id, now);
        }
        self.drain_channel(local, now);
        self.step_shutdown();
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: every channel says goodbye, and the transport
    /// goes terminal once they are all down.
    pub fn shutdown(&mut self, now: Instant) {
        if matches!(
            self.state,
            TransportState::ShuttingDown | TransportState::Shutdown
        ) {
            return;
        }
        self.set_state(TransportState::ShuttingDown);
        let locals: Vec<u16> = self.channels.keys().copied().collect();
        for local in locals {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.shutdown(now);
            }
            self.drain_channel(local, now);
        }
        self.step_shutdown();
    }

    /// Immediate teardown; idempotent.
    pub fn cancel(&mut self, now: Instant) {
        if self.state == TransportState::Shutdown {
            return;
        }
        let locals: Vec<u16> = self.channels.keys().copied().collect();
        for local in locals {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.shutdown_from_timeout();
            }
            self.drain_channel(local, now);
        }
        self.set_state(TransportState::Shutdown);
    }

    fn step_shutdown(&mut self) {
        if self.state == TransportState::ShuttingDown && self.channels.is_empty() {
            self.set_state(TransportState::Shutdown);
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn send_stun(&mut self, packet: StunPacket) {
        self.outputs.push_back(TransportOutput::SendStun {
            dest: self.remote_addr,
            packet,
        });
    }

    fn drain_channel(&mut self, local: u16, _now: Instant) {
        let Some(channel) = self.channels.get_mut(&local) else {
            return;
        };
        let dest = channel.remote_addr();
        let outputs = channel.drain_outputs();

        for output in outputs {
            match output {
                ChannelOutput::SendPacket(packet) => {
                    self.outputs
                        .push_back(TransportOutput::SendPacket { dest, packet });
                }
                ChannelOutput::IssueStunRequest { id, packet } => {
                    self.requester_routes.insert(id, local);
                    self.outputs
                        .push_back(TransportOutput::IssueStunRequest { id, dest, packet });
                }
                ChannelOutput::CancelStunRequest(id) => {
                    self.requester_routes.remove(&id);
                    self.outputs
                        .push_back(TransportOutput::CancelStunRequest(id));
                }
                ChannelOutput::SendStunIndication(packet) => {
                    self.outputs
                        .push_back(TransportOutput::SendStun { dest, packet });
                }
                ChannelOutput::StateChanged { state, error } => {
                    if state == ChannelState::Connected {
                        if let Some(channel) = self.channels.get(&local) {
                            let remote_channel = channel.remote_channel();
                            if remote_channel != 0 {
                                self.remote_index.insert(remote_channel, local);
                            }
                        }
                    }
                    self.outputs.push_back(TransportOutput::ChannelStateChanged {
                        local_channel: local,
                        state,
                        error,
                    });
                }
            }
        }

        // sweep terminal channels out of both indexes
        if self
            .channels
            .get(&local)
            .is_some_and(|channel| channel.state() == ChannelState::Shutdown)
        {
            self.channels.remove(&local);
            self.remote_index.retain(|_, &mut mapped| mapped != local);
            self.requester_routes.retain(|_, &mut mapped| mapped != local);
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        debug!(?state, "transport state");
        self.state = state;
        self.outputs.push_back(TransportOutput::StateChanged {
            state,
            error: self.error.clone(),
        });
    }

    fn fail(&mut self, code: u16, reason: &str) {
        if self.state == TransportState::Shutdown {
            warn!(code, reason, "error after terminal state");
            return;
        }
        self.error = Some((code, reason.to_string()));
        self.set_state(TransportState::Shutdown);
    }
}
