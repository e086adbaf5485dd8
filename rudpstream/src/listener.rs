//! Accept-side listener for substrates without an ICE session.
//!
//! Where [`crate::transport::Transport`] pairs with exactly one remote
//! path, the listener fields `ReliableChannelOpen` requests from any
//! remote address on a shared socket: it validates them against its own
//! credentials, allocates local channel numbers from the same probe
//! range, and demuxes follow-up traffic per `(remote address, channel)`.
//! Channels in listener mode run on a shared secret: the local password
//! authenticates both directions.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelOutput, ChannelParams, ChannelState};
use crate::config::RudpConfig;
use crate::error::{Result, RudpError};
use crate::packet::{RudpPacket, CHANNEL_RANGE_END, CHANNEL_RANGE_START, SEQUENCE_MASK};
use crate::stream::TransportStream;
use crate::stun::{CryptoProvider, RequesterId, StunClass, StunErrorCode, StunMethod, StunPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    ShuttingDown,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum ListenerOutput {
    SendPacket {
        dest: SocketAddr,
        packet: Bytes,
    },
    SendStun {
        dest: SocketAddr,
        packet: StunPacket,
    },
    IssueStunRequest {
        id: RequesterId,
        dest: SocketAddr,
        packet: StunPacket,
    },
    CancelStunRequest(RequesterId),
    ChannelWaiting,
    StateChanged {
        state: ListenerState,
    },
    ChannelStateChanged {
        local_channel: u16,
        state: ChannelState,
        error: Option<(u16, String)>,
    },
}

pub struct ListenerParams {
    pub local_frag: String,
    pub local_password: String,
    pub config: RudpConfig,
    pub crypto: Arc<dyn CryptoProvider>,
    pub rng: Box<dyn Rng + Send>,
}

pub struct Listener {
    state: ListenerState,
    local_frag: String,
    local_password: String,
    config: RudpConfig,
    crypto: Arc<dyn CryptoProvider>,
    rng: Box<dyn Rng + Send>,

    channels: HashMap<u16, Channel>,
    remote_index: HashMap<(SocketAddr, u16), u16>,
    pending_accepts: Arc<SegQueue<u16>>,
    requester_routes: HashMap<RequesterId, u16>,
    requester_ids: Arc<AtomicU64>,

    outputs: VecDeque<ListenerOutput>,
}

impl Listener {
    pub fn new(params: ListenerParams) -> Self {
        Self {
            state: ListenerState::Listening,
            local_frag: params.local_frag,
            local_password: params.local_password,
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

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn drain_outputs(&mut self) -> Vec<ListenerOutput> {
        self.outputs.drain(..).collect()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(Channel::next_timeout)
            .min()
    }

    /// Feed one raw datagram. Returns `true` if it was RUDP.
    pub fn handle_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> bool {
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
        let routed = self
            .channels
            .get(&local)
            .is_some_and(|channel| channel.remote_addr() == from);
        if routed {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.handle_rudp(&packet, now);
            }
            self.drain_channel(local, now);
        } else {
            trace!(channel = local, %from, "rudp without matching channel dropped");
        }
        true
    }

    /// Feed one parsed STUN packet.
    pub fn handle_stun(&mut self, packet: &StunPacket, from: SocketAddr, now: Instant) -> bool {
        if self.state == ListenerState::Shutdown {
            return false;
        }

        if let Some(remote_channel) = packet.channel_number {
            if let Some(&local) = self.remote_index.get(&(from, remote_channel)) {
                let response = self
                    .channels
                    .get_mut(&local)
                    .and_then(|channel| channel.handle_stun(packet, now));
                self.drain_channel(local, now);
                if let Some(response) = response {
                    self.outputs.push_back(ListenerOutput::SendStun {
                        dest: from,
                        packet: response,
                    });
                }
                return true;
            }
        }

        if packet.method == StunMethod::ReliableChannelOpen
            && packet.class == StunClass::Request
        {
            self.accept_new_channel(packet, from, now);
            return true;
        }

        self.outputs.push_back(ListenerOutput::SendStun {
            dest: from,
            packet: StunPacket::error_response(
                packet,
                StunErrorCode::BadRequest,
                "no such channel",
            ),
        });
        true
    }

    fn accept_new_channel(&mut self, open: &StunPacket, from: SocketAddr, now: Instant) {
        if self.state != ListenerState::Listening {
            self.outputs.push_back(ListenerOutput::SendStun {
                dest: from,
                packet: StunPacket::error_response(
                    open,
                    StunErrorCode::BadRequest,
                    "shutting down",
                ),
            });
            return;
        }
        if open.username.is_none()
            || open.message_integrity.is_none()
            || open.next_sequence_number.is_none()
            || open.channel_number.is_none()
            || open.local_congestion_control.is_empty()
            || open.remote_congestion_control.is_empty()
        {
            self.outputs.push_back(ListenerOutput::SendStun {
                dest: from,
                packet: StunPacket::error_response(
                    open,
                    StunErrorCode::BadRequest,
                    "missing mandatory attributes",
                ),
            });
            return;
        }

        let local_channel = match self.pick_channel_number() {
            Ok(candidate) => candidate,
            Err(_) => {
                warn!(%from, "no free channel number for incoming open");
                self.outputs.push_back(ListenerOutput::SendStun {
                    dest: from,
                    packet: StunPacket::error_response(
                        open,
                        StunErrorCode::InsufficientCapacity,
                        "no free channel numbers",
                    ),
                });
                return;
            }
        };

        let params = ChannelParams {
            remote_addr: from,
            local_channel,
            local_frag: self.local_frag.clone(),
            local_password: self.local_password.clone(),
            remote_frag: String::new(), // learned from the open username
            // listener mode runs on a shared secret
            remote_password: self.local_password.clone(),
            local_sequence_start: (self.rng.next_u64() & SEQUENCE_MASK).max(1),
            config: self.config.clone(),
            crypto: self.crypto.clone(),
            requester_ids: self.requester_ids.clone(),
        };

        match Channel::incoming(params, open, now) {
            Ok((channel, response)) => {
                let remote_channel = channel.remote_channel();
                self.channels.insert(local_channel, channel);
                self.remote_index
                    .insert((from, remote_channel), local_channel);
                self.pending_accepts.push(local_channel);
                debug!(local_channel, %from, "incoming channel accepted");
                self.outputs.push_back(ListenerOutput::SendStun {
                    dest: from,
                    packet: response,
                });
                self.outputs.push_back(ListenerOutput::ChannelWaiting);
                self.drain_channel(local_channel, now);
            }
            Err(response) => {
                self.outputs.push_back(ListenerOutput::SendStun {
                    dest: from,
                    packet: response,
                });
            }
        }
    }

    /// Claim the oldest accepted-but-unclaimed channel.
    pub fn accept_channel(
        &mut self,
        receive_stream: &TransportStream,
        send_stream: &TransportStream,
        now: Instant,
    ) -> Option<(u16, SocketAddr)> {
        while let Some(local) = self.pending_accepts.pop() {
            if let Some(channel) = self.channels.get_mut(&local) {
                let from = channel.remote_addr();
                channel.attach_streams(receive_stream.writer(), send_stream.reader(), now);
                self.drain_channel(local, now);
                return Some((local, from));
            }
        }
        None
    }

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

    pub fn on_timer(&mut self, now: Instant) {
        if self.state == ListenerState::Shutdown {
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

    pub fn shutdown(&mut self, now: Instant) {
        if self.state != ListenerState::Listening {
            return;
        }
        self.set_state(ListenerState::ShuttingDown);
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
        if self.state == ListenerState::Shutdown {
            return;
        }
        let locals: Vec<u16> = self.channels.keys().copied().collect();
        for local in locals {
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.shutdown_from_timeout();
            }
            self.drain_channel(local, now);
        }
        self.set_state(ListenerState::Shutdown);
    }

    fn step_shutdown(&mut self) {
        if self.state == ListenerState::ShuttingDown && self.channels.is_empty() {
            self.set_state(ListenerState::Shutdown);
        }
    }

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
                        .push_back(ListenerOutput::SendPacket { dest, packet });
                }
                ChannelOutput::IssueStunRequest { id, packet } => {
                    self.requester_routes.insert(id, local);
                    self.outputs
                        .push_back(ListenerOutput::IssueStunRequest { id, dest, packet });
                }
                ChannelOutput::CancelStunRequest(id) => {
                    self.requester_routes.remove(&id);
                    self.outputs
                        .push_back(ListenerOutput::CancelStunRequest(id));
                }
                ChannelOutput::SendStunIndication(packet) => {
                    self.outputs
                        .push_back(ListenerOutput::SendStun { dest, packet });
                }
                ChannelOutput::StateChanged { state, error } => {
                    self.outputs.push_back(ListenerOutput::ChannelStateChanged {
                        local_channel: local,
                        state,
                        error,
                    });
                }
            }
        }

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

    fn set_state(&mut self, state: ListenerState) {
        if self.state == state {
            return;
        }
        debug!(?state, "listener state");
        self.state = state;
        self.outputs
            .push_back(ListenerOutput::StateChanged { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCrypto;

    impl CryptoProvider for TestCrypto {
        fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
            let mut out = vec![0u8; 20];
            for (i, b) in key.iter().chain(data.iter()).enumerate() {
                out[i % 20] = out[i % 20].wrapping_add(*b).rotate_left(3);
            }
            out
        }

        fn random_bytes(&self, len: usize) -> Vec<u8> {
            (0..len).map(|i| i as u8).collect()
        }
    }

    struct CountingRng(u64);

    impl CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0 += 1;
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
    }

    impl rand::rand_core::TryRng for CountingRng {
        type Error = std::convert::Infallible;

        fn try_next_u32(&mut self) -> std::result::Result<u32, Self::Error> {
            Ok(self.next_u32())
        }

        fn try_next_u64(&mut self) -> std::result::Result<u64, Self::Error> {
            Ok(self.next_u64())
        }

        fn try_fill_bytes(&mut self, dst: &mut [u8]) -> std::result::Result<(), Self::Error> {
            self.fill_bytes(dst);
            Ok(())
        }
    }

    fn listener() -> Listener {
        Listener::new(ListenerParams {
            local_frag: "serverfrag".into(),
            local_password: "serverpass".into(),
            config: RudpConfig::default(),
            crypto: Arc::new(TestCrypto),
            rng: Box::new(CountingRng(0)),
        })
    }

    fn open_from(frag: &str) -> StunPacket {
        let mut open = StunPacket::new(
            StunClass::Request,
            StunMethod::ReliableChannelOpen,
            [1; 12],
        );
        open.username = Some(format!("serverfrag:{frag}"));
        open.channel_number = Some(0x4abc);
        open.next_sequence_number = Some(50);
        open.local_congestion_control =
            vec![crate::stun::CongestionAlgorithm::TcpLikeWindow];
        open.remote_congestion_control =
            vec![crate::stun::CongestionAlgorithm::TcpLikeWindow];
        open.apply_integrity(&TestCrypto, "serverpass");
        open
    }

    #[test]
    fn accepts_opens_from_multiple_remotes() {
        let mut listener = listener();
        let now = Instant::now();
        let peer_a: SocketAddr = "10.0.0.1:1111".parse().unwrap();
        let peer_b: SocketAddr = "10.0.0.2:2222".parse().unwrap();

        assert!(listener.handle_stun(&open_from("alice"), peer_a, now));
        assert!(listener.handle_stun(&open_from("bob"), peer_b, now));
        assert_eq!(listener.channel_count(), 2);

        let receive = TransportStream::new();
        let send = TransportStream::new();
        let (_, from_a) = listener.accept_channel(&receive, &send, now).unwrap();
        let (_, from_b) = listener.accept_channel(&receive, &send, now).unwrap();
        assert_eq!(from_a, peer_a);
        assert_eq!(from_b, peer_b);
        assert!(listener.accept_channel(&receive, &send, now).is_none());
    }

    #[test]
    fn rudp_from_wrong_address_is_dropped() {
        let mut listener = listener();
        let now = Instant::now();
        let peer: SocketAddr = "10.0.0.1:1111".parse().unwrap();
        let stranger: SocketAddr = "10.9.9.9:1111".parse().unwrap();

        listener.handle_stun(&open_from("alice"), peer, now);
        let outputs = listener.drain_outputs();
        let local = outputs
            .iter()
            .find_map(|out| match out {
                ListenerOutput::SendStun { packet, .. }
                    if packet.class == StunClass::SuccessResponse =>
                {
                    packet.channel_number
                }
                _ => None,
            })
            .expect("accepted channel number");

        let packet = RudpPacket {
            channel_number: local,
            sequence_number: 50,
            gsnr: 0,
            gsnfr: 0,
            flags: Default::default(),
            vector: Vec::new(),
            payload: Bytes::from_static(b"spoof"),
        };
        assert!(listener.handle_packet(&packet.encode(), stranger, now));
        // nothing routed, nothing emitted
        assert!(listener.drain_outputs().is_empty());
    }

    #[test]
    fn listener_shutdown_rejects_new_opens() {
        let mut listener = listener();
        let now = Instant::now();
        listener.shutdown(now);
        assert_eq!(listener.state(), ListenerState::Shutdown);

        let peer: SocketAddr = "10.0.0.1:1111".parse().unwrap();
        assert!(!listener.handle_stun(&open_from("late"), peer, now));
    }
}
