//! The RUDP sliding-window reliable stream.
//!
//! One instance per direction pair of a channel: application bytes are
//! pulled from the outgoing TransportStream, segmented, sequenced and
//! kept in a send window until the peer's GSNFR or selective-ACK vector
//! releases them; inbound packets are reassembled hole-tolerantly and
//! each EQ-delimited message is delivered to the receive TransportStream
//! as a single buffer.
//!
//! The state machine is synchronous: callers feed packets, timer ticks
//! and stream-readiness edges with an explicit `Instant`, then drain the
//! outputs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::congestion::{CongestionController, TcpLikeWindow};
use crate::error::ErrorCode;
use crate::packet::{
    build_vector, expand_sequence, sequence_parity, vector_received, AckRun, RudpFlags,
    RudpPacket,
};
use crate::rtt::RttEstimator;
use crate::stream::{StreamReader, StreamWriter};

/// Out-of-order ACKs implying a hole before the oldest gap candidate is
/// re-emitted.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Parity-echo mismatches tolerated before the peer is declared broken.
const PARITY_STRIKE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStreamState {
    Ready,
    ShuttingDown,
    Shutdown,
}

/// Which direction(s) a shutdown request closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    None,
    Send,
    Receive,
    Both,
}

impl ShutdownDirection {
    pub fn includes_send(self) -> bool {
        matches!(self, ShutdownDirection::Send | ShutdownDirection::Both)
    }

    pub fn includes_receive(self) -> bool {
        matches!(self, ShutdownDirection::Receive | ShutdownDirection::Both)
    }

    fn merge(self, other: ShutdownDirection) -> ShutdownDirection {
        match (self.includes_send() || other.includes_send(),
               self.includes_receive() || other.includes_receive()) {
            (true, true) => ShutdownDirection::Both,
            (true, false) => ShutdownDirection::Send,
            (false, true) => ShutdownDirection::Receive,
            (false, false) => ShutdownDirection::None,
        }
    }
}

/// Everything a channel stream pushes back up to its channel.
#[derive(Debug, Clone)]
pub enum StreamOutput {
    /// An encoded RUDP packet for the wire.
    SendPacket(Bytes),
    /// The channel must deliver an ACK out of band (STUN); correlated
    /// back through `external_ack_delivered`.
    AckNow { guarantee: bool, request_id: u64 },
    StateChanged {
        state: ChannelStreamState,
        error: Option<(u16, String)>,
    },
}

/// Receive-side accounting a channel copies into STUN ACK frames.
#[derive(Debug, Clone)]
pub struct AckInfo {
    pub gsnr: u64,
    pub gsnfr: u64,
    pub vector: Bytes,
}

/// Construction parameters, agreed during the channel-open handshake.
#[derive(Debug, Clone)]
pub struct ChannelStreamParams {
    /// Channel number stamped on outgoing packets (the peer's local).
    pub sending_channel: u16,
    /// Our local channel number (what the peer stamps), kept for logs.
    pub receiving_channel: u16,
    /// First sequence number we will send.
    pub local_sequence_start: u64,
    /// First sequence number the peer will send.
    pub remote_sequence_start: u64,
    pub min_rtt: Duration,
    pub lifetime: Duration,
    pub segment_size: usize,
}

struct SendEntry {
    data: Bytes,
    eq: bool,
    xmit_count: u32,
    first_sent: Instant,
    last_sent: Instant,
    rto: Duration,
    retransmit_at: Instant,
    flagged_for_resend: bool,
}

struct RecvEntry {
    data: Bytes,
    eq: bool,
}

pub struct ChannelStream {
    state: ChannelStreamState,
    error: Option<(u16, String)>,
    sending_channel: u16,
    receiving_channel: u16,
    segment_size: usize,

    // send side
    next_seq: u64,
    send_buffer: BTreeMap<u64, SendEntry>,
    pending_send: VecDeque<u64>,
    congestion: Box<dyn CongestionController>,
    rtt: RttEstimator,
    dup_ack_count: u32,
    last_gsnfr_seen: u64,
    last_ar_sent: Option<Instant>,
    last_packet_sent: Option<Instant>,
    send_resumed_after_idle: bool,
    // parity verification of peer ack echoes over our own sequences
    verify_acked_upto: u64,
    verify_acked_parity: bool,
    parity_strikes: u32,

    // receive side
    recv_next_expected: u64,
    gsnr: u64,
    recv_buffer: BTreeMap<u64, RecvEntry>,
    assembly: BytesMut,
    xp_parity: bool,
    dup_received: bool,
    ack_required: bool,
    ar_deadline: Option<Instant>,

    lifetime: Duration,
    lifetime_deadline: Instant,
    shutdown_direction: ShutdownDirection,

    receive_writer: StreamWriter,
    send_reader: StreamReader,

    outputs: VecDeque<StreamOutput>,
    next_ack_request_id: u64,
    outstanding_external_acks: HashSet<u64>,
}

impl ChannelStream {
    pub fn new(
        params: ChannelStreamParams,
        receive_writer: StreamWriter,
        send_reader: StreamReader,
        now: Instant,
    ) -> Self {
        let initial_expected = params.remote_sequence_start;
        Self {
            state: ChannelStreamState::Ready,
            error: None,
            sending_channel: params.sending_channel,
            receiving_channel: params.receiving_channel,
            segment_size: params.segment_size,
            next_seq: params.local_sequence_start,
            send_buffer: BTreeMap::new(),
            pending_send: VecDeque::new(),
            congestion: Box::new(TcpLikeWindow::new()),
            rtt: RttEstimator::new(params.min_rtt),
            dup_ack_count: 0,
            last_gsnfr_seen: params.local_sequence_start.saturating_sub(1),
            last_ar_sent: None,
            last_packet_sent: None,
            send_resumed_after_idle: false,
            verify_acked_upto: params.local_sequence_start.saturating_sub(1),
            verify_acked_parity: false,
            parity_strikes: 0,
            recv_next_expected: initial_expected,
            gsnr: initial_expected.saturating_sub(1),
            recv_buffer: BTreeMap::new(),
            assembly: BytesMut::new(),
            xp_parity: false,
            dup_received: false,
            ack_required: false,
            ar_deadline: None,
            lifetime: params.lifetime,
            lifetime_deadline: now + params.lifetime,
            shutdown_direction: ShutdownDirection::None,
            receive_writer,
            send_reader,
            outputs: VecDeque::new(),
            next_ack_request_id: 1,
            outstanding_external_acks: HashSet::new(),
        }
    }

    pub fn state(&self) -> ChannelStreamState {
        self.state
    }

    pub fn last_error(&self) -> Option<&(u16, String)> {
        self.error.as_ref()
    }

    pub fn drain_outputs(&mut self) -> Vec<StreamOutput> {
        self.outputs.drain(..).collect()
    }

    /// Greatest sequence received, holes included.
    pub fn gsnr(&self) -> u64 {
        self.gsnr
    }

    /// End of the fully-received prefix.
    pub fn gsnfr(&self) -> u64 {
        self.recv_next_expected.saturating_sub(1)
    }

    /// Whether the stream put a packet on the wire since `since`.
    pub fn sent_packet_since(&self, since: Instant) -> bool {
        self.last_packet_sent.is_some_and(|t| t >= since)
    }

    /// Receive-side accounting for a STUN-framed ACK.
    pub fn ack_info(&self) -> AckInfo {
        let (gsnr, gsnfr, runs, _, _, _) = self.ack_fields();
        let mut vector = BytesMut::with_capacity(runs.len());
        for run in &runs {
            let mut b = run.length & 0x7f;
            if run.received {
                b |= 0x80;
            }
            vector.extend_from_slice(&[b]);
        }
        AckInfo {
            gsnr,
            gsnfr,
            vector: vector.freeze(),
        }
    }

    /// The earliest deadline the owner should tick `on_timer` for.
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == ChannelStreamState::Shutdown {
            return None;
        }
        let mut deadline = Some(self.lifetime_deadline);
        if let Some(ar) = self.ar_deadline {
            deadline = Some(deadline.map_or(ar, |d| d.min(ar)));
        }
        for entry in self.send_buffer.values() {
            if entry.xmit_count > 0 {
                deadline = Some(deadline.map_or(entry.retransmit_at, |d| {
                    d.min(entry.retransmit_at)
                }));
            }
        }
        deadline
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// The outgoing TransportStream has data (or the substrate became
    /// writable): segment, sequence and emit what the window allows.
    pub fn notify_send_data(&mut self, now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        if !self.shutdown_direction.includes_send() {
            self.ingest_app_data(now);
        }
        self.emit_ready(now);
    }

    fn ingest_app_data(&mut self, now: Instant) {
        loop {
            let size = self.send_reader.next_read_size();
            if size == 0 {
                if self.send_reader.total_buffers() == 0 {
                    break;
                }
                // zero-sized record becomes an empty end-of-message segment
                let mut empty: [u8; 0] = [];
                let _ = self.send_reader.read(&mut empty);
                self.enqueue_segment(Bytes::new(), true, now);
                continue;
            }

            let mut remaining = size;
            while remaining > 0 {
                let want = remaining.min(self.segment_size);
                let mut buf = vec![0u8; want];
                let (count, _) = self.send_reader.read(&mut buf);
                if count == 0 {
                    return;
                }
                buf.truncate(count);
                remaining -= count;
                // the segment that exhausts an application buffer ends
                // the message quantum
                self.enqueue_segment(Bytes::from(buf), remaining == 0, now);
            }
        }
    }

    fn enqueue_segment(&mut self, data: Bytes, eq: bool, now: Instant) {
        if self.send_buffer.is_empty() && self.pending_send.is_empty() {
            if let Some(last) = self.last_packet_sent {
                if now.duration_since(last) > self.rtt.srtt() {
                    self.send_resumed_after_idle = true;
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send_buffer.insert(
            seq,
            SendEntry {
                data,
                eq,
                xmit_count: 0,
                first_sent: now,
                last_sent: now,
                rto: Duration::ZERO,
                retransmit_at: now,
                flagged_for_resend: false,
            },
        );
        self.pending_send.push_back(seq);
    }

    fn emit_ready(&mut self, now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        // gap-flagged segments bypass the window: fast retransmit is
        // immediate
        let flagged: Vec<u64> = self
            .send_buffer
            .iter()
            .filter(|(_, entry)| entry.flagged_for_resend)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in flagged {
            self.transmit(seq, now, true);
        }

        while self.congestion.can_send() {
            let Some(seq) = self.pending_send.pop_front() else {
                break;
            };
            self.transmit(seq, now, false);
        }
    }

    /// Receive-side fields every outgoing packet carries:
    /// (gsnr, gsnfr, vector, pg, xp, vp).
    fn ack_fields(&self) -> (u64, u64, Vec<AckRun>, bool, bool, bool) {
        let gsnfr = self.gsnfr();
        if self.gsnr <= gsnfr {
            return (gsnfr, gsnfr, Vec::new(), sequence_parity(gsnfr), self.xp_parity, false);
        }
        let (runs, covered) =
            build_vector(gsnfr, self.gsnr, |seq| self.recv_buffer.contains_key(&seq));
        let vp = vector_received(gsnfr, &runs)
            .into_iter()
            .fold(false, |acc, seq| acc ^ sequence_parity(seq));
        (covered, gsnfr, runs, sequence_parity(covered), self.xp_parity, vp)
    }

    fn compute_ar(&mut self, now: Instant) -> bool {
        let idle_resume = std::mem::take(&mut self.send_resumed_after_idle);
        let ar = idle_resume
            || match self.last_ar_sent {
                None => true,
                Some(t) => now.duration_since(t) >= self.rtt.srtt() / 2,
            };
        if ar {
            self.last_ar_sent = Some(now);
        }
        ar
    }

    fn transmit(&mut self, seq: u64, now: Instant, after_gap: bool) {
        let base_rto = self.rtt.rto();
        let (gsnr, gsnfr, vector, pg, xp, vp) = self.ack_fields();
        let ar = self.compute_ar(now);
        let dp = std::mem::take(&mut self.dup_received);

        let (data, eq, first) = {
            let Some(entry) = self.send_buffer.get_mut(&seq) else {
                return;
            };
            let first = entry.xmit_count == 0;
            if first {
                entry.first_sent = now;
                entry.rto = base_rto;
            }
            entry.xmit_count += 1;
            entry.last_sent = now;
            entry.retransmit_at = now + entry.rto;
            entry.flagged_for_resend = false;
            (entry.data.clone(), entry.eq, first)
        };

        if first {
            self.congestion.on_packet_sent(1);
        }

        let mut flags = RudpFlags::NONE;
        flags.set(RudpFlags::EQ, eq);
        flags.set(RudpFlags::AR, ar);
        flags.set(RudpFlags::DP, dp);
        flags.set(RudpFlags::PS, after_gap);
        flags.set(RudpFlags::PG, pg);
        flags.set(RudpFlags::XP, xp);
        flags.set(RudpFlags::VP, vp);

        let packet = RudpPacket {
            channel_number: self.sending_channel,
            sequence_number: seq,
            gsnr,
            gsnfr,
            flags,
            vector,
            payload: data,
        };
        trace!(
            channel = self.receiving_channel,
            seq,
            retransmit = !first,
            "emitting segment"
        );
        self.last_packet_sent = Some(now);
        // carrying the ack state satisfies any pending AR
        self.ack_required = false;
        self.ar_deadline = None;
        self.outputs.push_back(StreamOutput::SendPacket(packet.encode()));
    }

    /// Emit a data-less packet that only carries ACK state.
    fn emit_ack(&mut self, now: Instant) {
        let (gsnr, gsnfr, vector, pg, xp, vp) = self.ack_fields();
        let dp = std::mem::take(&mut self.dup_received);
        let mut flags = RudpFlags::NONE;
        flags.set(RudpFlags::DP, dp);
        flags.set(RudpFlags::PG, pg);
        flags.set(RudpFlags::XP, xp);
        flags.set(RudpFlags::VP, vp);

        let packet = RudpPacket {
            channel_number: self.sending_channel,
            // a data-less packet re-uses the last assigned sequence so
            // the peer's accounting treats it as pure bookkeeping
            sequence_number: self.next_seq.saturating_sub(1),
            gsnr,
            gsnfr,
            flags,
            vector,
            payload: Bytes::new(),
        };
        self.last_packet_sent = Some(now);
        self.ack_required = false;
        self.ar_deadline = None;
        self.outputs.push_back(StreamOutput::SendPacket(packet.encode()));
    }

    /// Ask the channel to deliver the current ACK via the STUN control
    /// plane. Returns the correlation token.
    pub fn send_external_ack_now(&mut self, guarantee: bool) -> u64 {
        let request_id = self.next_ack_request_id;
        self.next_ack_request_id += 1;
        self.outstanding_external_acks.insert(request_id);
        self.outputs.push_back(StreamOutput::AckNow {
            guarantee,
            request_id,
        });
        request_id
    }

    /// The channel confirmed an out-of-band ACK reached the wire (or
    /// the peer, for guaranteed deliveries).
    pub fn external_ack_delivered(&mut self, request_id: u64) {
        if self.outstanding_external_acks.remove(&request_id) {
            self.ack_required = false;
            self.ar_deadline = None;
        }
    }

    // ------------------------------------------------------------------
    // receive path + peer feedback
    // ------------------------------------------------------------------

    /// Feed one inbound RUDP packet.
    pub fn handle_packet(&mut self, packet: &RudpPacket, now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        self.lifetime_deadline = now + self.lifetime;

        let peer_gsnr = expand_sequence(packet.gsnr, self.next_seq);
        let peer_gsnfr = expand_sequence(packet.gsnfr, self.next_seq);
        if peer_gsnfr > peer_gsnr {
            self.fail(
                ErrorCode::PreconditionFailed,
                "peer reported gsnfr above gsnr",
            );
            return;
        }

        self.process_peer_ack(peer_gsnr, peer_gsnfr, &packet.vector, Some(packet.flags), now);
        if self.state == ChannelStreamState::Shutdown {
            return;
        }

        let is_data = !packet.payload.is_empty() || packet.flags.contains(RudpFlags::EQ);
        if is_data && !self.shutdown_direction.includes_receive() {
            let seq = expand_sequence(
                packet.sequence_number,
                self.gsnr.max(self.recv_next_expected),
            );
            if seq < self.recv_next_expected || self.recv_buffer.contains_key(&seq) {
                trace!(seq, "duplicate segment");
                self.dup_received = true;
            } else {
                self.recv_buffer.insert(
                    seq,
                    RecvEntry {
                        data: packet.payload.clone(),
                        eq: packet.flags.contains(RudpFlags::EQ),
                    },
                );
                if seq > self.gsnr {
                    self.gsnr = seq;
                }
                self.deliver_contiguous();
            }
        }

        if packet.flags.contains(RudpFlags::AR) {
            self.ack_required = true;
            let deadline = now + self.rtt.min_rtt() / 4;
            self.ar_deadline = Some(self.ar_deadline.map_or(deadline, |d| d.min(deadline)));
            if self.state == ChannelStreamState::ShuttingDown
                && self.send_buffer.is_empty()
                && self.pending_send.is_empty()
            {
                // nothing left to piggyback on: the control plane must
                // carry the ack, reliably
                self.send_external_ack_now(true);
            }
        }

        self.emit_ready(now);
        self.check_drain();
    }

    /// Feed ACK state that arrived through the STUN control plane
    /// instead of an RUDP header.
    pub fn handle_external_ack(&mut self, gsnr: u64, gsnfr: u64, vector: &[AckRun], now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        self.lifetime_deadline = now + self.lifetime;
        let peer_gsnr = expand_sequence(gsnr, self.next_seq);
        let peer_gsnfr = expand_sequence(gsnfr, self.next_seq);
        if peer_gsnfr > peer_gsnr {
            self.fail(
                ErrorCode::PreconditionFailed,
                "peer reported gsnfr above gsnr",
            );
            return;
        }
        self.process_peer_ack(peer_gsnr, peer_gsnfr, vector, None, now);
        self.emit_ready(now);
        self.check_drain();
    }

    fn process_peer_ack(
        &mut self,
        peer_gsnr: u64,
        peer_gsnfr: u64,
        vector: &[AckRun],
        flags: Option<RudpFlags>,
        now: Instant,
    ) {
        if peer_gsnfr >= self.next_seq || peer_gsnr >= self.next_seq {
            self.fail(
                ErrorCode::PreconditionFailed,
                "peer acknowledged a sequence that was never sent",
            );
            return;
        }

        // release the fully-received prefix
        let released: Vec<u64> = self
            .send_buffer
            .range(..=peer_gsnfr)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in released {
            self.release_entry(seq, now);
        }

        // release everything the vector marks received
        let marked: Vec<u64> = vector_received(peer_gsnfr, vector);
        for &seq in &marked {
            if seq >= self.next_seq {
                self.fail(
                    ErrorCode::PreconditionFailed,
                    "ack vector marks a sequence that was never sent",
                );
                return;
            }
            self.release_entry(seq, now);
        }

        // verify the parity echoes (RUDP headers only; STUN acks carry
        // no flag bits)
        if peer_gsnfr > self.verify_acked_upto {
            for seq in (self.verify_acked_upto + 1)..=peer_gsnfr {
                self.verify_acked_parity ^= sequence_parity(seq);
            }
            self.verify_acked_upto = peer_gsnfr;
        }
        if let Some(flags) = flags {
            let mut mismatch = flags.contains(RudpFlags::XP) != self.verify_acked_parity
                || flags.contains(RudpFlags::PG) != sequence_parity(peer_gsnr);
            if !vector.is_empty() {
                let vp = marked
                    .iter()
                    .fold(false, |acc, &seq| acc ^ sequence_parity(seq));
                mismatch |= flags.contains(RudpFlags::VP) != vp;
            }
            if mismatch {
                self.parity_strikes += 1;
                debug!(strikes = self.parity_strikes, "parity echo mismatch");
                if self.parity_strikes >= PARITY_STRIKE_LIMIT {
                    self.fail(ErrorCode::PreconditionFailed, "parity echoes diverged");
                    return;
                }
            }
        }

        // duplicate-ack accounting: a repeated gsnfr below gsnr implies
        // a hole on the peer's side
        if peer_gsnr > peer_gsnfr && peer_gsnfr == self.last_gsnfr_seen {
            self.dup_ack_count += 1;
            if self.dup_ack_count >= DUP_ACK_THRESHOLD {
                self.dup_ack_count = 0;
                let marked_set: HashSet<u64> = marked.into_iter().collect();
                let candidate = self
                    .send_buffer
                    .range(..=peer_gsnr)
                    .find(|(seq, entry)| entry.xmit_count > 0 && !marked_set.contains(seq))
                    .map(|(&seq, _)| seq);
                if let Some(seq) = candidate {
                    debug!(seq, "fast retransmit");
                    self.congestion.on_loss();
                    if let Some(entry) = self.send_buffer.get_mut(&seq) {
                        entry.flagged_for_resend = true;
                    }
                    self.transmit(seq, now, true);
                }
            }
        } else if peer_gsnfr > self.last_gsnfr_seen {
            self.dup_ack_count = 0;
        }
        self.last_gsnfr_seen = self.last_gsnfr_seen.max(peer_gsnfr);
    }

    fn release_entry(&mut self, seq: u64, now: Instant) {
        if let Some(entry) = self.send_buffer.remove(&seq) {
            if entry.xmit_count > 0 {
                self.congestion.on_ack(1);
                if entry.xmit_count == 1 {
                    // Karn: only first transmissions produce samples
                    self.rtt.update(now.duration_since(entry.first_sent));
                }
            }
            self.pending_send.retain(|&s| s != seq);
        }
    }

    fn deliver_contiguous(&mut self) {
        while let Some(entry) = self.recv_buffer.remove(&self.recv_next_expected) {
            self.xp_parity ^= sequence_parity(self.recv_next_expected);
            self.assembly.extend_from_slice(&entry.data);
            if entry.eq {
                let message = self.assembly.split().freeze();
                self.receive_writer.write(message, None);
            }
            self.recv_next_expected += 1;
        }
    }

    // ------------------------------------------------------------------
    // timers and shutdown
    // ------------------------------------------------------------------

    pub fn on_timer(&mut self, now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }

        if now >= self.lifetime_deadline {
            self.fail(ErrorCode::RequestTimeout, "no packets within lifetime");
            return;
        }

        let expired: Vec<u64> = self
            .send_buffer
            .iter()
            .filter(|(_, entry)| entry.xmit_count > 0 && now >= entry.retransmit_at)
            .map(|(&seq, _)| seq)
            .collect();
        if !expired.is_empty() {
            self.congestion.on_loss();
            let cap = self.rtt.rto_cap();
            for seq in expired {
                if let Some(entry) = self.send_buffer.get_mut(&seq) {
                    entry.rto = (entry.rto * 2).min(cap);
                }
                self.transmit(seq, now, false);
            }
        }

        if self.ack_required && self.ar_deadline.is_some_and(|d| now >= d) {
            self.emit_ack(now);
        }

        self.emit_ready(now);
        self.check_drain();
    }

    /// Close one or both directions, draining buffered data first.
    pub fn shutdown_direction(&mut self, direction: ShutdownDirection, _now: Instant) {
        let merged = self.shutdown_direction.merge(direction);
        if merged == self.shutdown_direction {
            return;
        }
        self.shutdown_direction = merged;
        if merged.includes_receive() {
            // deliver the reassembled contiguous prefix, discard the rest
            self.deliver_contiguous();
            self.recv_buffer.clear();
        }
        self.check_drain();
    }

    /// Full graceful shutdown: drain the send window, then go terminal.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            ChannelStreamState::Ready => {
                self.set_state(ChannelStreamState::ShuttingDown);
                self.shutdown_direction(ShutdownDirection::Both, now);
            }
            ChannelStreamState::ShuttingDown | ChannelStreamState::Shutdown => {}
        }
        self.check_drain();
    }

    /// The peer closed cleanly: drain and finish without an error.
    pub fn close_from_peer(&mut self, now: Instant) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        self.set_state(ChannelStreamState::ShuttingDown);
        self.shutdown_direction(ShutdownDirection::Both, now);
        self.check_drain();
    }

    /// Immediate teardown; idempotent.
    pub fn cancel(&mut self) {
        if self.state == ChannelStreamState::Shutdown {
            return;
        }
        self.send_buffer.clear();
        self.pending_send.clear();
        self.recv_buffer.clear();
        self.set_state(ChannelStreamState::Shutdown);
    }

    fn check_drain(&mut self) {
        if self.state == ChannelStreamState::ShuttingDown
            && self.shutdown_direction.includes_send()
            && self.send_buffer.is_empty()
            && self.pending_send.is_empty()
        {
            self.set_state(ChannelStreamState::Shutdown);
        }
    }

    fn set_state(&mut self, state: ChannelStreamState) {
        if self.state == state {
            return;
        }
        debug!(channel = self.receiving_channel, ?state, "stream state");
        self.state = state;
        self.outputs.push_back(StreamOutput::StateChanged {
            state,
            error: self.error.clone(),
        });
    }

    fn fail(&mut self, code: ErrorCode, reason: &str) {
        if self.state == ChannelStreamState::Shutdown {
            warn!(code = code.as_u16(), reason, "error after terminal state");
            return;
        }
        self.error = Some((code.as_u16(), reason.to_string()));
        self.send_buffer.clear();
        self.pending_send.clear();
        self.recv_buffer.clear();
        self.set_state(ChannelStreamState::Shutdown);
    }
}
