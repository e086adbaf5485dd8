//! Default STUN requester engine.
//!
//! Owns retransmission with exponential backoff for outstanding STUN
//! requests: a registered request is (re)emitted by `poll_expired` until
//! a response correlates by its id or the attempt budget runs out, at
//! which point the request is reported timed out. The engine drives
//! nothing itself; a driver sends the returned packets and feeds the
//! clock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::stun::{RequesterId, StunPacket};

/// First retransmit interval (RFC 5389 RTO).
const INITIAL_RTO: Duration = Duration::from_millis(500);
/// Total transmissions before a request is declared timed out.
const MAX_ATTEMPTS: u32 = 7;

#[derive(Debug, Clone)]
struct RequestEntry {
    id: RequesterId,
    send_at: Instant,
    rto: Duration,
    attempts: u32,
}

// Min-heap on deadline: reverse the max-heap ordering.
impl PartialEq for RequestEntry {
    fn eq(&self, other: &Self) -> bool {
        self.send_at == other.send_at
    }
}

impl Eq for RequestEntry {}

impl PartialOrd for RequestEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.send_at.cmp(&self.send_at)
    }
}

/// A request transmission the driver must put on the wire.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub id: RequesterId,
    pub dest: SocketAddr,
    pub packet: StunPacket,
}

pub struct StunRequesterEngine {
    heap: BinaryHeap<RequestEntry>,
    pending: HashMap<RequesterId, (SocketAddr, StunPacket)>,
}

impl StunRequesterEngine {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Register a request for transmission. The first send happens on
    /// the next `poll_expired` call.
    pub fn register(&mut self, id: RequesterId, dest: SocketAddr, packet: StunPacket, now: Instant) {
        self.pending.insert(id, (dest, packet));
        self.heap.push(RequestEntry {
            id,
            send_at: now,
            rto: INITIAL_RTO,
            attempts: 0,
        });
    }

    /// Correlate a response. Returns `true` if the id was outstanding.
    pub fn on_response(&mut self, id: RequesterId) -> bool {
        self.pending.remove(&id).is_some()
        // the heap entry is skipped lazily by poll_expired
    }

    /// Abandon a request without a timeout report.
    pub fn cancel(&mut self, id: RequesterId) {
        self.pending.remove(&id);
    }

    /// Emit due transmissions and collect requests whose attempt budget
    /// is exhausted.
    pub fn poll_expired(&mut self, now: Instant) -> (Vec<SendRequest>, Vec<RequesterId>) {
        let mut to_send = Vec::new();
        let mut timed_out = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.send_at > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");

            let Some((dest, packet)) = self.pending.get(&entry.id) else {
                continue; // answered or cancelled
            };

            if entry.attempts >= MAX_ATTEMPTS {
                self.pending.remove(&entry.id);
                timed_out.push(entry.id);
                continue;
            }

            to_send.push(SendRequest {
                id: entry.id,
                dest: *dest,
                packet: packet.clone(),
            });

            let next_rto = entry.rto * 2;
            self.heap.push(RequestEntry {
                id: entry.id,
                send_at: now + entry.rto,
                rto: next_rto,
                attempts: entry.attempts + 1,
            });
        }

        (to_send, timed_out)
    }

    /// Find the outstanding request a response answers, by transaction
    /// id.
    pub fn match_response(&self, response: &StunPacket) -> Option<RequesterId> {
        self.pending
            .iter()
            .find(|(_, (_, request))| request.transaction_id == response.transaction_id)
            .map(|(&id, _)| id)
    }

    /// Earliest deadline the driver should wake for.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|entry| self.pending.contains_key(&entry.id))
            .map(|entry| entry.send_at)
            .min()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Default for StunRequesterEngine {
    fn default() -> Self {
        Self::new()
    }
}
