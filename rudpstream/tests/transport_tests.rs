//! Transport-level behaviour: channel-number probing, accept flows,
//! fatal-silent timeouts, and a full two-transport conversation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use rudpstream::channel::ChannelState;
use rudpstream::config::RudpConfig;
use rudpstream::stream::TransportStream;
use rudpstream::stun::{
    CongestionAlgorithm, CryptoProvider, StunClass, StunMethod, StunPacket,
};
use rudpstream::transport::{
    SubstrateState, Transport, TransportOutput, TransportParams,
};

struct TestCrypto {
    counter: AtomicU64,
}

impl TestCrypto {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl CryptoProvider for TestCrypto {
    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 20];
        for (i, b) in key.iter().chain(data.iter()).enumerate() {
            out[i % 20] = out[i % 20].wrapping_add(*b).rotate_left(3);
        }
        out
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        // unique per call so transaction ids never collide
        let seed = self.counter.fetch_add(1, Ordering::Relaxed);
        (0..len).map(|i| (seed as u8).wrapping_add(i as u8)).collect()
    }
}

/// RNG yielding a scripted prefix, then counting upward.
struct ScriptedRng {
    values: Vec<u64>,
    at: usize,
}

impl ScriptedRng {
    fn new(values: Vec<u64>) -> Self {
        Self { values, at: 0 }
    }
}

impl ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        let value = self
            .values
            .get(self.at)
            .copied()
            .unwrap_or(0x5000 + self.at as u64);
        self.at += 1;
        value
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let value = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&value[..chunk.len()]);
        }
    }
}

impl rand::rand_core::TryRng for ScriptedRng {
    type Error = std::convert::Infallible;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        Ok(self.next_u32())
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        Ok(self.next_u64())
    }

    fn try_fill_bytes(&mut self, dst: &mut [u8]) -> Result<(), Self::Error> {
        self.fill_bytes(dst);
        Ok(())
    }
}

fn transport(
    local_frag: &str,
    remote_frag: &str,
    local_password: &str,
    remote_password: &str,
    rng: Box<dyn Rng + Send>,
) -> Transport {
    Transport::new(TransportParams {
        local_frag: local_frag.into(),
        local_password: local_password.into(),
        remote_frag: remote_frag.into(),
        remote_password: remote_password.into(),
        remote_addr: "192.0.2.10:9000".parse::<SocketAddr>().unwrap(),
        config: RudpConfig::default(),
        crypto: Arc::new(TestCrypto::new()),
        rng,
    })
}

fn signed_open(crypto: &dyn CryptoProvider, target_frag: &str, password: &str) -> StunPacket {
    let mut open = StunPacket::new(
        StunClass::Request,
        StunMethod::ReliableChannelOpen,
        [7; 12],
    );
    open.username = Some(format!("{target_frag}:peerfrag"));
    open.channel_number = Some(0x4abc);
    open.next_sequence_number = Some(300);
    open.local_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
    open.remote_congestion_control = vec![CongestionAlgorithm::TcpLikeWindow];
    open.apply_integrity(crypto, password);
    open
}

#[test]
fn accept_collision_probes_until_free_number() {
    // occupy 0x4001 and 0x4002 via local opens, then let the probe for
    // the incoming open draw 0x4001, 0x4002, 0x4005
    let rng = ScriptedRng::new(vec![
        0x4001, 11, // first open_channel: number + sequence start
        0x4002, 22, // second open_channel
        0x4001, 0x4002, 0x4005, 33, // accept probe draws + sequence start
    ]);
    let mut transport = transport("localfrag", "remotefrag", "lp", "rp", Box::new(rng));
    let now = Instant::now();
    transport.on_substrate_state(SubstrateState::Completed, now);

    let r1 = TransportStream::new();
    let s1 = TransportStream::new();
    assert_eq!(
        transport.open_channel(None, &r1, &s1, now).unwrap(),
        0x4001
    );
    let r2 = TransportStream::new();
    let s2 = TransportStream::new();
    assert_eq!(
        transport.open_channel(None, &r2, &s2, now).unwrap(),
        0x4002
    );
    let _ = transport.drain_outputs();

    let crypto = TestCrypto::new();
    let open = signed_open(&crypto, "localfrag", "lp");
    assert!(transport.handle_stun(&open, "localfrag", "remotefrag", now));

    let response = transport
        .drain_outputs()
        .into_iter()
        .find_map(|out| match out {
            TransportOutput::SendStun { packet, .. }
                if packet.class == StunClass::SuccessResponse =>
            {
                Some(packet)
            }
            _ => None,
        })
        .expect("accept response");
    assert_eq!(response.channel_number, Some(0x4005));
}

#[test]
fn exhausted_probe_answers_insufficient_capacity() {
    // every draw collides with the already-open 0x4001
    let rng = ScriptedRng::new(vec![
        0x4001, 11, // the occupying open
        0x4001, 0x4001, 0x4001, 0x4001, 0x4001, // five failed probes
    ]);
    let mut transport = transport("localfrag", "remotefrag", "lp", "rp", Box::new(rng));
    let now = Instant::now();
    transport.on_substrate_state(SubstrateState::Completed, now);

    let r = TransportStream::new();
    let s = TransportStream::new();
    transport.open_channel(None, &r, &s, now).unwrap();
    let _ = transport.drain_outputs();

    let crypto = TestCrypto::new();
    let open = signed_open(&crypto, "localfrag", "lp");
    transport.handle_stun(&open, "localfrag", "remotefrag", now);

    let response = transport
        .drain_outputs()
        .into_iter()
        .find_map(|out| match out {
            TransportOutput::SendStun { packet, .. } if packet.is_error() => Some(packet),
            _ => None,
        })
        .expect("error response");
    assert_eq!(response.error_code, Some(508));
    assert_eq!(transport.channel_count(), 1);
}

#[test]
fn open_request_timeout_closes_silently() {
    let mut transport = transport(
        "localfrag",
        "remotefrag",
        "lp",
        "rp",
        Box::new(ScriptedRng::new(vec![0x4001, 11])),
    );
    let now = Instant::now();
    transport.on_substrate_state(SubstrateState::Completed, now);

    let r = TransportStream::new();
    let s = TransportStream::new();
    let local = transport.open_channel(None, &r, &s, now).unwrap();

    let request_id = transport
        .drain_outputs()
        .into_iter()
        .find_map(|out| match out {
            TransportOutput::IssueStunRequest { id, .. } => Some(id),
            _ => None,
        })
        .expect("open request issued");

    transport.on_stun_request_timeout(request_id, now);
    let outputs = transport.drain_outputs();

    let terminal = outputs
        .iter()
        .find_map(|out| match out {
            TransportOutput::ChannelStateChanged {
                local_channel,
                state: ChannelState::Shutdown,
                error,
            } if *local_channel == local => Some(error.clone()),
            _ => None,
        })
        .expect("terminal channel notification");
    assert_eq!(terminal.unwrap().0, 408);

    // fatal-silent: no goodbye of any kind may have been emitted
    for output in &outputs {
        match output {
            TransportOutput::IssueStunRequest { packet, .. }
            | TransportOutput::SendStun { packet, .. } => {
                assert_ne!(packet.method, StunMethod::ReliableChannelClose);
            }
            _ => {}
        }
    }
    assert_eq!(transport.channel_count(), 0);
}

/// Shuttle outputs between two transports until both go quiet,
/// emulating the substrate + requester plumbing.
fn pump(
    a: &mut Transport,
    b: &mut Transport,
    requests: &mut HashMap<[u8; 12], (bool, u64)>,
    now: Instant,
) {
    for _ in 0..32 {
        let mut activity = false;
        for side in [true, false] {
            let outputs = if side {
                a.drain_outputs()
            } else {
                b.drain_outputs()
            };
            for output in outputs {
                activity = true;
                match output {
                    TransportOutput::SendPacket { packet, .. } => {
                        let peer = if side { &mut *b } else { &mut *a };
                        peer.handle_packet(&packet, now);
                    }
                    TransportOutput::IssueStunRequest { id, packet, .. } => {
                        requests.insert(packet.transaction_id, (side, id));
                        let (peer, frag) = if side {
                            (&mut *b, "bobfrag")
                        } else {
                            (&mut *a, "alicefrag")
                        };
                        peer.handle_stun(&packet, frag, "ignored", now);
                    }
                    TransportOutput::SendStun { packet, .. } => {
                        if matches!(
                            packet.class,
                            StunClass::SuccessResponse | StunClass::ErrorResponse
                        ) {
                            if let Some((from_a, id)) = requests.remove(&packet.transaction_id)
                            {
                                let requester = if from_a { &mut *a } else { &mut *b };
                                requester.on_stun_response(id, &packet, now);
                            }
                        } else {
                            let (peer, frag) = if side {
                                (&mut *b, "bobfrag")
                            } else {
                                (&mut *a, "alicefrag")
                            };
                            peer.handle_stun(&packet, frag, "ignored", now);
                        }
                    }
                    _ => {}
                }
            }
        }
        if !activity {
            break;
        }
    }
}

#[test]
fn two_transports_open_accept_and_exchange_data() {
    let mut alice = transport(
        "alicefrag",
        "bobfrag",
        "alicepass",
        "bobpass",
        Box::new(ScriptedRng::new(vec![])),
    );
    let mut bob = transport(
        "bobfrag",
        "alicefrag",
        "bobpass",
        "alicepass",
        Box::new(ScriptedRng::new(vec![])),
    );
    let now = Instant::now();
    alice.on_substrate_state(SubstrateState::Completed, now);
    bob.on_substrate_state(SubstrateState::Nominated, now);

    let alice_receive = TransportStream::new();
    let alice_send = TransportStream::new();
    let local = alice
        .open_channel(Some("caller".into()), &alice_receive, &alice_send, now)
        .unwrap();

    let mut requests = HashMap::new();
    pump(&mut alice, &mut bob, &mut requests, now);
    assert_eq!(alice.channel_state(local), Some(ChannelState::Connected));

    let bob_receive = TransportStream::new();
    let bob_send = TransportStream::new();
    let accepted = bob
        .accept_channel(&bob_receive, &bob_send, now)
        .expect("bob sees the channel");
    assert_eq!(bob.channel_state(accepted), Some(ChannelState::Connected));

    // alice -> bob payload
    alice_send
        .writer()
        .write(Bytes::from_static(b"hello bob"), None);
    alice.notify_write_ready(now);
    pump(&mut alice, &mut bob, &mut requests, now);

    let (message, _) = bob_receive.reader().read_buffer().expect("delivery");
    assert_eq!(&message[..], b"hello bob");

    // bob -> alice reply
    bob_send
        .writer()
        .write(Bytes::from_static(b"hello alice"), None);
    bob.notify_write_ready(now);
    pump(&mut alice, &mut bob, &mut requests, now);

    let (reply, _) = alice_receive.reader().read_buffer().expect("reply");
    assert_eq!(&reply[..], b"hello alice");
}
