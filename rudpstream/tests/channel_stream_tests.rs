//! ChannelStream reliability invariants: reassembly, selective-ACK
//! driven retransmission, and end-to-end equality over a lossy path.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rudpstream::channel_stream::{ChannelStream, ChannelStreamParams, StreamOutput};
use rudpstream::packet::{sequence_parity, AckRun, RudpFlags, RudpPacket};
use rudpstream::stream::TransportStream;

fn params(local_start: u64, remote_start: u64) -> ChannelStreamParams {
    ChannelStreamParams {
        sending_channel: 0x4001,
        receiving_channel: 0x4002,
        local_sequence_start: local_start,
        remote_sequence_start: remote_start,
        min_rtt: Duration::from_millis(80),
        lifetime: Duration::from_secs(600),
        segment_size: 1200,
    }
}

fn packets(outputs: Vec<StreamOutput>) -> Vec<RudpPacket> {
    outputs
        .into_iter()
        .filter_map(|out| match out {
            StreamOutput::SendPacket(bytes) => Some(RudpPacket::decode(&bytes).unwrap()),
            _ => None,
        })
        .collect()
}

/// XOR parity over an inclusive sequence range.
fn range_parity(from: u64, to: u64) -> bool {
    (from..=to).fold(false, |acc, seq| acc ^ sequence_parity(seq))
}

#[test]
fn out_of_order_delivery_reassembles_one_message() {
    let send = TransportStream::new();
    let receive = TransportStream::new();
    let now = Instant::now();
    let mut stream = ChannelStream::new(params(1, 1), receive.writer(), send.reader(), now);

    let data = |seq: u64, byte: u8, eq: bool| RudpPacket {
        channel_number: 0x4002,
        sequence_number: seq,
        gsnr: 0,
        gsnfr: 0,
        flags: {
            let mut flags = RudpFlags::NONE;
            flags.set(RudpFlags::EQ, eq);
            flags.set(RudpFlags::PG, sequence_parity(0));
            flags
        },
        vector: Vec::new(),
        payload: Bytes::copy_from_slice(&[byte]),
    };

    assert_eq!(stream.gsnfr(), 0);
    stream.handle_packet(&data(3, b'c', true), now);
    stream.handle_packet(&data(1, b'a', false), now);
    stream.handle_packet(&data(2, b'b', false), now);

    let (message, header) = receive.reader().read_buffer().expect("one message");
    assert_eq!(&message[..], b"abc");
    assert!(header.is_none());
    assert!(receive.reader().read_buffer().is_none());
    // next expected advanced 1 -> 4
    assert_eq!(stream.gsnfr(), 3);
    assert_eq!(stream.gsnr(), 3);
}

#[test]
fn third_duplicate_ack_retransmits_the_hole() {
    let send = TransportStream::new();
    let receive = TransportStream::new();
    let mut now = Instant::now();
    let mut stream = ChannelStream::new(params(1, 1), receive.writer(), send.reader(), now);

    let ack = |gsnr: u64, gsnfr: u64, vector: Vec<AckRun>| {
        let mut flags = RudpFlags::NONE;
        flags.set(RudpFlags::XP, range_parity(1, gsnfr));
        flags.set(RudpFlags::PG, sequence_parity(gsnr));
        if !vector.is_empty() {
            let mut vp = false;
            let mut seq = gsnfr + 1;
            for run in &vector {
                for _ in 0..run.length {
                    if run.received {
                        vp ^= sequence_parity(seq);
                    }
                    seq += 1;
                }
            }
            flags.set(RudpFlags::VP, vp);
        }
        RudpPacket {
            channel_number: 0x4002,
            sequence_number: 0,
            gsnr,
            gsnfr,
            flags,
            vector,
            payload: Bytes::new(),
        }
    };

    // phase 1: grow the window past six segments and push gsnfr to 9
    for batch in [(1u64, 2u64), (3, 6), (7, 9)] {
        for _ in batch.0..=batch.1 {
            send.writer().write(Bytes::from_static(b"x"), None);
        }
        stream.notify_send_data(now);
        let sent = packets(stream.drain_outputs());
        assert!(sent.iter().any(|p| p.sequence_number == batch.1));
        now += Duration::from_millis(40);
        stream.handle_packet(&ack(batch.1, batch.1, Vec::new()), now);
        let _ = stream.drain_outputs();
    }

    // phase 2: six segments in flight, sequences 10..=15
    for _ in 0..6 {
        send.writer().write(Bytes::from_static(b"y"), None);
    }
    stream.notify_send_data(now);
    let sent = packets(stream.drain_outputs());
    assert_eq!(
        sent.iter().map(|p| p.sequence_number).collect::<Vec<_>>(),
        vec![10, 11, 12, 13, 14, 15]
    );

    // peer reports 10..13 and 15 received, 14 missing
    let holes = vec![
        AckRun {
            received: true,
            length: 4,
        },
        AckRun {
            received: false,
            length: 1,
        },
        AckRun {
            received: true,
            length: 1,
        },
    ];

    now += Duration::from_millis(10);
    stream.handle_packet(&ack(15, 9, holes.clone()), now);
    assert!(packets(stream.drain_outputs()).is_empty(), "no retransmit yet");
    stream.handle_packet(&ack(15, 9, holes.clone()), now);
    assert!(packets(stream.drain_outputs()).is_empty(), "still waiting");

    stream.handle_packet(&ack(15, 9, holes), now);
    let retransmitted = packets(stream.drain_outputs());
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].sequence_number, 14);
    assert!(retransmitted[0].flags.contains(RudpFlags::PS));
}

#[test]
fn lossy_reordered_path_still_delivers_everything_in_order() {
    let a_send = TransportStream::new();
    let a_receive = TransportStream::new();
    let b_send = TransportStream::new();
    let b_receive = TransportStream::new();

    let mut now = Instant::now();
    let mut a = ChannelStream::new(params(1, 1000), a_receive.writer(), a_send.reader(), now);
    let mut b = {
        let mut p = params(1000, 1);
        p.sending_channel = 0x4002;
        p.receiving_channel = 0x4001;
        ChannelStream::new(p, b_receive.writer(), b_send.reader(), now)
    };

    let mut expected = Vec::new();
    for i in 0..40u32 {
        let message = format!("message-{i}-{}", "payload".repeat((i % 5) as usize + 1));
        expected.push(message.clone());
        a_send.writer().write(Bytes::from(message), None);
    }

    let mut drop_counter = 0u32;
    for _ in 0..400 {
        a.notify_send_data(now);
        for output in a.drain_outputs() {
            if let StreamOutput::SendPacket(bytes) = output {
                drop_counter += 1;
                // drop every fifth a->b packet; retransmission recovers
                if drop_counter % 5 == 0 {
                    continue;
                }
                b.handle_packet(&RudpPacket::decode(&bytes).unwrap(), now);
            }
        }
        for output in b.drain_outputs() {
            if let StreamOutput::SendPacket(bytes) = output {
                a.handle_packet(&RudpPacket::decode(&bytes).unwrap(), now);
            }
        }
        now += Duration::from_millis(60);
        a.on_timer(now);
        b.on_timer(now);
        if b_receive.reader().total_buffers() == expected.len() {
            break;
        }
    }

    let reader = b_receive.reader();
    let mut delivered = Vec::new();
    while let Some((message, _)) = reader.read_buffer() {
        delivered.push(String::from_utf8(message.to_vec()).unwrap());
    }
    assert_eq!(delivered, expected);
}

#[test]
fn shutdown_is_idempotent_and_terminal_once() {
    let send = TransportStream::new();
    let receive = TransportStream::new();
    let now = Instant::now();
    let mut stream = ChannelStream::new(params(1, 1), receive.writer(), send.reader(), now);

    stream.shutdown(now);
    stream.shutdown(now);
    let terminal: Vec<_> = stream
        .drain_outputs()
        .into_iter()
        .filter(|out| {
            matches!(
                out,
                StreamOutput::StateChanged {
                    state: rudpstream::channel_stream::ChannelStreamState::Shutdown,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(terminal.len(), 1);
}
