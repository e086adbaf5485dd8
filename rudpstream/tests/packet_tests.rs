//! RUDP wire-format round trips.

use bytes::Bytes;
use rudpstream::packet::{
    build_vector, decode_vector_bytes, expand_sequence, vector_received, AckRun, RudpFlags,
    RudpPacket, MAX_VECTOR_BYTES, SEQUENCE_MASK,
};

fn round_trip(packet: &RudpPacket) {
    let wire = packet.encode();
    assert_eq!(wire.len(), packet.encoded_len());
    let decoded = RudpPacket::decode(&wire).unwrap();
    assert_eq!(&decoded, packet);
}

#[test]
fn every_flag_and_field_survives_the_wire() {
    for flags in [0x00u8, 0x01, 0x08, 0x0c, 0xff] {
        let packet = RudpPacket {
            channel_number: 0x7fff,
            sequence_number: SEQUENCE_MASK,
            gsnr: 0x1234_5678_9abc,
            gsnfr: 0x1234_5678_9ab0,
            flags: RudpFlags(flags),
            vector: vec![
                AckRun {
                    received: true,
                    length: 0x7f,
                },
                AckRun {
                    received: false,
                    length: 1,
                },
            ],
            payload: Bytes::from_static(b"\x00\x01\x02payload\xff"),
        };
        round_trip(&packet);
    }
}

#[test]
fn empty_payload_and_empty_vector_round_trip() {
    let packet = RudpPacket {
        channel_number: 0x4000,
        sequence_number: 0,
        gsnr: 0,
        gsnfr: 0,
        flags: RudpFlags::NONE,
        vector: Vec::new(),
        payload: Bytes::new(),
    };
    round_trip(&packet);
}

#[test]
fn vector_bytes_round_trip_through_stun_form() {
    let runs = vec![
        AckRun {
            received: true,
            length: 3,
        },
        AckRun {
            received: false,
            length: 7,
        },
        AckRun {
            received: true,
            length: 0x7f,
        },
    ];
    let bytes: Vec<u8> = runs
        .iter()
        .map(|run| {
            let mut b = run.length & 0x7f;
            if run.received {
                b |= 0x80;
            }
            b
        })
        .collect();
    assert_eq!(decode_vector_bytes(&bytes).unwrap(), runs);
}

#[test]
fn truncated_vector_never_implies_unreceived_sequences() {
    // worst case: alternating runs, far more than 127 of them
    let have = |seq: u64| seq % 2 == 1;
    let (runs, covered) = build_vector(100, 1000, have);
    assert!(runs.len() <= MAX_VECTOR_BYTES);
    assert!(covered < 1000);
    for seq in vector_received(100, &runs) {
        assert!(have(seq), "vector claims {seq} which was never received");
        assert!(seq <= covered);
    }
}

#[test]
fn sequence_expansion_handles_epoch_edges() {
    // plain case
    assert_eq!(expand_sequence(10, 8), 10);
    // reference far into the second epoch
    let epoch = 1u64 << 48;
    assert_eq!(expand_sequence(10, epoch + 8), epoch + 10);
    // wire value just behind a wrap: stays in the earlier epoch
    assert_eq!(
        expand_sequence(SEQUENCE_MASK, epoch + 1),
        epoch - 1
    );
}

#[test]
fn garbage_input_is_rejected_not_misparsed() {
    assert!(RudpPacket::decode(&[]).is_err());
    assert!(RudpPacket::decode(&[0x40]).is_err());
    // STUN-range leading bytes are not RUDP
    let mut stun_like = vec![0x00, 0x01];
    stun_like.extend_from_slice(&[0u8; 32]);
    assert!(RudpPacket::decode(&stun_like).is_err());
    // vector length pointing past the buffer
    let packet = RudpPacket {
        channel_number: 0x4001,
        sequence_number: 5,
        gsnr: 4,
        gsnfr: 4,
        flags: RudpFlags::NONE,
        vector: Vec::new(),
        payload: Bytes::new(),
    };
    let mut wire = packet.encode().to_vec();
    wire[3] = 10; // claims ten vector bytes that are not there
    assert!(RudpPacket::decode(&wire).is_err());
}
