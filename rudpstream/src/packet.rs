use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RudpError};

/// Lowest channel number a transport may allocate.
///
/// The range `[0x4000, 0x8000)` makes the first wire byte's top two bits
/// `01`, which is how RUDP packets are told apart from STUN (`00`) on a
/// shared socket.
pub const CHANNEL_RANGE_START: u16 = 0x4000;
/// One past the highest allocatable channel number.
pub const CHANNEL_RANGE_END: u16 = 0x8000;

/// Sequence numbers are carried as 48 bits on the wire.
pub const SEQUENCE_MASK: u64 = (1 << 48) - 1;

/// Fixed header: channel(2) + flags(1) + vector_len(1) + gsnr(6) +
/// gsnfr(6) + next_seq(6).
pub const HEADER_SIZE: usize = 22;

/// Longest allowed selective-ACK vector, in run bytes.
pub const MAX_VECTOR_BYTES: usize = 127;

/// Flags carried in every RUDP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RudpFlags(pub u8);

impl RudpFlags {
    pub const NONE: Self = Self(0x00);
    /// Parity of the sequence at GSNR, echoed by the receiver.
    pub const PG: Self = Self(0x80);
    /// XOR of parities of every sequence at or below GSNFR.
    pub const XP: Self = Self(0x40);
    /// Duplicate packets were received since the last emission.
    pub const DP: Self = Self(0x20);
    /// ECN echo.
    pub const EC: Self = Self(0x10);
    /// End of message quantum: final segment of one application buffer.
    pub const EQ: Self = Self(0x08);
    /// ACK required promptly.
    pub const AR: Self = Self(0x04);
    /// XOR of parities of the sequences the vector marks received.
    pub const VP: Self = Self(0x02);
    /// Packet was (re)sent after a gap was detected.
    pub const PS: Self = Self(0x01);

    pub fn contains(self, flag: RudpFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn insert(&mut self, flag: RudpFlags) {
        self.0 |= flag.0;
    }

    pub fn set(&mut self, flag: RudpFlags, on: bool) {
        if on {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

/// One run of the selective-ACK vector: `length` consecutive sequences,
/// all received or all missing, oldest first over `(gsnfr, gsnr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRun {
    pub received: bool,
    pub length: u8,
}

/// RUDP wire packet.
///
/// Binary layout (big-endian):
///
/// ```text
/// +---------+-------+------------+--------+---------+----------+--------+---------+
/// | channel | flags | vector_len |  gsnr  |  gsnfr  | next_seq | vector | payload |
/// |  (2B)   | (1B)  |    (1B)    |  (6B)  |  (6B)   |   (6B)   |  (0-127B)        |
/// +---------+-------+------------+--------+---------+----------+--------+---------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RudpPacket {
    /// The receiver's local channel number.
    pub channel_number: u16,
    /// Sequence number of this packet (48-bit space).
    pub sequence_number: u64,
    /// Greatest sequence number received, holes included.
    pub gsnr: u64,
    /// Greatest sequence number fully received (contiguous prefix end).
    pub gsnfr: u64,
    pub flags: RudpFlags,
    /// Run-length selective-ACK map over `(gsnfr, gsnr]`, oldest first.
    pub vector: Vec<AckRun>,
    pub payload: Bytes,
}

impl RudpPacket {
    /// Whether a datagram leads with an RUDP channel number rather than
    /// a STUN type field.
    pub fn is_rudp(data: &[u8]) -> bool {
        if data.len() < 2 {
            return false;
        }
        let channel = u16::from_be_bytes([data[0], data[1]]);
        (CHANNEL_RANGE_START..CHANNEL_RANGE_END).contains(&channel)
    }

    /// Encode this packet into a fresh byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.channel_number);
        buf.put_u8(self.flags.0);
        buf.put_u8(self.vector.len() as u8);
        buf.put_uint(self.gsnr & SEQUENCE_MASK, 6);
        buf.put_uint(self.gsnfr & SEQUENCE_MASK, 6);
        buf.put_uint(self.sequence_number & SEQUENCE_MASK, 6);
        for run in &self.vector {
            let mut b = run.length & 0x7f;
            if run.received {
                b |= 0x80;
            }
            buf.put_u8(b);
        }
        buf.put_slice(&self.payload);
    }

    /// The total number of bytes this packet will occupy when encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.vector.len() + self.payload.len()
    }

    /// Decode a packet from a raw datagram.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RudpError::PacketTooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let channel_number = u16::from_be_bytes([data[0], data[1]]);
        if !(CHANNEL_RANGE_START..CHANNEL_RANGE_END).contains(&channel_number) {
            return Err(RudpError::NotRudp(channel_number));
        }

        let flags = RudpFlags(data[2]);
        let vector_len = data[3] as usize;
        if vector_len > MAX_VECTOR_BYTES {
            return Err(RudpError::VectorTooLong(vector_len));
        }

        let gsnr = (&data[4..10]).get_uint(6);
        let gsnfr = (&data[10..16]).get_uint(6);
        let sequence_number = (&data[16..22]).get_uint(6);

        let rest = &data[HEADER_SIZE..];
        if rest.len() < vector_len {
            return Err(RudpError::PacketTooShort {
                expected: HEADER_SIZE + vector_len,
                actual: data.len(),
            });
        }

        let mut vector = Vec::with_capacity(vector_len);
        for &b in &rest[..vector_len] {
            let length = b & 0x7f;
            if length == 0 {
                return Err(RudpError::VectorZeroRun);
            }
            vector.push(AckRun {
                received: (b & 0x80) != 0,
                length,
            });
        }

        let payload = Bytes::copy_from_slice(&rest[vector_len..]);

        Ok(Self {
            channel_number,
            sequence_number,
            gsnr,
            gsnfr,
            flags,
            vector,
            payload,
        })
    }

}

/// The sequences in `(gsnfr, …]` a selective-ACK vector marks received.
///
/// `gsnfr` must already be expanded to a full 64-bit value; runs are
/// walked oldest first.
pub fn vector_received(gsnfr: u64, vector: &[AckRun]) -> Vec<u64> {
    let mut seqs = Vec::new();
    let mut next = gsnfr + 1;
    for run in vector {
        for _ in 0..run.length {
            if run.received {
                seqs.push(next);
            }
            next += 1;
        }
    }
    seqs
}

/// Build a selective-ACK vector covering `(gsnfr, gsnr]`, where `have`
/// reports whether a sequence has arrived.
///
/// If the range does not fit `MAX_VECTOR_BYTES` runs, the vector keeps
/// the oldest runs and the returned effective GSNR is reduced to the
/// last sequence the vector still covers, so every sequence the vector
/// implies really was received.
pub fn build_vector(gsnfr: u64, gsnr: u64, have: impl Fn(u64) -> bool) -> (Vec<AckRun>, u64) {
    let mut runs: Vec<AckRun> = Vec::new();
    let mut covered = gsnfr;

    for seq in (gsnfr + 1)..=gsnr {
        let received = have(seq);
        match runs.last_mut() {
            Some(last) if last.received == received && last.length < 0x7f => {
                last.length += 1;
            }
            _ => {
                if runs.len() == MAX_VECTOR_BYTES {
                    // out of room: report only what is already encoded
                    return (runs, covered);
                }
                runs.push(AckRun {
                    received,
                    length: 1,
                });
            }
        }
        covered = seq;
    }

    (runs, covered)
}

/// Decode raw run-length vector bytes (as carried in a STUN ACK
/// attribute) back into runs.
pub fn decode_vector_bytes(data: &[u8]) -> Result<Vec<AckRun>> {
    if data.len() > MAX_VECTOR_BYTES {
        return Err(RudpError::VectorTooLong(data.len()));
    }
    let mut runs = Vec::with_capacity(data.len());
    for &b in data {
        let length = b & 0x7f;
        if length == 0 {
            return Err(RudpError::VectorZeroRun);
        }
        runs.push(AckRun {
            received: (b & 0x80) != 0,
            length,
        });
    }
    Ok(runs)
}

/// Reconstruct a full 64-bit sequence from its low 48 wire bits, picking
/// the value congruent to `wire` that lies nearest `reference`.
pub fn expand_sequence(wire: u64, reference: u64) -> u64 {
    const SPAN: u64 = 1 << 48;
    let wire = wire & SEQUENCE_MASK;
    let base = reference & !SEQUENCE_MASK;

    let mut best = base | wire;
    let mut best_dist = best.abs_diff(reference);
    for candidate in [
        (base | wire).wrapping_sub(SPAN),
        (base | wire).wrapping_add(SPAN),
    ] {
        let dist = candidate.abs_diff(reference);
        if dist < best_dist {
            best = candidate;
            best_dist = dist;
        }
    }
    best
}

/// Single-bit parity of a 48-bit sequence number.
///
/// Both ends derive packet parity from the sequence alone, so the PG /
/// XP / VP echoes can be verified without extra wire state.
pub fn sequence_parity(seq: u64) -> bool {
    ((seq & SEQUENCE_MASK).count_ones() & 1) == 1
}
