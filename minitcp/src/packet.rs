//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Packet`]: a fixed 20-byte
//! [`Header`] immediately followed by zero or more payload bytes.  The header
//! is shaped like a TCP header but is not interoperable with one: the port and
//! option fields are always zero, and the checksum covers only the serialised
//! header and payload (no pseudo-header).
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Source Port (0)         |     Destination Port (0)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Offset|  Rsvd |U|A|P|R|S|F|            Window                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |      Urgent Pointer (0)       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload length is implied by the datagram length.

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
///
/// The values match the position of each bit in the flags byte (offset 13).
pub mod flags {
    /// Finish: this segment ends the stream.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0b0000_0010;
    /// Reset the connection.
    pub const RST: u8 = 0b0000_0100;
    /// Push. Carried but never interpreted.
    pub const PSH: u8 = 0b0000_1000;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0001_0000;
    /// Urgent. Carried but never interpreted.
    pub const URG: u8 = 0b0010_0000;
    /// Every flag bit the header can carry.
    pub const MASK: u8 = 0b0011_1111;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DATA_OFFSET: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Header::encode`] converts to big-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Always 0; role identity travels in the datagram's source address.
    pub src_port: u16,
    /// Always 0.
    pub dst_port: u16,
    /// Stream offset of the first payload byte, or a control-packet token.
    pub seq: u32,
    /// Next sequence number the sender of this packet expects.
    pub ack: u32,
    /// Upper nibble of byte 12. Always 0 (no options).
    pub data_offset: u8,
    /// Lower nibble of byte 12. Never set by this crate, but kept so the
    /// checksum sees the bits that arrived.
    pub reserved: u8,
    /// Bitmask of [`flags`] constants.  Bits outside [`flags::MASK`] are
    /// carried as received.
    pub flags: u8,
    /// Advisory window. Round-tripped, never enforced.
    pub window: u16,
    /// One's-complement checksum over the serialised packet.
    pub checksum: u16,
    /// Always 0.
    pub urgent_ptr: u16,
}

impl Header {
    /// A header with the given sequence/ack numbers and flags; every other
    /// field is zero.
    pub fn new(seq: u32, ack: u32, flags: u8) -> Self {
        Self {
            seq,
            ack,
            flags,
            ..Self::default()
        }
    }

    /// `true` when every bit in `flag` is set.
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Serialise into a fixed-size array.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_DATA_OFFSET] = (self.data_offset & 0x0f) << 4 | (self.reserved & 0x0f);
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[OFF_URGENT..OFF_URGENT + 2].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        buf
    }

    /// Parse the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Any combination of flag bits is accepted; deciding whether a
    /// combination makes sense is the caller's job.  Every bit is kept, so
    /// `encode(decode(x)) == x` for the first [`HEADER_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Framing { len: buf.len() });
        }
        Ok(Self {
            src_port: be_u16(buf, OFF_SRC_PORT),
            dst_port: be_u16(buf, OFF_DST_PORT),
            seq: be_u32(buf, OFF_SEQ),
            ack: be_u32(buf, OFF_ACK),
            data_offset: buf[OFF_DATA_OFFSET] >> 4,
            reserved: buf[OFF_DATA_OFFSET] & 0x0f,
            flags: buf[OFF_FLAGS],
            window: be_u16(buf, OFF_WINDOW),
            checksum: be_u16(buf, OFF_CHECKSUM),
            urgent_ptr: be_u16(buf, OFF_URGENT),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (flags::SYN, "SYN"),
            (flags::ACK, "ACK"),
            (flags::FIN, "FIN"),
            (flags::RST, "RST"),
            (flags::PSH, "PSH"),
            (flags::URG, "URG"),
        ];
        write!(f, "seq={} ack={} win={} [", self.seq, self.ack, self.window)?;
        let mut first = true;
        for (bit, name) in NAMES {
            if self.flags & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str("]")
    }
}

/// `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// Correct as long as the two values are less than `u32::MAX / 2` apart.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= u32::MAX / 2
}

/// Strict form of [`seq_le`].
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

#[inline]
fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// A payload-less control packet (SYN, ACK, RST, ...).
    pub fn control(seq: u32, ack: u32, flags: u8) -> Self {
        Self::new(Header::new(seq, ack, flags), Vec::new())
    }

    /// Sequence number one past the last payload byte.
    pub fn seq_end(&self) -> u32 {
        self.header.seq.wrapping_add(self.payload.len() as u32)
    }

    /// Compute the checksum over the packet with its checksum field zeroed
    /// and store the result in the header.
    pub fn compute_checksum(&mut self) -> u16 {
        self.header.checksum = 0;
        let csum = self.checksum_with_zeroed_field();
        self.header.checksum = csum;
        csum
    }

    /// `true` when the stored checksum matches a fresh computation over the
    /// packet with the checksum field zeroed.
    ///
    /// The stored header is left exactly as it was.
    pub fn validate_checksum(&self) -> bool {
        self.verify().is_ok()
    }

    /// Like [`validate_checksum`](Self::validate_checksum), but reports both
    /// values on mismatch.
    pub fn verify(&self) -> Result<(), PacketError> {
        let stored = self.header.checksum;
        let computed = self.checksum_with_zeroed_field();
        if stored == computed {
            Ok(())
        } else {
            Err(PacketError::ChecksumMismatch { stored, computed })
        }
    }

    fn checksum_with_zeroed_field(&self) -> u16 {
        let mut scratch = self.header;
        scratch.checksum = 0;
        // HEADER_LEN is even, so the payload words stay aligned.
        let sum = word_sum(&scratch.encode()) + word_sum(&self.payload);
        fold_complement(sum)
    }

    /// Serialise header and payload into one buffer.
    ///
    /// The checksum field is written as stored; call
    /// [`compute_checksum`](Self::compute_checksum) first.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Split a raw datagram into header and payload.
    ///
    /// Only framing is checked here; checksum validation is left to the
    /// caller because a corrupt packet still drives protocol decisions
    /// (duplicate ACK, handshake restart).
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;
        Ok(Self {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when parsing or validating a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("datagram of {len} bytes is too short for a {HEADER_LEN}-byte header")]
    Framing { len: usize },
    /// Datagram longer than the receiving socket's MSS.
    #[error("datagram exceeds the {max}-byte segment size")]
    Oversize { max: usize },
    /// Stored checksum does not match the recomputed value.
    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

/// Compute the Internet-style checksum over `data`.
///
/// Sum consecutive 16-bit big-endian words (a trailing odd byte is padded
/// with a zero low byte), fold the carries back into 16 bits, and return the
/// one's complement.  Any checksum field inside `data` must already be zero.
pub fn checksum(data: &[u8]) -> u16 {
    fold_complement(word_sum(data))
}

fn word_sum(data: &[u8]) -> u64 {
    let mut words = data.chunks_exact(2);
    let mut sum: u64 = words
        .by_ref()
        .map(|w| u64::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

fn fold_complement(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
