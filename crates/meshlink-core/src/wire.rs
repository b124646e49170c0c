//! meshlink wire format. One packet per datagram.
//!
//! Every datagram is a fixed 28-byte header followed by the payload bytes.
//! The header carries six big-endian i32 fields in fixed order and an
//! explicit u32 payload length, so the payload size is never inferred from
//! the datagram size:
//!
//! ```text
//! fragment_count:i32 fragment_index:i32 sender_id:i32 receiver_id:i32
//! block_id:i32 type:i32 payload_len:u32 payload:[u8; payload_len]
//! ```
//!
//! The header is a zerocopy struct; there is no unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, I32, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Peer identifier. Zero means "not known yet".
pub type NodeId = i32;

/// Block identifier, shared by every packet of one block.
pub type BlockId = i32;

// ── Packet Type ───────────────────────────────────────────────────────────────

/// What a block carries. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PacketType {
    /// Application payload not yet encrypted. Lives only in local queues;
    /// it is converted to `Data` on transmission and rejected on receipt.
    RawData = -1,
    /// Symmetrically encrypted application payload.
    Data = 0,
    /// Acknowledges a `Data` block by id.
    Ack = 1,
    /// Tells the sender its session is unknown here.
    Nack = 2,
    /// Handshake step 1: initiator's public identity, unencrypted.
    Hello = 3,
    /// Handshake step 2: responder's fresh nonce.
    Welcome = 4,
    /// Handshake step 3: signed (initiator nonce, responder nonce).
    KeyRequest = 5,
    /// Handshake step 4: session key sealed to the initiator, signed.
    SessionKey = 6,
}

impl PacketType {
    /// Handshake steps that are retransmitted until the next step arrives.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::Hello | PacketType::Welcome | PacketType::KeyRequest
        )
    }
}

impl TryFrom<i32> for PacketType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(PacketType::RawData),
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Ack),
            2 => Ok(PacketType::Nack),
            3 => Ok(PacketType::Hello),
            4 => Ok(PacketType::Welcome),
            5 => Ok(PacketType::KeyRequest),
            6 => Ok(PacketType::SessionKey),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for i32 {
    fn from(t: PacketType) -> i32 {
        t as i32
    }
}

// ── Packet Header ─────────────────────────────────────────────────────────────

/// Fixed header preceding every packet payload.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// Total fragments in the parent block.
    pub fragment_count: I32<NetworkEndian>,
    /// Zero-based position of this fragment.
    pub fragment_index: I32<NetworkEndian>,
    pub sender_id: I32<NetworkEndian>,
    pub receiver_id: I32<NetworkEndian>,
    pub block_id: I32<NetworkEndian>,
    /// `PacketType` discriminant.
    pub packet_type: I32<NetworkEndian>,
    /// Number of payload bytes following the header.
    pub payload_len: U32<NetworkEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 28]);

/// Encoded size of a packet with an empty payload.
pub const PACKET_HEADER_LEN: usize = std::mem::size_of::<PacketHeader>();

/// Default maximum datagram size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

/// Largest datagram the receive loop will read.
pub const MAX_DATAGRAM: usize = 65507;

// ── Packet ────────────────────────────────────────────────────────────────────

/// One wire-sized fragment of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub fragment_count: i32,
    pub fragment_index: i32,
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    pub block_id: BlockId,
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    /// Size of this packet once encoded.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }

    fn header(&self) -> PacketHeader {
        PacketHeader {
            fragment_count: I32::new(self.fragment_count),
            fragment_index: I32::new(self.fragment_index),
            sender_id: I32::new(self.sender_id),
            receiver_id: I32::new(self.receiver_id),
            block_id: I32::new(self.block_id),
            packet_type: I32::new(self.packet_type.into()),
            payload_len: U32::new(self.payload.len() as u32),
        }
    }

    /// Serialize to a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(self.header().as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a datagram. The buffer must hold exactly one packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = PacketHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
            needed: PACKET_HEADER_LEN,
            got: bytes.len(),
        })?;

        let declared = header.payload_len.get() as usize;
        let actual = bytes.len() - PACKET_HEADER_LEN;
        if declared != actual {
            return Err(WireError::LengthMismatch { declared, actual });
        }

        let packet_type = PacketType::try_from(header.packet_type.get())?;
        if packet_type == PacketType::RawData {
            return Err(WireError::RawDataOnWire);
        }

        let fragment_count = header.fragment_count.get();
        let fragment_index = header.fragment_index.get();
        if fragment_count < 1 || fragment_index < 0 || fragment_index >= fragment_count {
            return Err(WireError::BadFragment {
                index: fragment_index,
                count: fragment_count,
            });
        }

        Ok(Self {
            fragment_count,
            fragment_index,
            sender_id: header.sender_id.get(),
            receiver_id: header.receiver_id.get(),
            block_id: header.block_id.get(),
            packet_type,
            payload: Bytes::copy_from_slice(&bytes[PACKET_HEADER_LEN..]),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A datagram that cannot be parsed into a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated packet: need at least {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("payload length {declared} does not match remaining {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(i32),

    #[error("raw data blocks are never sent on the wire")]
    RawDataOnWire,

    #[error("fragment index {index} outside fragment count {count}")]
    BadFragment { index: i32, count: i32 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
