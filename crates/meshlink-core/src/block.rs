//! Blocks: the logical unit of delivery.
//!
//! An outbound block is split into packets that each fit one datagram. An
//! inbound block collects packets in any order, tolerating duplicates, until
//! it is solid: fragment 0 is present and the number of distinct fragments
//! held equals the `fragment_count` it declares.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::wire::{BlockId, NodeId, Packet, PacketType, PACKET_HEADER_LEN};

/// A logical payload unit plus its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Block {
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    pub block_id: BlockId,
    pub block_type: PacketType,
    pub payload: Bytes,
    /// Number of times this block has been put on the wire.
    pub send_attempts: u32,
    pub delivered: bool,
    fragments: BTreeMap<i32, Packet>,
    /// Fragment count declared by the first fragment received.
    expected: Option<i32>,
    /// Ciphertext of a `RawData` payload and the fingerprint of the key that
    /// produced it.
    sealed: Option<([u8; 32], Bytes)>,
}

impl Block {
    /// A block built locally for transmission.
    pub fn outbound(
        sender_id: NodeId,
        receiver_id: NodeId,
        block_id: BlockId,
        block_type: PacketType,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            block_id,
            block_type,
            payload: payload.into(),
            send_attempts: 0,
            delivered: false,
            fragments: BTreeMap::new(),
            expected: None,
            sealed: None,
        }
    }

    /// An empty block keyed by the metadata of its first received fragment.
    /// The fragment itself still has to be added with [`Block::add_fragment`].
    pub fn inbound(first: &Packet) -> Self {
        Self {
            sender_id: first.sender_id,
            receiver_id: first.receiver_id,
            block_id: first.block_id,
            block_type: first.packet_type,
            payload: Bytes::new(),
            send_attempts: 0,
            delivered: false,
            fragments: BTreeMap::new(),
            expected: None,
            sealed: None,
        }
    }

    /// Split this block's payload into packets no larger than `max_packet_size`.
    pub fn split(&self, max_packet_size: usize) -> Result<Vec<Packet>, BlockError> {
        fragment(
            self.sender_id,
            self.receiver_id,
            self.block_id,
            self.block_type,
            &self.payload,
            max_packet_size,
        )
    }

    /// Add a received fragment. Returns `Ok(true)` if it was new and
    /// `Ok(false)` for a duplicate index, which never overwrites.
    pub fn add_fragment(&mut self, packet: Packet) -> Result<bool, BlockError> {
        if packet.sender_id != self.sender_id
            || packet.block_id != self.block_id
            || packet.packet_type != self.block_type
        {
            return Err(BlockError::ForeignFragment {
                block_id: packet.block_id,
            });
        }
        if packet.fragment_index < 0 || packet.fragment_index >= packet.fragment_count {
            return Err(BlockError::FragmentOutOfRange {
                index: packet.fragment_index,
                count: packet.fragment_count,
            });
        }
        match self.expected {
            Some(count) if count != packet.fragment_count => {
                return Err(BlockError::FragmentCountMismatch {
                    expected: count,
                    got: packet.fragment_count,
                });
            }
            Some(_) => {}
            None => self.expected = Some(packet.fragment_count),
        }

        if self.fragments.contains_key(&packet.fragment_index) {
            return Ok(false);
        }
        self.fragments.insert(packet.fragment_index, packet);
        Ok(true)
    }

    /// Fragment 0 is held and the distinct fragment count matches what it declares.
    pub fn is_solid(&self) -> bool {
        match self.fragments.get(&0) {
            Some(first) => first.fragment_count as usize == self.fragments.len(),
            None => false,
        }
    }

    /// Distinct fragments held so far.
    pub fn fragments_held(&self) -> usize {
        self.fragments.len()
    }

    /// Concatenate the fragment payloads in index order.
    pub fn reconstruct(&self) -> Result<Bytes, BlockError> {
        if !self.is_solid() {
            return Err(BlockError::IncompleteBlock {
                have: self.fragments.len(),
                expected: self.expected.unwrap_or(0),
            });
        }
        let total = self.fragments.values().map(|p| p.payload.len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for packet in self.fragments.values() {
            out.extend_from_slice(&packet.payload);
        }
        Ok(out.freeze())
    }

    /// Cached ciphertext, if it was produced under the key with this fingerprint.
    pub fn sealed_for(&self, key_fingerprint: &[u8; 32]) -> Option<Bytes> {
        match &self.sealed {
            Some((fp, ct)) if fp == key_fingerprint => Some(ct.clone()),
            _ => None,
        }
    }

    pub fn set_sealed(&mut self, key_fingerprint: [u8; 32], ciphertext: Bytes) {
        self.sealed = Some((key_fingerprint, ciphertext));
    }
}

/// Slice `payload` into wire packets sharing the given metadata.
///
/// Header overhead is the encoded size of a zero-payload packet. An empty
/// payload still produces one packet.
pub fn fragment(
    sender_id: NodeId,
    receiver_id: NodeId,
    block_id: BlockId,
    packet_type: PacketType,
    payload: &Bytes,
    max_packet_size: usize,
) -> Result<Vec<Packet>, BlockError> {
    let overhead = PACKET_HEADER_LEN;
    if max_packet_size <= overhead {
        return Err(BlockError::PacketSizeTooSmall {
            max_packet_size,
            overhead,
        });
    }
    let chunk = max_packet_size - overhead;
    let count = payload.len().div_ceil(chunk).max(1);
    let fragment_count =
        i32::try_from(count).map_err(|_| BlockError::TooManyFragments(count))?;

    let packets = (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = (start + chunk).min(payload.len());
            Packet {
                fragment_count,
                fragment_index: i as i32,
                sender_id,
                receiver_id,
                block_id,
                packet_type,
                payload: payload.slice(start..end),
            }
        })
        .collect();
    Ok(packets)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("max packet size {max_packet_size} leaves no room after {overhead} header bytes")]
    PacketSizeTooSmall {
        max_packet_size: usize,
        overhead: usize,
    },

    #[error("block incomplete: {have} of {expected} fragments")]
    IncompleteBlock { have: usize, expected: i32 },

    #[error("fragment of block {block_id} does not belong to this block")]
    ForeignFragment { block_id: BlockId },

    #[error("fragment count {got} disagrees with {expected}")]
    FragmentCountMismatch { expected: i32, got: i32 },

    #[error("fragment index {index} outside fragment count {count}")]
    FragmentOutOfRange { index: i32, count: i32 },

    #[error("payload needs {0} fragments")]
    TooManyFragments(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const MAX: usize = 64;
    const P: usize = MAX - PACKET_HEADER_LEN;

    fn data_block(payload: Vec<u8>) -> Block {
        Block::outbound(1, 2, 42, PacketType::Data, payload)
    }

    fn reassemble(packets: &[Packet]) -> Block {
        let mut block = Block::inbound(&packets[0]);
        for p in packets {
            block.add_fragment(p.clone()).unwrap();
        }
        block
    }

    #[test]
    fn round_trip_at_boundary_lengths() {
        for len in [0, 1, P - 1, P, 10 * P, 10 * P + 1] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let packets = data_block(payload.clone()).split(MAX).unwrap();

            assert_eq!(packets.len(), len.div_ceil(P).max(1), "len {len}");
            for (i, p) in packets.iter().enumerate() {
                assert_eq!(p.fragment_index, i as i32);
                assert_eq!(p.fragment_count, packets.len() as i32);
                assert!(p.encoded_len() <= MAX);
            }

            let block = reassemble(&packets);
            assert!(block.is_solid());
            assert_eq!(block.reconstruct().unwrap(), Bytes::from(payload));
        }
    }

    #[test]
    fn empty_payload_yields_single_packet() {
        let packets = data_block(Vec::new()).split(MAX).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
    }

    #[test]
    fn packet_size_too_small() {
        let err = data_block(vec![1]).split(PACKET_HEADER_LEN).unwrap_err();
        assert!(matches!(err, BlockError::PacketSizeTooSmall { .. }));
    }

    #[test]
    fn duplicate_fragment_never_overwrites() {
        let packets = data_block(vec![7; 3 * P]).split(MAX).unwrap();
        let mut block = Block::inbound(&packets[1]);
        assert!(block.add_fragment(packets[1].clone()).unwrap());

        let mut forged = packets[1].clone();
        forged.payload = Bytes::from_static(b"x");
        assert!(!block.add_fragment(forged).unwrap());
        assert_eq!(block.fragments_held(), 1);
    }

    #[test]
    fn not_solid_without_fragment_zero() {
        let packets = data_block(vec![7; 3 * P]).split(MAX).unwrap();
        let block = reassemble(&packets[1..]);
        assert!(!block.is_solid());
        assert!(matches!(
            block.reconstruct(),
            Err(BlockError::IncompleteBlock { have: 2, expected: 3 })
        ));
    }

    #[test]
    fn mismatched_fragment_count_rejected() {
        let packets = data_block(vec![7; 3 * P]).split(MAX).unwrap();
        let mut block = reassemble(&packets[..1]);
        let mut odd = packets[1].clone();
        odd.fragment_count = 5;
        assert!(matches!(
            block.add_fragment(odd),
            Err(BlockError::FragmentCountMismatch { expected: 3, got: 5 })
        ));
    }

    #[test]
    fn foreign_fragment_rejected() {
        let packets = data_block(vec![7; 2 * P]).split(MAX).unwrap();
        let mut block = reassemble(&packets[..1]);
        let mut other = packets[1].clone();
        other.block_id = 43;
        assert!(block.add_fragment(other).is_err());
    }

    #[test]
    fn sealed_cache_keyed_by_fingerprint() {
        let mut block = Block::outbound(1, 2, 3, PacketType::RawData, &b"hi"[..]);
        block.set_sealed([1; 32], Bytes::from_static(b"ct"));
        assert_eq!(block.sealed_for(&[1; 32]).unwrap(), Bytes::from_static(b"ct"));
        assert!(block.sealed_for(&[2; 32]).is_none());
    }

    proptest! {
        #[test]
        fn reassembly_is_order_independent(
            payload in prop::collection::vec(any::<u8>(), 0..1500),
            seed in any::<u64>(),
            dup_every in 1usize..5,
        ) {
            let packets = data_block(payload.clone()).split(MAX).unwrap();

            let mut delivery: Vec<Packet> = packets.clone();
            for (i, p) in packets.iter().enumerate() {
                if i % dup_every == 0 {
                    delivery.push(p.clone());
                }
            }
            delivery.shuffle(&mut StdRng::seed_from_u64(seed));

            let mut block = Block::inbound(&delivery[0]);
            let mut seen = std::collections::HashSet::new();
            for p in delivery {
                seen.insert(p.fragment_index);
                block.add_fragment(p).unwrap();
                prop_assert_eq!(block.is_solid(), seen.len() == packets.len());
            }
            prop_assert_eq!(block.reconstruct().unwrap(), Bytes::from(payload));
        }
    }
}
