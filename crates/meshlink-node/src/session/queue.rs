//! Insertion-ordered block queue keyed by block id.

use std::collections::{BTreeMap, HashMap};

use meshlink_core::{Block, BlockId, PacketType};

/// FIFO of blocks with O(1) membership by id and O(log n) removal.
#[derive(Debug, Default)]
pub struct BlockQueue {
    order: BTreeMap<u64, Block>,
    index: HashMap<BlockId, u64>,
    next_seq: u64,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block. Returns false, leaving the queue untouched, if a block
    /// with the same id is already queued.
    pub fn push(&mut self, block: Block) -> bool {
        if self.index.contains_key(&block.block_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(block.block_id, seq);
        self.order.insert(seq, block);
        true
    }

    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        let seq = self.index.remove(&id)?;
        self.order.remove(&seq)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.index.get(&id).and_then(|seq| self.order.get(seq))
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        let seq = self.index.get(&id)?;
        self.order.get_mut(seq)
    }

    /// Block ids in insertion order.
    pub fn ids(&self) -> Vec<BlockId> {
        self.order.values().map(|b| b.block_id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.order.values()
    }

    /// Take every block out, oldest first.
    pub fn drain(&mut self) -> Vec<Block> {
        self.index.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }

    /// Remove all blocks of the given type, returning them oldest first.
    pub fn remove_by_type(&mut self, block_type: PacketType) -> Vec<Block> {
        let ids: Vec<BlockId> = self
            .order
            .values()
            .filter(|b| b.block_type == block_type)
            .map(|b| b.block_id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn has_type(&self, block_type: PacketType) -> bool {
        self.order.values().any(|b| b.block_type == block_type)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: BlockId, t: PacketType) -> Block {
        Block::outbound(1, 2, id, t, &b"x"[..])
    }

    #[test]
    fn fifo_order_survives_removal() {
        let mut q = BlockQueue::new();
        for id in [30, 10, 20, 5] {
            assert!(q.push(block(id, PacketType::RawData)));
        }
        q.remove(10);
        assert_eq!(q.ids(), vec![30, 20, 5]);
        let drained: Vec<BlockId> = q.drain().into_iter().map(|b| b.block_id).collect();
        assert_eq!(drained, vec![30, 20, 5]);
        assert!(q.is_empty());
        assert!(!q.contains(30));
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut q = BlockQueue::new();
        assert!(q.push(block(1, PacketType::Hello)));
        assert!(!q.push(block(1, PacketType::Data)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(1).unwrap().block_type, PacketType::Hello);
    }

    #[test]
    fn remove_by_type_only_touches_that_type() {
        let mut q = BlockQueue::new();
        q.push(block(1, PacketType::Hello));
        q.push(block(2, PacketType::RawData));
        q.push(block(3, PacketType::Hello));
        let removed = q.remove_by_type(PacketType::Hello);
        assert_eq!(removed.len(), 2);
        assert_eq!(q.ids(), vec![2]);
        assert!(!q.has_type(PacketType::Hello));
        assert!(q.remove(1).is_none());
    }
}
