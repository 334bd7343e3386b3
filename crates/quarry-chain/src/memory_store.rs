//! In-memory [`BlockStore`], for tests and volatile nodes.

use std::collections::HashMap;

use quarry_core::error::StoreError;
use quarry_core::traits::{
    BlockStore, HEADER_FLAG_INVALID, HEADER_FLAG_TRUSTED, HeaderRecord, StoredBlock,
};
use quarry_core::types::{Block, Hash256};

#[derive(Debug, Default, Clone)]
pub struct MemoryBlockStore {
    blocks: HashMap<Hash256, Block>,
    /// Header log in insertion order.
    log: Vec<HeaderRecord>,
    positions: HashMap<Hash256, usize>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The header record for `hash`, if stored.
    pub fn record(&self, hash: &Hash256) -> Option<&HeaderRecord> {
        self.positions.get(hash).map(|&i| &self.log[i])
    }

    fn set_flag(&mut self, hash: &Hash256, flag: u32) {
        if let Some(&i) = self.positions.get(hash) {
            self.log[i].flags |= flag;
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        let Some(block) = self.blocks.get(hash) else {
            return Ok(None);
        };
        let trusted = self.record(hash).is_some_and(HeaderRecord::trusted);
        Ok(Some(StoredBlock { block: block.clone(), trusted }))
    }

    fn put(&mut self, height: u64, block: &Block, trusted: bool) -> Result<(), StoreError> {
        let rec = HeaderRecord::for_block(height, block, trusted);
        match self.positions.get(&rec.hash) {
            Some(&i) => self.log[i] = rec,
            None => {
                self.positions.insert(rec.hash, self.log.len());
                self.log.push(rec);
            }
        }
        self.blocks.insert(rec.hash, block.clone());
        Ok(())
    }

    fn mark_invalid(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.set_flag(hash, HEADER_FLAG_INVALID);
        Ok(())
    }

    fn mark_trusted(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.set_flag(hash, HEADER_FLAG_TRUSTED);
        Ok(())
    }

    fn headers(&self) -> Result<Vec<HeaderRecord>, StoreError> {
        Ok(self.log.clone())
    }

    fn stats(&self) -> String {
        let invalid = self.log.iter().filter(|r| r.invalid()).count();
        format!("BLOCKS: {} in memory, {} invalid", self.blocks.len(), invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::types::{BlockHeader, OutPoint, Transaction, TxInput, TxOutput};

    fn make_block(nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::null(),
                    script_sig: vec![0x01, 0x01],
                    sequence: u32::MAX,
                }],
                outputs: vec![TxOutput { value: 5, pk_script: vec![0x51] }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn put_get_and_flags() {
        let mut store = MemoryBlockStore::new();
        let block = make_block(1);
        let hash = block.hash();
        store.put(1, &block, false).unwrap();

        let got = store.get(&hash).unwrap().unwrap();
        assert_eq!(got.block, block);
        assert!(!got.trusted);

        store.mark_trusted(&hash).unwrap();
        assert!(store.get(&hash).unwrap().unwrap().trusted);
        store.mark_invalid(&hash).unwrap();
        assert!(store.record(&hash).unwrap().invalid());
        assert!(store.get(&Hash256([1; 32])).unwrap().is_none());
    }

    #[test]
    fn header_log_keeps_insertion_order() {
        let mut store = MemoryBlockStore::new();
        for n in [3, 1, 2] {
            store.put(u64::from(n), &make_block(n), true).unwrap();
        }
        // A repeated put replaces the record in place.
        store.put(1, &make_block(1), false).unwrap();
        let heights: Vec<u64> = store.headers().unwrap().iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![3, 1, 2]);
        assert_eq!(store.len(), 3);
        assert!(!store.record(&make_block(1).hash()).unwrap().trusted());
    }

    #[test]
    fn unknown_hash_flags_are_ignored() {
        let mut store = MemoryBlockStore::new();
        store.mark_invalid(&Hash256([9; 32])).unwrap();
        assert!(store.headers().unwrap().is_empty());
        assert!(store.stats().contains("0 in memory"));
    }
}
