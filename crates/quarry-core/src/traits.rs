//! Trait interfaces for the collaborators the chain engine consumes.
//!
//! - [`SignatureVerifier`]: script and signature evaluation, called from the
//!   verify pool's worker threads.
//! - [`BlockStore`]: raw block payloads plus the header log the block index
//!   is rebuilt from (quarry-chain ships an in-memory one, quarry-node a
//!   RocksDB one).
//! - [`ChainListener`]: notifications when the active chain moves.

use crate::error::StoreError;
use crate::types::{Block, BlockHeader, Hash256, Transaction};

/// Evaluates one input's unlocking script against the output it spends.
///
/// Must be safe to call from many threads at once.
pub trait SignatureVerifier: Send + Sync {
    /// Whether input `input_index` of `tx` satisfies `pk_script`, which locks
    /// `value` units. `flags` is a bitmask of `VERIFY_*` constants.
    fn verify(
        &self,
        script_sig: &[u8],
        pk_script: &[u8],
        input_index: usize,
        tx: &Transaction,
        value: u64,
        flags: u32,
    ) -> bool;
}

/// A block fetched from a [`BlockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub block: Block,
    /// Already fully verified once; scripts and contents need not be rechecked.
    pub trusted: bool,
}

pub const HEADER_FLAG_TRUSTED: u32 = 1 << 0;
pub const HEADER_FLAG_INVALID: u32 = 1 << 1;

/// One entry of the header log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    pub flags: u32,
    pub height: u64,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Zero when only the header is known.
    pub tx_count: u32,
    pub hash: Hash256,
    pub header: BlockHeader,
}

impl HeaderRecord {
    /// Layout: flags, height, size, tx count, hash, raw header.
    pub const SIZE: usize = 4 + 8 + 4 + 4 + 32 + BlockHeader::SIZE;

    pub fn for_block(height: u64, block: &Block, trusted: bool) -> Self {
        Self {
            flags: if trusted { HEADER_FLAG_TRUSTED } else { 0 },
            height,
            size: block.serialized_size() as u32,
            tx_count: block.transactions.len() as u32,
            hash: block.hash(),
            header: block.header,
        }
    }

    pub fn trusted(&self) -> bool {
        self.flags & HEADER_FLAG_TRUSTED != 0
    }

    pub fn invalid(&self) -> bool {
        self.flags & HEADER_FLAG_INVALID != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..12].copy_from_slice(&self.height.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..20].copy_from_slice(&self.tx_count.to_le_bytes());
        out[20..52].copy_from_slice(self.hash.as_bytes());
        out[52..].copy_from_slice(&self.header.to_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, StoreError> {
        if raw.len() != Self::SIZE {
            return Err(StoreError::Corrupt(format!(
                "header record is {} bytes, expected {}",
                raw.len(),
                Self::SIZE
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut height = [0u8; 8];
        height.copy_from_slice(&raw[4..12]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&raw[20..52]);
        let mut header = [0u8; BlockHeader::SIZE];
        header.copy_from_slice(&raw[52..]);
        Ok(Self {
            flags: u32_at(0),
            height: u64::from_le_bytes(height),
            size: u32_at(12),
            tx_count: u32_at(16),
            hash: Hash256(hash),
            header: BlockHeader::from_bytes(&header),
        })
    }
}

/// Persistent store of raw blocks, keyed by hash.
///
/// Every `put` also appends a [`HeaderRecord`] to the header log; flag
/// updates rewrite that record in place.
pub trait BlockStore: Send {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError>;

    fn put(&mut self, height: u64, block: &Block, trusted: bool) -> Result<(), StoreError>;

    /// Flag a block as invalid. Invalid records are skipped when the index is
    /// rebuilt. Unknown hashes are ignored.
    fn mark_invalid(&mut self, hash: &Hash256) -> Result<(), StoreError>;

    fn mark_trusted(&mut self, hash: &Hash256) -> Result<(), StoreError>;

    /// The full header log, in insertion order.
    fn headers(&self) -> Result<Vec<HeaderRecord>, StoreError>;

    /// Opportunistic background work. Returns true if anything was done.
    fn idle(&mut self) -> bool {
        false
    }

    /// One-line human readable summary.
    fn stats(&self) -> String;

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Callbacks fired by the chain after the tip moves.
///
/// Both default to no-ops.
pub trait ChainListener: Send + Sync {
    fn block_connected(&self, _block: &Block, _height: u64) {}

    fn block_disconnected(&self, _block: &Block, _height: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn make_block() -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_hash: Hash256([7; 32]),
                merkle_root: Hash256([8; 32]),
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce: 3,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::null(),
                    script_sig: vec![0x01, 0x05],
                    sequence: u32::MAX,
                }],
                outputs: vec![TxOutput { value: 1, pk_script: vec![] }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn header_record_round_trip() {
        let block = make_block();
        let rec = HeaderRecord::for_block(5, &block, true);
        assert_eq!(rec.hash, block.hash());
        assert_eq!(rec.tx_count, 1);
        assert!(rec.trusted());
        assert!(!rec.invalid());
        assert_eq!(HeaderRecord::from_bytes(&rec.to_bytes()).unwrap(), rec);
    }

    #[test]
    fn header_record_wrong_length_is_corrupt() {
        assert!(matches!(
            HeaderRecord::from_bytes(&[0u8; 10]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn listener_defaults_are_noops() {
        struct Silent;
        impl ChainListener for Silent {}
        let block = make_block();
        Silent.block_connected(&block, 1);
        Silent.block_disconnected(&block, 1);
    }
}
