//! RocksDB-backed [`BlockStore`].
//!
//! Three column families:
//! - `blocks`: block hash -> bincode-encoded block
//! - `headers`: sequence number (big-endian u64) -> [`HeaderRecord`] bytes,
//!   so iterating the family yields the header log in insertion order
//! - `header_pos`: block hash -> sequence number of its header record
//!
//! A `put` writes all three in one [`WriteBatch`].

use std::path::{Path, PathBuf};

use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use tracing::{debug, info};

use quarry_core::error::StoreError;
use quarry_core::traits::{
    BlockStore, HEADER_FLAG_INVALID, HEADER_FLAG_TRUSTED, HeaderRecord, StoredBlock,
};
use quarry_core::types::{Block, Hash256};

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_HEADERS: &str = "headers";
const CF_HEADER_POS: &str = "header_pos";

const ALL_CFS: &[&str] = &[CF_BLOCKS, CF_HEADERS, CF_HEADER_POS];

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RocksBlockStore {
    db: DB,
    path: PathBuf,
    next_seq: u64,
}

impl std::fmt::Debug for RocksBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksBlockStore")
            .field("path", &self.path)
            .field("records", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl RocksBlockStore {
    /// Open or create the database at `path`, creating missing column
    /// families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;
        let mut store = Self { db, path: path.as_ref().to_path_buf(), next_seq: 0 };
        store.next_seq = store.last_seq()?.map_or(0, |s| s + 1);
        info!(path = %store.path.display(), records = store.next_seq, "block store opened");
        Ok(store)
    }

    /// Number of header records ever written.
    pub fn record_count(&self) -> u64 {
        self.next_seq
    }

    /// The header record for `hash`, if stored.
    pub fn record(&self, hash: &Hash256) -> Result<Option<HeaderRecord>, StoreError> {
        let Some(seq) = self.position(hash)? else {
            return Ok(None);
        };
        let cf = self.cf_handle(CF_HEADERS)?;
        match self.db.get_cf(&cf, seq.to_be_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(HeaderRecord::from_bytes(&bytes)?)),
            None => Err(StoreError::Corrupt(format!("header record {seq} for {hash} is missing"))),
        }
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(backend)?;
                Ok(Some(decode_seq(&key)?))
            }
            None => Ok(None),
        }
    }

    fn position(&self, hash: &Hash256) -> Result<Option<u64>, StoreError> {
        let cf = self.cf_handle(CF_HEADER_POS)?;
        self.db
            .get_cf(&cf, hash.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode_seq(&bytes))
            .transpose()
    }

    fn set_flag(&mut self, hash: &Hash256, flag: u32) -> Result<(), StoreError> {
        let Some(seq) = self.position(hash)? else {
            return Ok(());
        };
        let Some(mut rec) = self.record(hash)? else {
            return Ok(());
        };
        if rec.flags & flag == flag {
            return Ok(());
        }
        rec.flags |= flag;
        let cf = self.cf_handle(CF_HEADERS)?;
        self.db.put_cf(&cf, seq.to_be_bytes(), rec.to_bytes()).map_err(backend)
    }
}

fn decode_seq(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("sequence key is {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

impl BlockStore for RocksBlockStore {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        let Some(data) = self.db.get_cf(&cf, hash.as_bytes()).map_err(backend)? else {
            return Ok(None);
        };
        let (block, _): (Block, _) = bincode::decode_from_slice(&data, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let trusted = self.record(hash)?.is_some_and(|r| r.trusted());
        Ok(Some(StoredBlock { block, trusted }))
    }

    fn put(&mut self, height: u64, block: &Block, trusted: bool) -> Result<(), StoreError> {
        let rec = HeaderRecord::for_block(height, block, trusted);
        let existing = self.position(&rec.hash)?;
        let seq = existing.unwrap_or(self.next_seq);
        let block_bytes = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_BLOCKS)?, rec.hash.as_bytes(), &block_bytes);
        batch.put_cf(self.cf_handle(CF_HEADERS)?, seq.to_be_bytes(), rec.to_bytes());
        if existing.is_none() {
            batch.put_cf(self.cf_handle(CF_HEADER_POS)?, rec.hash.as_bytes(), seq.to_be_bytes());
        }
        self.db.write(batch).map_err(backend)?;

        if existing.is_none() {
            self.next_seq += 1;
        }
        debug!(height, hash = %rec.hash, seq, bytes = block_bytes.len(), "block stored");
        Ok(())
    }

    fn mark_invalid(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.set_flag(hash, HEADER_FLAG_INVALID)
    }

    fn mark_trusted(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.set_flag(hash, HEADER_FLAG_TRUSTED)
    }

    fn headers(&self) -> Result<Vec<HeaderRecord>, StoreError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        let mut out = Vec::with_capacity(self.next_seq as usize);
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(backend)?;
            out.push(HeaderRecord::from_bytes(&value)?);
        }
        Ok(out)
    }

    fn stats(&self) -> String {
        format!("BLOCKS: {} records in {}", self.next_seq, self.path.display())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::types::{BlockHeader, OutPoint, Transaction, TxInput, TxOutput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (RocksBlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBlockStore::open(dir.path().join("blocks")).unwrap();
        (store, dir)
    }

    fn make_block(nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_hash: Hash256([1; 32]),
                merkle_root: Hash256([2; 32]),
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::null(),
                    script_sig: vec![0x01, nonce as u8],
                    sequence: u32::MAX,
                }],
                outputs: vec![TxOutput { value: 50, pk_script: vec![0x51] }],
                lock_time: 0,
            }],
        }
    }

    // ------------------------------------------------------------------
    // Payloads
    // ------------------------------------------------------------------

    #[test]
    fn put_then_get() {
        let (mut store, _dir) = temp_store();
        let block = make_block(1);
        store.put(7, &block, true).unwrap();

        let got = store.get(&block.hash()).unwrap().unwrap();
        assert_eq!(got.block, block);
        assert!(got.trusted);
        assert!(store.get(&Hash256([9; 32])).unwrap().is_none());
    }

    #[test]
    fn record_matches_block() {
        let (mut store, _dir) = temp_store();
        let block = make_block(2);
        store.put(3, &block, false).unwrap();

        let rec = store.record(&block.hash()).unwrap().unwrap();
        assert_eq!(rec.height, 3);
        assert_eq!(rec.tx_count, 1);
        assert_eq!(rec.size as usize, block.serialized_size());
        assert_eq!(rec.header, block.header);
        assert!(!rec.trusted());
    }

    // ------------------------------------------------------------------
    // Header log
    // ------------------------------------------------------------------

    #[test]
    fn headers_keep_insertion_order() {
        let (mut store, _dir) = temp_store();
        for (height, nonce) in [(5, 10), (1, 11), (3, 12)] {
            store.put(height, &make_block(nonce), false).unwrap();
        }
        let heights: Vec<u64> = store.headers().unwrap().iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![5, 1, 3]);
    }

    #[test]
    fn repeated_put_rewrites_in_place() {
        let (mut store, _dir) = temp_store();
        let block = make_block(4);
        store.put(1, &block, false).unwrap();
        store.put(2, &make_block(5), false).unwrap();
        store.put(1, &block, true).unwrap();

        let log = store.headers().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].hash, block.hash());
        assert!(log[0].trusted());
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn flags_update_record() {
        let (mut store, _dir) = temp_store();
        let block = make_block(6);
        store.put(1, &block, false).unwrap();

        store.mark_trusted(&block.hash()).unwrap();
        assert!(store.get(&block.hash()).unwrap().unwrap().trusted);
        store.mark_invalid(&block.hash()).unwrap();
        let rec = store.record(&block.hash()).unwrap().unwrap();
        assert!(rec.invalid() && rec.trusted());

        // Unknown hashes are ignored.
        store.mark_invalid(&Hash256([0xee; 32])).unwrap();
        assert_eq!(store.headers().unwrap().len(), 1);
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        {
            let mut store = RocksBlockStore::open(&path).unwrap();
            store.put(1, &make_block(20), false).unwrap();
            store.put(2, &make_block(21), false).unwrap();
            store.close().unwrap();
        }
        let mut store = RocksBlockStore::open(&path).unwrap();
        assert_eq!(store.record_count(), 2);
        store.put(3, &make_block(22), false).unwrap();
        let heights: Vec<u64> = store.headers().unwrap().iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![1, 2, 3]);
        assert!(store.stats().starts_with("BLOCKS: 3 records"));
    }
}
