//! Transactional UTXO store.
//!
//! The live set is an in-memory map from txid to compact record bytes,
//! shared (behind a read/write lock) with the background snapshot writer.
//! Durability comes from three pieces:
//!
//! - snapshots (`UTXO.db`), written at idle time by [`snapshot`];
//! - the undo ring ([`undo`]), one record per recent block, written before
//!   the block's changes are applied;
//! - the caller's block store, which can replay blocks past the snapshot.
//!
//! Every mutation first aborts an in-flight snapshot.

pub mod record;
pub mod snapshot;
pub mod undo;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use quarry_core::constants::{OP_RETURN, UNDO_WINDOW};
use quarry_core::error::StoreError;
use quarry_core::types::{Block, Hash256, OutPoint};
use tracing::{debug, info, warn};

pub use record::{UnspentOutput, UtxoOutput, UtxoRecord};
pub use snapshot::LiveMap;
pub use undo::{UndoRecord, UndoRing};

use crate::apply::BlockChanges;
use snapshot::SnapshotWriter;

#[derive(Debug, Clone)]
pub struct UtxoOptions {
    /// Directory for `UTXO.db`, `UTXO.old` and `undo/`. `None` keeps
    /// everything in memory and never touches the disk.
    pub dir: Option<PathBuf>,
    /// Number of recent blocks that can be undone.
    pub undo_window: u64,
    /// How long a background save should take when not hurried.
    pub write_target: Duration,
    /// Idle saves start only when the live set is more than this many
    /// blocks away from the last snapshot.
    pub skip_save_blocks: u64,
}

impl Default for UtxoOptions {
    fn default() -> Self {
        Self {
            dir: None,
            undo_window: UNDO_WINDOW,
            write_target: Duration::from_secs(5 * 60),
            skip_save_blocks: 0,
        }
    }
}

impl UtxoOptions {
    pub fn volatile() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()), ..Self::default() }
    }
}

/// Aggregate figures over the whole live set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoStats {
    pub records: usize,
    pub outputs: u64,
    pub total_value: u64,
    pub coinbase_value: u64,
    /// Bytes of record data plus per-key overhead.
    pub data_bytes: u64,
    /// Outputs whose script starts with `OP_RETURN`.
    pub unspendable_outputs: u64,
    pub unspendable_bytes: u64,
    /// Records holding nothing but unspendable outputs.
    pub unspendable_records: u64,
    pub last_height: u64,
    pub last_hash: Hash256,
    pub dirty: bool,
    pub writing: bool,
    pub undo_depth: usize,
}

impl fmt::Display for UtxoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coins = |v: u64| v as f64 / 1e8;
        writeln!(
            f,
            "UNSPENT: {:.8} in {} outs from {} txs. {:.8} in coinbase.",
            coins(self.total_value),
            self.outputs,
            self.records,
            coins(self.coinbase_value)
        )?;
        writeln!(
            f,
            " TotalData:{:.1}MB  Dirty:{}  Writing:{}  UndoDepth:{}",
            self.data_bytes as f64 / 1e6,
            self.dirty,
            self.writing,
            self.undo_depth
        )?;
        writeln!(f, " Last Block : {} @ {}", self.last_hash, self.last_height)?;
        write!(
            f,
            " Unspendable outputs: {} ({}KB)  txs:{}",
            self.unspendable_outputs,
            self.unspendable_bytes >> 10,
            self.unspendable_records
        )
    }
}

#[derive(Debug)]
pub struct UtxoStore {
    options: UtxoOptions,
    map: Arc<RwLock<LiveMap>>,
    last_height: u64,
    last_hash: Hash256,
    on_disk_height: u64,
    dirty: bool,
    undo: UndoRing,
    writer: Option<SnapshotWriter>,
}

impl UtxoStore {
    /// Open the store described by `options`, loading the newest usable
    /// snapshot and the undo records that match it.
    pub fn open(options: UtxoOptions) -> Result<Self, StoreError> {
        let Some(dir) = options.dir.clone() else {
            return Ok(Self::empty(options));
        };

        std::fs::create_dir_all(&dir)?;
        let removed = snapshot::remove_stale_temps(&dir)?;
        if removed > 0 {
            debug!(removed, "removed stale snapshot temp files");
        }

        let snap = snapshot::load_with_fallback(&dir);
        let undo = UndoRing::open(dir.join("undo"), options.undo_window, snap.height)?;
        info!(
            height = snap.height,
            hash = %snap.hash,
            records = snap.map.len(),
            undo_depth = undo.depth(),
            "utxo store opened"
        );
        Ok(Self {
            map: Arc::new(RwLock::new(snap.map)),
            last_height: snap.height,
            last_hash: snap.hash,
            on_disk_height: snap.height,
            dirty: false,
            undo,
            writer: None,
            options,
        })
    }

    fn empty(options: UtxoOptions) -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            last_height: 0,
            last_hash: Hash256::ZERO,
            on_disk_height: 0,
            dirty: false,
            undo: UndoRing::volatile(options.undo_window),
            writer: None,
            options,
        }
    }

    pub fn is_volatile(&self) -> bool {
        self.options.dir.is_none()
    }

    /// Height and hash of the last applied block.
    pub fn last_block(&self) -> (u64, Hash256) {
        (self.last_height, self.last_hash)
    }

    pub fn undo_window(&self) -> u64 {
        self.undo.window()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.depth()
    }

    pub fn has_undo(&self, height: u64) -> bool {
        self.undo.contains(height)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StoreError> {
        let map = self.map.read();
        match map.get(&outpoint.txid) {
            Some(bytes) => UtxoRecord::decode_output(bytes, outpoint.index),
            None => Ok(None),
        }
    }

    pub fn get_record(&self, txid: &Hash256) -> Result<Option<UtxoRecord>, StoreError> {
        let map = self.map.read();
        map.get(txid).map(|b| UtxoRecord::decode(*txid, b)).transpose()
    }

    /// Whether any output of `txid` is unspent.
    pub fn tx_present(&self, txid: &Hash256) -> bool {
        self.map.read().contains_key(txid)
    }

    /// Sorted copy of the live map, for comparisons.
    pub fn dump(&self) -> BTreeMap<Hash256, Vec<u8>> {
        self.map.read().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Apply a block's changes and make it the last applied block.
    ///
    /// The undo record (if any) reaches disk before the live map changes.
    pub fn commit(&mut self, changes: &BlockChanges, hash: Hash256) -> Result<(), StoreError> {
        self.abort_writing();

        match &changes.undo {
            Some(records) => self.undo.put(&UndoRecord {
                height: changes.height,
                hash,
                records: records.clone(),
            })?,
            None => self.undo.evict_slot_of(changes.height)?,
        }

        {
            let mut map = self.map.write();
            for rec in &changes.added {
                if map.insert(rec.txid, rec.encode()).is_some() {
                    warn!(txid = %rec.txid, height = changes.height, "overwrote existing utxo record");
                }
            }
            for (txid, indices) in &changes.spent {
                let Some(bytes) = map.get(txid) else {
                    warn!(%txid, height = changes.height, "spent record not in utxo set");
                    continue;
                };
                let mut rec = UtxoRecord::decode(*txid, bytes)?;
                for index in indices {
                    rec.take(*index);
                }
                if rec.is_empty() {
                    map.remove(txid);
                } else {
                    map.insert(*txid, rec.encode());
                }
            }
        }

        self.last_height = changes.height;
        self.last_hash = hash;
        self.dirty = true;
        Ok(())
    }

    /// Reverse `block`, which must be the last applied block at `height`.
    pub fn undo(&mut self, block: &Block, height: u64, parent_hash: Hash256) -> Result<(), StoreError> {
        if height != self.last_height {
            return Err(StoreError::HeightMismatch { expected: self.last_height, got: height });
        }
        let rec = self
            .undo
            .get(height)?
            .ok_or(StoreError::UndoMissing { height })?;
        if rec.hash != block.hash() {
            return Err(StoreError::Corrupt(format!(
                "undo record at height {height} is for block {}, not {}",
                rec.hash,
                block.hash()
            )));
        }

        self.abort_writing();
        {
            let mut map = self.map.write();
            for tx in &block.transactions {
                map.remove(&tx.txid());
            }
            for spent in rec.records {
                let merged = match map.get(&spent.txid) {
                    Some(bytes) => {
                        let mut existing = UtxoRecord::decode(spent.txid, bytes)?;
                        existing.merge(spent);
                        existing
                    }
                    None => spent,
                };
                map.insert(merged.txid, merged.encode());
            }
        }

        self.undo.remove(height)?;
        self.last_height = height - 1;
        self.last_hash = parent_hash;
        self.dirty = true;
        debug!(height, "utxo block undone");
        Ok(())
    }

    /// Drop undo records for which `keep(height, hash)` is false.
    pub fn retain_undo(&mut self, keep: impl FnMut(u64, &Hash256) -> bool) -> Result<usize, StoreError> {
        self.undo.retain(keep)
    }

    /// Idle-time housekeeping: reap a finished writer and start a new save
    /// when the live set has drifted far enough from the last snapshot.
    /// Returns whether a save was started.
    pub fn idle(&mut self) -> bool {
        if self.is_volatile() {
            return false;
        }
        self.reap_writer();
        if self.dirty
            && self.writer.is_none()
            && self.last_height.abs_diff(self.on_disk_height) > self.options.skip_save_blocks
        {
            return self.save();
        }
        false
    }

    /// Start a background save unless one is already running.
    pub fn save(&mut self) -> bool {
        let Some(dir) = self.options.dir.clone() else {
            return false;
        };
        if self.writer.is_some() {
            return false;
        }
        match SnapshotWriter::start(
            &dir,
            self.map.clone(),
            self.last_height,
            self.last_hash,
            self.options.write_target,
        ) {
            Ok(writer) => {
                info!(height = self.last_height, "utxo snapshot save started");
                self.writer = Some(writer);
                true
            }
            Err(e) => {
                warn!(error = %e, "could not start utxo snapshot");
                false
            }
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn hurry_up(&self) {
        if let Some(w) = &self.writer {
            w.hurry_up();
        }
    }

    /// Stop an in-flight save and wait for it to clean up.
    pub fn abort_writing(&mut self) {
        if let Some(w) = &self.writer {
            w.abort();
        }
        self.finish_writer();
    }

    fn reap_writer(&mut self) {
        if self.writer.as_ref().is_some_and(SnapshotWriter::is_finished) {
            self.finish_writer();
        }
    }

    fn finish_writer(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let height = writer.height();
        match writer.join() {
            // A completed save means nothing changed while it ran.
            Ok(true) => {
                self.on_disk_height = height;
                if self.last_height == height {
                    self.dirty = false;
                }
            }
            Ok(false) => {}
            Err(e) => warn!(height, error = %e, "utxo snapshot writer failed"),
        }
    }

    /// Flush to disk and stop the writer.
    pub fn close(&mut self) {
        self.hurry_up();
        if self.dirty && self.writer.is_none() {
            self.save();
        }
        self.hurry_up();
        self.finish_writer();
        info!(height = self.last_height, dirty = self.dirty, "utxo store closed");
    }

    pub fn stats(&self) -> String {
        format!(
            "UNSPENT: {} records. Dirty:{}  Writing:{}  UndoDepth:{}\n Last Block : {} @ {}",
            self.len(),
            self.dirty,
            self.is_writing(),
            self.undo.depth(),
            self.last_hash,
            self.last_height
        )
    }

    /// Full scan of the live set.
    pub fn utxo_stats(&self) -> Result<UtxoStats, StoreError> {
        let mut stats = UtxoStats {
            last_height: self.last_height,
            last_hash: self.last_hash,
            dirty: self.dirty,
            writing: self.is_writing(),
            undo_depth: self.undo.depth(),
            ..UtxoStats::default()
        };
        let map = self.map.read();
        stats.records = map.len();
        for (txid, bytes) in map.iter() {
            stats.data_bytes += (bytes.len() + 32) as u64;
            let rec = UtxoRecord::decode(*txid, bytes)?;
            let mut spendable = false;
            for out in rec.outputs.iter().flatten() {
                stats.outputs += 1;
                stats.total_value = stats.total_value.saturating_add(out.value);
                if rec.coinbase {
                    stats.coinbase_value = stats.coinbase_value.saturating_add(out.value);
                }
                if is_unspendable(&out.pk_script) {
                    stats.unspendable_outputs += 1;
                    stats.unspendable_bytes += 8 + out.pk_script.len() as u64;
                } else {
                    spendable = true;
                }
            }
            if !spendable {
                stats.unspendable_records += 1;
            }
        }
        Ok(stats)
    }

    /// Delete records that hold only unspendable outputs and, with `all`,
    /// strip unspendable outputs from the remaining records as well.
    /// Returns (records removed, outputs removed).
    pub fn purge_unspendable(&mut self, all: bool) -> Result<(usize, usize), StoreError> {
        self.abort_writing();
        let mut records_removed = 0;
        let mut outputs_removed = 0;
        let mut map = self.map.write();
        let mut rewrites = Vec::new();
        for (txid, bytes) in map.iter() {
            let mut rec = UtxoRecord::decode(*txid, bytes)?;
            let mut stripped = 0;
            let mut spendable = false;
            for slot in rec.outputs.iter_mut() {
                let unspendable = match slot {
                    Some(out) => is_unspendable(&out.pk_script),
                    None => continue,
                };
                if !unspendable {
                    spendable = true;
                } else if all {
                    *slot = None;
                    stripped += 1;
                }
            }
            if !spendable {
                rewrites.push((*txid, None));
            } else if stripped > 0 {
                outputs_removed += stripped;
                rewrites.push((*txid, Some(rec.encode())));
            }
        }
        for (txid, bytes) in rewrites {
            match bytes {
                Some(bytes) => {
                    map.insert(txid, bytes);
                }
                None => {
                    map.remove(&txid);
                    records_removed += 1;
                }
            }
        }
        drop(map);
        if records_removed + outputs_removed > 0 {
            self.dirty = true;
        }
        info!(records_removed, outputs_removed, "purged unspendable outputs");
        Ok((records_removed, outputs_removed))
    }
}

impl Drop for UtxoStore {
    fn drop(&mut self) {
        self.abort_writing();
    }
}

fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}
