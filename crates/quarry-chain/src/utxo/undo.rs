//! Bounded undo log.
//!
//! The ring holds one undo record per recent height, in slot `height %
//! window`, so writing height `H` evicts `H - window`. On disk each slot is a
//! file `undo/<slot>` holding the height, the block hash, a varint record
//! count and the consumed records as entries. Files are written to
//! `undo/tmp`, synced and renamed into place.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use quarry_core::error::StoreError;
use quarry_core::types::Hash256;
use quarry_core::varint::{Cursor, write_varint};
use tracing::{debug, warn};

use super::record::UtxoRecord;

const HEADER_LEN: usize = 8 + 32;
const TMP_NAME: &str = "tmp";

/// Outputs consumed by one block, needed to reverse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub height: u64,
    pub hash: Hash256,
    /// Each record carries only the outputs the block spent.
    pub records: Vec<UtxoRecord>,
}

impl UndoRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8 + self.records.len() * 64);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        write_varint(&mut buf, self.records.len() as u64);
        for rec in &self.records {
            rec.write_entry(&mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, StoreError> {
        let mut cur = Cursor::new(data);
        let (height, hash) = read_header(&mut cur)?;
        let count = cur
            .varint()
            .ok_or_else(|| StoreError::Corrupt("undo record: truncated count".into()))?;
        let mut records = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            records.push(UtxoRecord::read_entry(&mut cur)?);
        }
        if !cur.is_empty() {
            return Err(StoreError::Corrupt("undo record: trailing bytes".into()));
        }
        Ok(Self { height, hash, records })
    }
}

fn read_header(cur: &mut Cursor<'_>) -> Result<(u64, Hash256), StoreError> {
    let height = cur
        .u64_le()
        .ok_or_else(|| StoreError::Corrupt("undo record: truncated height".into()))?;
    let hash = cur
        .array::<32>()
        .ok_or_else(|| StoreError::Corrupt("undo record: truncated hash".into()))?;
    Ok((height, Hash256(hash)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    height: u64,
    hash: Hash256,
}

#[derive(Debug)]
pub struct UndoRing {
    /// `None` keeps records in memory only.
    dir: Option<PathBuf>,
    window: u64,
    slots: Vec<Option<Slot>>,
    memory: HashMap<usize, UndoRecord>,
}

impl UndoRing {
    /// In-memory ring.
    pub fn volatile(window: u64) -> Self {
        let window = window.max(1);
        Self {
            dir: None,
            window,
            slots: vec![None; window as usize],
            memory: HashMap::new(),
        }
    }

    /// Open the ring stored in `dir`, keeping only slots whose height lies in
    /// `(last_height - window, last_height]`.
    pub fn open(dir: PathBuf, window: u64, last_height: u64) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir)?;
        let _ = fs::remove_file(dir.join(TMP_NAME));

        let mut ring = Self {
            dir: Some(dir),
            ..Self::volatile(window)
        };
        let lowest = last_height.saturating_sub(ring.window);
        for slot in 0..ring.window as usize {
            let path = ring.slot_path(slot);
            if !path.exists() {
                continue;
            }
            match read_slot_header(&path) {
                Ok(s) if s.height > lowest && s.height <= last_height && ring.slot_of(s.height) == slot => {
                    ring.slots[slot] = Some(s);
                }
                Ok(s) => {
                    debug!(slot, height = s.height, "discarding stale undo slot");
                    fs::remove_file(&path)?;
                }
                Err(e) => {
                    warn!(slot, error = %e, "discarding unreadable undo slot");
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(ring)
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    fn slot_of(&self, height: u64) -> usize {
        (height % self.window) as usize
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.join(slot.to_string()),
            None => PathBuf::new(),
        }
    }

    /// Store `rec` durably, replacing whatever occupied its slot.
    pub fn put(&mut self, rec: &UndoRecord) -> Result<(), StoreError> {
        let slot = self.slot_of(rec.height);
        match &self.dir {
            Some(dir) => {
                let tmp = dir.join(TMP_NAME);
                let mut file = fs::File::create(&tmp)?;
                file.write_all(&rec.encode())?;
                file.sync_all()?;
                drop(file);
                fs::rename(&tmp, self.slot_path(slot))?;
            }
            None => {
                self.memory.insert(slot, rec.clone());
            }
        }
        self.slots[slot] = Some(Slot { height: rec.height, hash: rec.hash });
        Ok(())
    }

    /// The undo record for `height`, if the ring still holds it.
    pub fn get(&self, height: u64) -> Result<Option<UndoRecord>, StoreError> {
        let slot = self.slot_of(height);
        match self.slots[slot] {
            Some(s) if s.height == height => {}
            _ => return Ok(None),
        }
        let rec = match &self.dir {
            Some(_) => UndoRecord::decode(&fs::read(self.slot_path(slot))?)?,
            None => match self.memory.get(&slot) {
                Some(rec) => rec.clone(),
                None => return Ok(None),
            },
        };
        if rec.height != height {
            return Err(StoreError::HeightMismatch { expected: height, got: rec.height });
        }
        Ok(Some(rec))
    }

    pub fn contains(&self, height: u64) -> bool {
        matches!(self.slots[self.slot_of(height)], Some(s) if s.height == height)
    }

    /// Drop the record for `height`, if present.
    pub fn remove(&mut self, height: u64) -> Result<(), StoreError> {
        if self.contains(height) {
            self.clear(self.slot_of(height))?;
        }
        Ok(())
    }

    /// Drop whatever occupies the slot `height` maps to.
    pub fn evict_slot_of(&mut self, height: u64) -> Result<(), StoreError> {
        self.clear(self.slot_of(height))
    }

    fn clear(&mut self, slot: usize) -> Result<(), StoreError> {
        if self.slots[slot].take().is_some() {
            match &self.dir {
                Some(_) => match fs::remove_file(self.slot_path(slot)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
                None => {
                    self.memory.remove(&slot);
                }
            }
        }
        Ok(())
    }

    /// Number of heights with an undo record.
    pub fn depth(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Keep only records for which `keep(height, hash)` holds. Returns how
    /// many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(u64, &Hash256) -> bool) -> Result<usize, StoreError> {
        let mut dropped = 0;
        for slot in 0..self.slots.len() {
            if let Some(s) = self.slots[slot] {
                if !keep(s.height, &s.hash) {
                    self.clear(slot)?;
                    dropped += 1;
                }
            }
        }
        Ok(dropped)
    }
}

fn read_slot_header(path: &std::path::Path) -> Result<Slot, StoreError> {
    let mut raw = [0u8; HEADER_LEN];
    fs::File::open(path)?.read_exact(&mut raw)?;
    let (height, hash) = read_header(&mut Cursor::new(&raw))?;
    Ok(Slot { height, hash })
}
