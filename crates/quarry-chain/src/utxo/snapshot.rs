//! UTXO snapshot files.
//!
//! Layout of `UTXO.db`:
//!
//! ```text
//! u64 LE   last applied height
//! [u8; 32] last applied block hash
//! u64 LE   record count
//! entries  (varint length, txid, compact record), see `record`
//! [u8; 32] SHA-256 of everything above
//! ```
//!
//! A save first renames `UTXO.db` to `UTXO.old`, then a background thread
//! writes `<hash>.db.tmp` and renames it to `UTXO.db` when complete. The
//! thread holds the live map's read lock for the whole write, so the owner
//! must abort it before mutating.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use quarry_core::error::StoreError;
use quarry_core::types::Hash256;
use quarry_core::varint::MAX_VARINT_LEN;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::record::write_entry;

pub const SNAPSHOT_FILE: &str = "UTXO.db";
pub const BACKUP_FILE: &str = "UTXO.old";
const TMP_SUFFIX: &str = ".db.tmp";

/// Bytes buffered before handing a chunk to the file.
const CHUNK_SIZE: usize = 64 * 1024;

/// Live UTXO map: txid to compact record.
pub type LiveMap = HashMap<Hash256, Vec<u8>>;

#[derive(Debug, Default)]
pub struct Snapshot {
    pub height: u64,
    pub hash: Hash256,
    pub map: LiveMap,
}

/// Delete leftover temp files from an interrupted save.
pub fn remove_stale_temps(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if is_tmp {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Load `UTXO.db`, falling back to `UTXO.old`, then to an empty set.
pub fn load_with_fallback(dir: &Path) -> Snapshot {
    for name in [SNAPSHOT_FILE, BACKUP_FILE] {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        match load(&path) {
            Ok(snap) => {
                info!(file = name, height = snap.height, records = snap.map.len(), "loaded utxo snapshot");
                return snap;
            }
            Err(e) => warn!(file = name, error = %e, "utxo snapshot unusable"),
        }
    }
    info!("no utxo snapshot, starting empty");
    Snapshot::default()
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

fn read_varint<R: Read>(r: &mut R) -> Result<u64, StoreError> {
    let mut value = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        r.read_exact(&mut byte)?;
        let shift = 7 * i as u32;
        let payload = u64::from(byte[0] & 0x7f);
        if shift == 63 && payload > 1 {
            break;
        }
        value |= payload << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StoreError::Corrupt("snapshot: bad varint".into()))
}

/// Read and verify one snapshot file.
pub fn load(path: &Path) -> Result<Snapshot, StoreError> {
    let file = fs::File::open(path)?;
    let mut rd = HashingReader {
        inner: BufReader::with_capacity(1 << 20, file),
        hasher: Sha256::new(),
    };

    let height = read_u64(&mut rd)?;
    let mut hash = [0u8; 32];
    rd.read_exact(&mut hash)?;
    let count = read_u64(&mut rd)?;

    let mut map = HashMap::with_capacity(count.min(1 << 24) as usize);
    for _ in 0..count {
        let len = read_varint(&mut rd)?;
        if !(32..=(1 << 24)).contains(&len) {
            return Err(StoreError::Corrupt(format!("snapshot: entry length {len}")));
        }
        let mut txid = [0u8; 32];
        rd.read_exact(&mut txid)?;
        let mut record = vec![0u8; len as usize - 32];
        rd.read_exact(&mut record)?;
        map.insert(Hash256(txid), record);
    }

    let expected: [u8; 32] = rd.hasher.finalize_reset().into();
    let mut stored = [0u8; 32];
    rd.inner.read_exact(&mut stored)?;
    if stored != expected {
        return Err(StoreError::Corrupt("snapshot: checksum mismatch".into()));
    }
    let mut rest = [0u8; 1];
    if rd.inner.read(&mut rest)? != 0 {
        return Err(StoreError::Corrupt("snapshot: trailing bytes".into()));
    }

    Ok(Snapshot { height, hash: Hash256(hash), map })
}

/// Handle to an in-flight background save.
#[derive(Debug)]
pub struct SnapshotWriter {
    handle: Option<JoinHandle<Result<bool, StoreError>>>,
    abort: Arc<AtomicBool>,
    hurry: Arc<AtomicBool>,
    height: u64,
}

impl SnapshotWriter {
    /// Move the current snapshot aside and start writing `map` at
    /// (`height`, `hash`) in the background, aiming to take `target`.
    pub fn start(
        dir: &Path,
        map: Arc<RwLock<LiveMap>>,
        height: u64,
        hash: Hash256,
        target: Duration,
    ) -> Result<Self, StoreError> {
        let current = dir.join(SNAPSHOT_FILE);
        if current.exists() {
            fs::rename(&current, dir.join(BACKUP_FILE))?;
        }

        let abort = Arc::new(AtomicBool::new(false));
        let hurry = Arc::new(AtomicBool::new(false));
        let job = WriteJob {
            dir: dir.to_path_buf(),
            map,
            height,
            hash,
            target,
            abort: abort.clone(),
            hurry: hurry.clone(),
        };
        let handle = thread::Builder::new()
            .name("utxo-save".into())
            .spawn(move || job.run())?;
        debug!(height, "utxo snapshot started");
        Ok(Self { handle: Some(handle), abort, hurry, height })
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop pacing and write as fast as possible.
    pub fn hurry_up(&self) {
        self.hurry.store(true, Ordering::Relaxed);
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Wait for the thread. `Ok(true)` means a complete snapshot was renamed
    /// into place.
    pub fn join(mut self) -> Result<bool, StoreError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<bool, StoreError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| StoreError::Corrupt("snapshot writer panicked".into()))?,
            None => Ok(false),
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abort();
            let _ = self.join_inner();
        }
    }
}

struct WriteJob {
    dir: PathBuf,
    map: Arc<RwLock<LiveMap>>,
    height: u64,
    hash: Hash256,
    target: Duration,
    abort: Arc<AtomicBool>,
    hurry: Arc<AtomicBool>,
}

impl WriteJob {
    fn run(self) -> Result<bool, StoreError> {
        let tmp = self.dir.join(format!("{}{TMP_SUFFIX}", self.hash));
        let result = self.write(&tmp);
        match &result {
            Ok(true) => {}
            Ok(false) => {
                info!(height = self.height, "utxo snapshot aborted");
                let _ = fs::remove_file(&tmp);
            }
            Err(e) => {
                warn!(height = self.height, error = %e, "utxo snapshot failed");
                let _ = fs::remove_file(&tmp);
            }
        }
        result
    }

    fn write(&self, tmp: &Path) -> Result<bool, StoreError> {
        let start = Instant::now();
        let mut out = BufWriter::with_capacity(1 << 20, fs::File::create(tmp)?);
        let mut hasher = Sha256::new();
        let mut chunk = Vec::with_capacity(2 * CHUNK_SIZE);

        let map = self.map.read();
        let total = map.len();
        chunk.extend_from_slice(&self.height.to_le_bytes());
        chunk.extend_from_slice(self.hash.as_bytes());
        chunk.extend_from_slice(&(total as u64).to_le_bytes());

        for (done, (txid, record)) in map.iter().enumerate() {
            write_entry(&mut chunk, txid, record);
            if chunk.len() >= CHUNK_SIZE {
                hasher.update(&chunk);
                out.write_all(&chunk)?;
                chunk.clear();
                if !self.pace(start, done + 1, total) {
                    return Ok(false);
                }
            } else if done & 0x3f == 0 && self.abort.load(Ordering::Relaxed) {
                return Ok(false);
            }
        }
        drop(map);

        hasher.update(&chunk);
        out.write_all(&chunk)?;
        out.write_all(&hasher.finalize())?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if self.abort.load(Ordering::Relaxed) {
            return Ok(false);
        }
        fs::rename(tmp, self.dir.join(SNAPSHOT_FILE))?;
        info!(
            height = self.height,
            records = total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "utxo snapshot written"
        );
        Ok(true)
    }

    /// Sleep while ahead of the write-time target. Returns false on abort.
    fn pace(&self, start: Instant, done: usize, total: usize) -> bool {
        loop {
            if self.abort.load(Ordering::Relaxed) {
                return false;
            }
            if self.hurry.load(Ordering::Relaxed) || total == 0 {
                return true;
            }
            let data_progress = done as f64 / total as f64;
            let time_progress = start.elapsed().as_secs_f64() / self.target.as_secs_f64().max(1e-3);
            if data_progress <= time_progress {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map(n: u8) -> LiveMap {
        (0..n).map(|i| (Hash256([i; 32]), vec![i, 2, 0, 7, 1, 0x51])).collect()
    }

    fn save_blocking(dir: &Path, map: LiveMap, height: u64) -> bool {
        let live = Arc::new(RwLock::new(map));
        SnapshotWriter::start(dir, live, height, Hash256([height as u8; 32]), Duration::ZERO)
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_blocking(dir.path(), sample_map(20), 42));
        let snap = load(&dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert_eq!(snap.height, 42);
        assert_eq!(snap.hash, Hash256([42; 32]));
        assert_eq!(snap.map, sample_map(20));
    }

    #[test]
    fn second_save_keeps_previous_as_backup() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_blocking(dir.path(), sample_map(3), 1));
        assert!(save_blocking(dir.path(), sample_map(5), 2));
        assert_eq!(load(&dir.path().join(BACKUP_FILE)).unwrap().height, 1);
        assert_eq!(load(&dir.path().join(SNAPSHOT_FILE)).unwrap().height, 2);
    }

    #[test]
    fn corrupt_file_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_blocking(dir.path(), sample_map(3), 1));
        assert!(save_blocking(dir.path(), sample_map(5), 2));
        let current = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = fs::read(&current).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&current, bytes).unwrap();

        assert!(matches!(load(&current), Err(StoreError::Corrupt(_))));
        let snap = load_with_fallback(dir.path());
        assert_eq!(snap.height, 1);
        assert_eq!(snap.map.len(), 3);
    }

    #[test]
    fn missing_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = load_with_fallback(dir.path());
        assert_eq!(snap.height, 0);
        assert!(snap.map.is_empty());
    }

    #[test]
    fn aborted_save_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let map: LiveMap = (0..5_000u32)
            .map(|i| {
                let mut k = [0u8; 32];
                k[..4].copy_from_slice(&i.to_le_bytes());
                (Hash256(k), vec![0u8; 64])
            })
            .collect();
        let live = Arc::new(RwLock::new(map));
        let writer =
            SnapshotWriter::start(dir.path(), live, 9, Hash256([9; 32]), Duration::from_secs(3600))
                .unwrap();
        writer.abort();
        assert!(!writer.join().unwrap());
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
        assert_eq!(remove_stale_temps(dir.path()).unwrap(), 0);
    }

    #[test]
    fn stale_temps_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!("abc{TMP_SUFFIX}")), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        assert_eq!(remove_stale_temps(dir.path()).unwrap(), 1);
        assert!(dir.path().join("keep.txt").exists());
    }
}
