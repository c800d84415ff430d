//! Record stores — the persistence medium under the resumption cache.
//!
//! A record store is a flat key → blob map with no transactions. The cache
//! never needs more than get/set/delete on a single key; multi-key
//! consistency is its problem, not the store's.
//!
//! Two stores ship here:
//!   - `MemoryRecordStore`: volatile, optionally bounded by total bytes
//!   - `FileRecordStore`: one file per key, content-addressed by key hash:
//!       {root}/{hash[0..2]}/{full_hash}

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use trellis_core::config::{StorageBackend, StorageConfig};
use trellis_core::crypto;
use trellis_core::SessionError;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store is full")]
    Full,

    #[error("record store I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Full => SessionError::StorageFull,
            other => SessionError::StorageError(other.to_string()),
        }
    }
}

/// A stored value. Records may carry secret material, so every copy handed
/// out or held in memory is wiped when dropped.
pub type Blob = Zeroizing<Vec<u8>>;

/// Byte-blob persistence keyed by string.
///
/// `delete` of an absent key succeeds.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Build the store selected by config.
pub fn open_record_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!(max_bytes = config.max_bytes, "using in-memory resumption store");
            Ok(Arc::new(MemoryRecordStore::with_quota(config.max_bytes)))
        }
        StorageBackend::File => {
            let store = FileRecordStore::new(config.path.clone())?;
            tracing::info!(root = %config.path.display(), "using file resumption store");
            Ok(Arc::new(store))
        }
    }
}

// ── Memory ────────────────────────────────────────────────────────────────────

/// In-memory record store. Replaced and deleted values are zeroed.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<DashMap<String, Blob>>,
    used: Arc<AtomicU64>,
    /// 0 = unlimited.
    max_bytes: u64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes once keys + values exceed `max_bytes`.
    pub fn with_quota(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Snapshot of every key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Account for a write that grows an entry from `old` to `new` bytes.
    /// Callers hold the entry's shard lock.
    fn reserve(&self, old: u64, new: u64) -> Result<(), StoreError> {
        if self.max_bytes > 0 && self.used_bytes().saturating_sub(old) + new > self.max_bytes {
            return Err(StoreError::Full);
        }
        self.used.fetch_add(new, Ordering::Relaxed);
        Ok(())
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.records.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let new_size = entry_size(key, value);
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let old_size = entry_size(key, slot.get());
                self.reserve(old_size, new_size)?;
                // The replaced blob is wiped as it drops.
                slot.insert(Zeroizing::new(value.to_vec()));
                self.used.fetch_sub(old_size, Ordering::Relaxed);
            }
            Entry::Vacant(slot) => {
                self.reserve(0, new_size)?;
                slot.insert(Zeroizing::new(value.to_vec()));
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some((k, v)) = self.records.remove(key) {
            self.used.fetch_sub(entry_size(&k, &v), Ordering::Relaxed);
        }
        Ok(())
    }
}

// ── File ──────────────────────────────────────────────────────────────────────

/// Directory-backed record store.
///
/// Writes are atomic: write to temp file, sync, then rename. A crash leaves
/// either the old blob or the new one, never a torn mix.
#[derive(Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Filesystem path for a key. Keys contain '/', so they are hashed.
    fn record_path(&self, key: &str) -> PathBuf {
        let hex = hex::encode(crypto::hash(key.as_bytes()));
        // Two-level: records/ab/abc123...
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Count stored records (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|f| f.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

fn io_error(key: &str, source: std::io::Error) -> StoreError {
    if source.kind() == std::io::ErrorKind::StorageFull {
        return StoreError::Full;
    }
    StoreError::Io {
        key: key.to_string(),
        source,
    }
}

impl RecordStore for FileRecordStore {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        match fs::read(self.record_path(key)) {
            Ok(data) => Ok(Some(Zeroizing::new(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(key, e))?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| io_error(key, e))?;
            file.write_all(value).map_err(|e| io_error(key, e))?;
            file.sync_all().map_err(|e| io_error(key, e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| io_error(key, e))?;

        tracing::trace!(key, bytes = value.len(), "record written");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}
