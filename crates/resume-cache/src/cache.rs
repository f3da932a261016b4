//! Resume cache implementations.
//!
//! The file-backed store keeps every record in a single JSON object under
//! `~/.config/blockput/resume.json`, keyed by record key.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use blockput_protocol::ChunkReceipt;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Receipts of one attempt, indexed by chunk. Empty slots were never
/// accepted.
pub type ResumeRecord = Vec<Option<ChunkReceipt>>;

/// How long uploaded blocks may be reused: 100 minutes.
pub const DEFAULT_RESUME_TTL: Duration = Duration::from_secs(100 * 60);

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache directory not available")]
    NoCacheDir,
}

/// Keyed persistent store of resume records.
pub trait ResumeCache: Send + Sync {
    /// Returns the record stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<ResumeRecord>, CacheError>;

    /// Replaces the record stored under `key`.
    fn set(&self, key: &str, record: &[Option<ChunkReceipt>]) -> Result<(), CacheError>;

    /// Removes the record stored under `key`.
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Default record key: the total file size in decimal.
pub fn size_key(total_size: u64) -> String {
    total_size.to_string()
}

/// A record is expired when its first timestamped receipt is older than
/// `ttl`. Records without any receipt are treated as expired.
pub fn record_expired(record: &[Option<ChunkReceipt>], ttl: Duration, now: DateTime<Utc>) -> bool {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    match record.iter().flatten().next() {
        Some(receipt) => receipt.is_expired(ttl, now),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// MemoryResumeCache
// ---------------------------------------------------------------------------

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryResumeCache {
    records: Mutex<HashMap<String, ResumeRecord>>,
}

impl MemoryResumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a record is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

impl ResumeCache for MemoryResumeCache {
    fn get(&self, key: &str) -> Result<Option<ResumeRecord>, CacheError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    fn set(&self, key: &str, record: &[Option<ChunkReceipt>]) -> Result<(), CacheError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileResumeCache
// ---------------------------------------------------------------------------

/// Single-file JSON store shared by every upload on this machine.
#[derive(Debug)]
pub struct JsonFileResumeCache {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonFileResumeCache {
    /// Opens the store at the default location and purges expired records.
    pub fn open_default(ttl: Duration) -> Result<Self, CacheError> {
        let base = config_dir().ok_or(CacheError::NoCacheDir)?;
        Self::open(resume_file_in(&base), ttl)
    }

    /// Opens the store at `path` and purges expired records.
    pub fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self, CacheError> {
        let cache = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        let purged = cache.clear_expired(ttl, Utc::now())?;
        if purged > 0 {
            debug!(path = %cache.path.display(), purged, "purged expired resume records");
        }
        Ok(cache)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops every expired record. Returns how many were removed.
    pub fn clear_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_in(&self.path)?;
        let before = records.len();
        records.retain(|_, record| !record_expired(record, ttl, now));
        let removed = before - records.len();
        if removed > 0 {
            store_in(&self.path, &records)?;
        }
        Ok(removed)
    }
}

impl ResumeCache for JsonFileResumeCache {
    fn get(&self, key: &str) -> Result<Option<ResumeRecord>, CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_in(&self.path)?;
        Ok(records.remove(key))
    }

    fn set(&self, key: &str, record: &[Option<ChunkReceipt>]) -> Result<(), CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_in(&self.path)?;
        records.insert(key.to_string(), record.to_vec());
        store_in(&self.path, &records)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = load_in(&self.path)?;
        if records.remove(key).is_some() {
            store_in(&self.path, &records)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal functions accepting an explicit path (testable).
// ---------------------------------------------------------------------------

fn resume_file_in(config_base: &Path) -> PathBuf {
    config_base.join("blockput").join("resume.json")
}

fn load_in(path: &Path) -> Result<BTreeMap<String, ResumeRecord>, CacheError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() {
        return Ok(BTreeMap::new());
    }
    match serde_json::from_slice(&content) {
        Ok(records) => Ok(records),
        Err(e) => {
            // A corrupt store only costs re-uploading; start over.
            warn!(path = %path.display(), error = %e, "discarding unreadable resume cache");
            Ok(BTreeMap::new())
        }
    }
}

fn store_in(path: &Path, records: &BTreeMap<String, ResumeRecord>) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(records)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
