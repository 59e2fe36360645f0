//! Persistent cache of negotiated session keys, keyed by account fingerprint.
//!
//! Entries live in memory and are mirrored to a single JSON file. Readers
//! share an `RwLock`; writers are serialized and replace the file atomically.
//! A missing, unreadable or corrupt file is a cache miss, never an error.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::SessionKeys;
use crate::utils::{atomic_write, short_fingerprint};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<String, SessionKeys>,
}

/// Session key cache.
#[derive(Debug)]
pub struct SessionKeyStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, SessionKeys>>,
    writer: Mutex<()>,
}

impl SessionKeyStore {
    /// Open (or lazily create) a cache file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        Self {
            path: Some(path),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        }
    }

    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keys for `fingerprint` that are still valid at `now`.
    pub fn get(&self, fingerprint: &str, now: u64) -> Option<SessionKeys> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        match entries.get(fingerprint) {
            Some(keys) if keys.is_expired_at(now) => {
                debug!("Cached keys for {} expired at {}", short_fingerprint(fingerprint), keys.expires_at());
                None
            }
            Some(keys) => Some(keys.clone()),
            None => None,
        }
    }

    /// Store keys under their fingerprint.
    ///
    /// The in-memory entry is always updated. A failed file write is
    /// returned as [`Error::CacheIo`] so the caller can log it; the cache
    /// stays usable.
    pub fn put(&self, keys: SessionKeys) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(keys.fingerprint.clone(), keys);
        })
    }

    /// Drop the entry for `fingerprint`.
    pub fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.remove(fingerprint);
        })
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        self.mutate(HashMap::clear)
    }

    /// Re-read the backing file, discarding in-memory state.
    ///
    /// A deleted file empties the cache.
    pub fn reload(&self) {
        if let Some(path) = &self.path {
            let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            let fresh = load_entries(path);
            *self.entries.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        }
    }

    /// Snapshot of all entries, expired ones included.
    pub fn entries(&self) -> Vec<SessionKeys> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        all
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, SessionKeys>)) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let snapshot = {
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            f(&mut entries);
            CacheFile {
                version: CACHE_VERSION,
                entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }
        };
        self.persist(&snapshot)
    }

    fn persist(&self, snapshot: &CacheFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(snapshot)?;
        atomic_write(path, &data).map_err(|e| {
            Error::CacheIo(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

fn load_entries(path: &Path) -> HashMap<String, SessionKeys> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Ignoring unreadable key cache {}: {}", path.display(), e);
            return HashMap::new();
        }
    };
    match serde_json::from_slice::<CacheFile>(&data) {
        Ok(file) if file.version == CACHE_VERSION => file.entries.into_iter().collect(),
        Ok(file) => {
            warn!("Ignoring key cache {} with version {}", path.display(), file.version);
            HashMap::new()
        }
        Err(e) => {
            warn!("Ignoring corrupt key cache {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}
