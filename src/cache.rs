//! Two-tier result cache shared by the search providers.
//!
//! The memory tier is a strict LRU bounded by item count. The disk tier keeps
//! one JSON file per key, named by the BLAKE3 hash of the key, and derives
//! expiry from the file's modification time. Writes go to both tiers; reads
//! fall back to disk and promote hits into memory.
//!
//! The disk tier takes no file locks. Two writers racing on the same key
//! each write a private temp file and rename it into place, so readers see
//! one complete entry or the other.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

struct MemoryEntry {
    value: Value,
    expires_at: Instant,
    tick: u64,
}

/// Strict LRU keyed by string. Recency is tracked with a monotonic tick;
/// `order` maps tick to key so the oldest entry is always the first one.
struct MemoryLru {
    capacity: usize,
    next_tick: u64,
    entries: HashMap<String, MemoryEntry>,
    order: BTreeMap<u64, String>,
}

impl MemoryLru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        let expired = self.entries.get(key)?.expires_at <= Instant::now();
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(entry.value.clone())
    }

    fn put(&mut self, key: &str, value: Value, ttl: Duration) {
        self.remove(key);
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let tick = self.bump();
        self.order.insert(tick, key.to_string());
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
                tick,
            },
        );
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    fn remove_matching(&mut self, patterns: &[&str]) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| patterns.iter().any(|p| k.contains(p)))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// On-disk envelope. The key is stored so pattern invalidation can match
/// against it without reversing the filename hash.
#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    value: Value,
}

pub struct CacheManager {
    memory: Mutex<MemoryLru>,
    dir: Option<PathBuf>,
    ttl: Duration,
    temp_counter: AtomicU64,
}

impl CacheManager {
    /// Create a cache whose disk tier lives in `dir`.
    pub fn new(dir: &Path, max_items: usize, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            memory: Mutex::new(MemoryLru::new(max_items)),
            dir: Some(dir.to_path_buf()),
            ttl,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Create a cache with no disk tier.
    pub fn memory_only(max_items: usize, ttl: Duration) -> Self {
        Self {
            memory: Mutex::new(MemoryLru::new(max_items)),
            dir: None,
            ttl,
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn memory(&self) -> Result<MutexGuard<'_, MemoryLru>> {
        self.memory.lock().map_err(|_| Error::poisoned("cache"))
    }

    fn entry_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.json", blake3::hash(key.as_bytes()).to_hex()))
    }

    /// Time since the disk entry at `path` was last written.
    fn age(path: &Path) -> Result<Duration> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default())
    }

    /// Remaining lifetime of the disk entry at `path`, or `None` once its
    /// TTL has elapsed.
    fn remaining_ttl(&self, path: &Path) -> Result<Option<Duration>> {
        let age = Self::age(path)?;
        Ok(self.ttl.checked_sub(age).filter(|left| !left.is_zero()))
    }

    /// Look up `key`, checking memory first and then disk.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.memory()?.get(key) {
            return Ok(Some(value));
        }

        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = Self::entry_path(dir, key);
        let remaining = match self.remaining_ttl(&path) {
            Ok(Some(remaining)) => remaining,
            Ok(None) => {
                debug!(key, "disk cache entry expired");
                remove_if_exists(&path)?;
                return Ok(None);
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "dropping unreadable disk cache entry");
                remove_if_exists(&path)?;
                return Ok(None);
            }
        };
        if entry.key != key {
            return Ok(None);
        }

        // The promoted copy expires with the disk entry, not a fresh TTL.
        self.memory()?.put(key, entry.value.clone(), remaining);
        Ok(Some(entry.value))
    }

    /// Store `value` under `key` in both tiers.
    pub fn put(&self, key: &str, value: Value) -> Result<()> {
        if let Some(dir) = &self.dir {
            let entry = DiskEntry {
                key: key.to_string(),
                value: value.clone(),
            };
            let path = Self::entry_path(dir, key);
            let tmp = dir.join(format!(
                ".{}.{}.tmp",
                std::process::id(),
                self.temp_counter.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
            std::fs::rename(&tmp, &path)?;
        }

        self.memory()?.put(key, value, self.ttl);
        Ok(())
    }

    /// Typed wrapper around [`get`](Self::get). A value that no longer
    /// deserializes as `T` is treated as a miss.
    pub fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        Ok(self
            .get(key)?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn put_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_value(value)?)
    }

    /// [`get_as`](Self::get_as) for callers that can always recompute: a
    /// failing cache is logged and reported as a miss.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_as(key).unwrap_or_else(|e| {
            warn!(key, error = %e, "cache read failed");
            None
        })
    }

    /// [`put_as`](Self::put_as) that logs failures instead of returning
    /// them.
    pub fn remember<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.put_as(key, value) {
            warn!(key, error = %e, "cache write failed");
        }
    }

    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.memory()?.remove(key);
        if let Some(dir) = &self.dir {
            remove_if_exists(&Self::entry_path(dir, key))?;
        }
        Ok(())
    }

    /// Remove every entry whose key contains `pattern`. Returns the number
    /// of disk files removed plus memory entries removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        self.invalidate_any(&[pattern])
    }

    /// Remove every entry whose key contains any of `patterns`, in a single
    /// pass over each tier.
    pub fn invalidate_any(&self, patterns: &[&str]) -> Result<usize> {
        let mut removed = self.memory()?.remove_matching(patterns);
        removed += self.sweep_disk(|entry| {
            entry
                .as_ref()
                .is_none_or(|e| patterns.iter().any(|p| e.key.contains(p)))
        })?;
        debug!(?patterns, removed, "cache entries invalidated");
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.memory()?.clear();
        self.sweep_disk(|_| true)?;
        Ok(())
    }

    /// Delete disk entries whose TTL has elapsed.
    pub fn purge_expired(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let mut removed = 0;
        for path in json_files(dir)? {
            if matches!(self.remaining_ttl(&path), Ok(None)) {
                remove_if_exists(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of entries currently held in the memory tier.
    pub fn memory_len(&self) -> Result<usize> {
        Ok(self.memory()?.len())
    }

    /// Remove disk files for which `should_remove` returns true. Unreadable
    /// files are passed as `None`.
    fn sweep_disk(
        &self,
        should_remove: impl Fn(&Option<DiskEntry>) -> bool,
    ) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let mut removed = 0;
        for path in json_files(dir)? {
            let entry = std::fs::read(&path).ok().and_then(|bytes| {
                serde_json::from_slice::<DiskEntry>(&bytes).ok()
            });
            if should_remove(&entry) {
                remove_if_exists(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("dir", &self.dir)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Order-independent digest of a path set, for cache keys that depend on
/// which files were considered.
pub(crate) fn paths_digest<S: AsRef<str>>(paths: &[S]) -> String {
    let mut sorted: Vec<&str> = paths.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();
    blake3::hash(sorted.join("\n").as_bytes()).to_hex().to_string()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
