//! Bounded, versioned, on-disk cache store shared by all client sessions.
//!
//! One readers-writer lock guards the whole store. Mutating paths (an
//! open's fetch, a close's install) take the write guard once via
//! [`CacheStore::write`] and hold it across their disk I/O, which makes
//! fetch-or-hit and install-and-supersede atomic with respect to other
//! clients. Point lookups go through the read guard.
//!
//! Eviction is LRU with pinning: candidates are ordered unpinned-first,
//! then oldest-first by [`CacheEntry::lru_tick`]. Pinned entries are
//! skipped, never deleted; when everything is pinned the store is allowed
//! to run over budget until descriptors close.

mod entry;

pub use entry::CacheEntry;

use crate::metrics::CACHE_EVICTIONS;
use ahash::AHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

/// Shared cache store. Wrap in `Arc` and hand to every session.
#[derive(Debug)]
pub struct CacheStore {
    inner: RwLock<StoreInner>,
}

/// The store state, exposed through the lock guards.
#[derive(Debug)]
pub struct StoreInner {
    entries: AHashMap<PathBuf, CacheEntry>,
    current_size_bytes: u64,
    max_size_bytes: u64,
}

impl CacheStore {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                entries: AHashMap::new(),
                current_size_bytes: 0,
                max_size_bytes,
            }),
        }
    }

    /// Take the write guard. Held across a whole fetch or install.
    pub fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap()
    }

    /// Take the read guard for point lookups.
    pub fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap()
    }

    pub fn contains(&self, cache_path: &Path) -> bool {
        self.read().contains(cache_path)
    }

    pub fn current_size(&self) -> u64 {
        self.read().current_size_bytes
    }

    pub fn max_size(&self) -> u64 {
        self.read().max_size_bytes
    }
}

impl StoreInner {
    /// Insert a new entry and charge its size. Capacity is the caller's
    /// concern ([`StoreInner::make_room`]); an install is allowed to push
    /// the store over budget.
    pub fn install(&mut self, entry: CacheEntry) {
        debug!(
            path = %entry.cache_path.display(),
            version = entry.version,
            size = entry.size_bytes,
            "installing cache entry"
        );
        self.current_size_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(entry.cache_path.clone(), entry) {
            self.current_size_bytes -= old.size_bytes;
        }
    }

    pub fn lookup(&self, cache_path: &Path) -> Option<&CacheEntry> {
        self.entries.get(cache_path)
    }

    pub fn contains(&self, cache_path: &Path) -> bool {
        self.entries.contains_key(cache_path)
    }

    /// Drop an entry and unlink its file. Absent entries and already
    /// missing files are ignored.
    pub fn remove(&mut self, cache_path: &Path) {
        let Some(entry) = self.entries.remove(cache_path) else {
            return;
        };
        self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
        trace!(
            path = %cache_path.display(),
            size = entry.size_bytes,
            "removing cache entry"
        );
        if let Err(e) = fs::remove_file(cache_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %cache_path.display(), error = %e, "failed to unlink cached file");
            }
        }
    }

    /// Count one more open descriptor against the entry.
    pub fn pin(&mut self, cache_path: &Path) {
        if let Some(entry) = self.entries.get_mut(cache_path) {
            entry.ref_count += 1;
        }
    }

    /// Release one descriptor. Clamps at zero.
    pub fn unpin(&mut self, cache_path: &Path) {
        if let Some(entry) = self.entries.get_mut(cache_path) {
            if entry.ref_count == 0 {
                warn!(path = %cache_path.display(), "unpin on unreferenced entry");
            } else {
                entry.ref_count -= 1;
            }
        }
    }

    /// Age every entry by one tick. Called at the start of every open;
    /// this is the LRU clock.
    pub fn touch_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.lru_tick += 1;
        }
    }

    /// Refresh an entry's recency after a close.
    pub fn reset_lru(&mut self, cache_path: &Path) {
        if let Some(entry) = self.entries.get_mut(cache_path) {
            entry.lru_tick = 0;
        }
    }

    /// Mark one entry superseded.
    pub fn set_stale(&mut self, cache_path: &Path) {
        if let Some(entry) = self.entries.get_mut(cache_path) {
            entry.stale = true;
        }
    }

    /// Mark every entry under `logical_prefix` (string-prefix match on the
    /// cache path) superseded. Called before a newer version installs.
    pub fn mark_stale(&mut self, logical_prefix: &str) {
        for entry in self.entries.values_mut() {
            if entry.cache_path.to_string_lossy().starts_with(logical_prefix) {
                entry.stale = true;
            }
        }
    }

    /// Drop every unreferenced stale entry under `logical_prefix`.
    pub fn sweep_stale(&mut self, logical_prefix: &str) {
        let doomed: Vec<PathBuf> = self
            .entries
            .values()
            .filter(|e| {
                e.stale
                    && e.ref_count == 0
                    && e.cache_path.to_string_lossy().starts_with(logical_prefix)
            })
            .map(|e| e.cache_path.clone())
            .collect();

        for path in doomed {
            debug!(path = %path.display(), "sweeping stale cache entry");
            self.remove(&path);
        }
    }

    /// Would admitting `size` more bytes exceed the budget?
    pub fn is_full(&self, size: u64) -> bool {
        self.current_size_bytes + size > self.max_size_bytes
    }

    /// Evict until `size` more bytes fit, unpinned-oldest first.
    ///
    /// Pinned entries are skipped, never deleted. If only pinned entries
    /// remain the target is abandoned and the store runs over budget until
    /// descriptors close.
    pub fn make_room(&mut self, size: u64) {
        if !self.is_full(size) {
            return;
        }
        debug!(
            current = self.current_size_bytes,
            needed = size,
            max = self.max_size_bytes,
            "cache full, evicting"
        );

        let mut candidates: Vec<(PathBuf, (bool, std::cmp::Reverse<u64>))> = self
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.eviction_key()))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        for (path, (pinned, _)) in candidates {
            if !self.is_full(size) {
                return;
            }
            if pinned {
                // All remaining candidates are pinned too.
                break;
            }
            self.remove(&path);
            CACHE_EVICTIONS.increment();
        }

        if self.is_full(size) {
            debug!(
                current = self.current_size_bytes,
                max = self.max_size_bytes,
                "eviction left store over budget, all remaining entries pinned"
            );
        }
    }

    /// Track writer-temp footprint outside the entry map.
    pub fn adjust_size(&mut self, delta: i64) {
        if delta >= 0 {
            self.current_size_bytes += delta as u64;
        } else {
            self.current_size_bytes = self.current_size_bytes.saturating_sub((-delta) as u64);
        }
    }

    pub fn current_size_bytes(&self) -> u64 {
        self.current_size_bytes
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries (eviction tests and sweeps).
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
}
