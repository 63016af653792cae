//! Per-client session state and the client-visible file operations.
//!
//! Each connected client gets its own `SessionManager` (and its own RPC
//! connection); all sessions share the [`CacheStore`]. Open-close session
//! semantics: readers open the pinned cached version directly, writers get
//! a private working copy forked from it, and a writer's changes reach the
//! server and the cache only at close, as a new version that supersedes
//! the old one.
//!
//! Every operation returns a POSIX-style numeric result: a descriptor,
//! byte count or position on success, a negative errno on failure. I/O
//! and RPC failures map to `EIO` at this boundary; nothing panics out of
//! here.

use crate::cache::{CacheEntry, CacheStore, StoreInner};
use crate::metrics::{CACHE_HITS, CACHE_MISSES};
use crate::path::CachePaths;
use crate::rpc::RpcClient;
use ahash::AHashMap;
use protocol_chunk::{CHUNK_SIZE, MODE_R, OpenOption, Whence, errno};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Access mode granted at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// State of one open descriptor.
#[derive(Debug)]
struct SessionState {
    logical_path: String,
    mode: OpenMode,
    /// Versioned cache path pinned at open time.
    cache_path: PathBuf,
    /// Writer's private copy; `None` for readers.
    work_path: Option<PathBuf>,
    /// Positioned file handle; `None` for directory sentinels.
    handle: Option<File>,
    /// At least one write succeeded.
    dirty: bool,
    /// Current size of the writer's working copy.
    size_bytes: u64,
    /// Whether open pinned `cache_path` in the store.
    pinned: bool,
}

/// What a fetch resolved to.
enum FetchOutcome {
    /// The version is cached (hit or freshly downloaded) and pinned.
    Cached {
        cache_path: PathBuf,
        version: u64,
        mode: OpenMode,
    },
    /// Legal open of a path absent on the server (CREATE family): the
    /// writer starts from an empty working copy, nothing is cached.
    NotOnServer { version: u64 },
    /// Read-only grant on a directory.
    Directory { version: u64 },
}

/// Why a write-close flush failed.
enum FlushError {
    /// The upload did not reach the server; the working copy and the
    /// descriptor survive so the client can retry the close.
    Upload,
    /// The upload committed but local promotion failed; teardown proceeds
    /// and the next open re-fetches from the server.
    Local,
}

/// One client's descriptor table and operation handlers.
pub struct SessionManager {
    store: Arc<CacheStore>,
    paths: CachePaths,
    rpc: RpcClient,
    descriptors: AHashMap<u64, SessionState>,
    next_fd: u64,
}

impl SessionManager {
    pub fn new(store: Arc<CacheStore>, paths: CachePaths, rpc: RpcClient) -> Self {
        Self {
            store,
            paths,
            rpc,
            descriptors: AHashMap::new(),
            next_fd: 0,
        }
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    /// Open a file. Returns a descriptor or a negative errno.
    ///
    /// The whole fetch (probe, hit-or-install, chunk download, working-copy
    /// fork) runs under the store write lock so concurrent opens observe
    /// the newest installed state at their lock-acquire point.
    pub fn open(&mut self, logical: &str, option: OpenOption) -> i64 {
        let Self {
            store,
            paths,
            rpc,
            descriptors,
            next_fd,
        } = self;

        let mut guard = store.write();
        guard.touch_all();

        let outcome = match Self::fetch(rpc, paths, &mut guard, logical, option) {
            Ok(outcome) => outcome,
            Err(code) => {
                debug!(path = logical, code, "open refused");
                return code as i64;
            }
        };

        match Self::setup_descriptor(&mut guard, paths, logical, &outcome) {
            Ok(state) => {
                let fd = *next_fd;
                *next_fd += 1;
                debug!(path = logical, fd, mode = ?state.mode, "opened");
                descriptors.insert(fd, state);
                fd as i64
            }
            Err(code) => {
                // Roll back the pin taken by the fetch.
                if let FetchOutcome::Cached { cache_path, .. } = &outcome {
                    guard.unpin(cache_path);
                }
                code as i64
            }
        }
    }

    /// Probe the server, then either pin the cached version or install it
    /// by downloading chunks.
    fn fetch(
        rpc: &mut RpcClient,
        paths: &CachePaths,
        store: &mut StoreInner,
        logical: &str,
        option: OpenOption,
    ) -> Result<FetchOutcome, i32> {
        let probe = rpc.download_chunk(logical, 0, option, true).map_err(|e| {
            warn!(path = logical, error = %e, "probe failed");
            errno::EIO
        })?;

        if !probe.valid {
            return Err(probe.status_code);
        }

        let mode = if probe.status_code == MODE_R {
            OpenMode::Read
        } else {
            OpenMode::ReadWrite
        };

        if !probe.exists {
            return Ok(FetchOutcome::NotOnServer { version: 0 });
        }

        // Only a read-only grant can be a directory.
        if mode == OpenMode::Read {
            let is_dir = rpc.stat_is_dir(logical).map_err(|e| {
                warn!(path = logical, error = %e, "stat failed");
                errno::EIO
            })?;
            if is_dir {
                return Ok(FetchOutcome::Directory {
                    version: probe.version,
                });
            }
        }

        let cache_path = paths.versioned_cache_path(logical, probe.version);
        if store.contains(&cache_path) {
            CACHE_HITS.increment();
            store.pin(&cache_path);
            debug!(path = logical, version = probe.version, "cache hit");
            return Ok(FetchOutcome::Cached {
                cache_path,
                version: probe.version,
                mode,
            });
        }

        CACHE_MISSES.increment();
        store.make_room(probe.total_size);

        // Supersede older versions before the new one installs, so the
        // fresh entry is never marked.
        let prefix = CachePaths::strip_versioning(&cache_path);
        store.mark_stale(&prefix);
        store.sweep_stale(&prefix);

        store.install(CacheEntry::new(
            cache_path.clone(),
            logical.to_string(),
            probe.version,
            probe.total_size,
        ));
        store.pin(&cache_path);

        if let Err(code) = Self::download_into(rpc, &cache_path, logical, option) {
            store.unpin(&cache_path);
            store.remove(&cache_path);
            return Err(code);
        }

        Ok(FetchOutcome::Cached {
            cache_path,
            version: probe.version,
            mode,
        })
    }

    /// Stream non-probe chunks into the cache file until the last one.
    fn download_into(
        rpc: &mut RpcClient,
        cache_path: &Path,
        logical: &str,
        option: OpenOption,
    ) -> Result<(), i32> {
        let eio = |e: &dyn std::fmt::Display| {
            warn!(path = logical, error = %e, "chunk download failed");
            errno::EIO
        };

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent).map_err(|e| eio(&e))?;
        }
        let mut file = File::create(cache_path).map_err(|e| eio(&e))?;

        let mut chunk_num = 0u32;
        loop {
            let chunk = rpc
                .download_chunk(logical, chunk_num, option, false)
                .map_err(|e| eio(&e))?;
            if !chunk.valid || !chunk.exists {
                return Err(if chunk.status_code < 0 {
                    chunk.status_code
                } else {
                    errno::EIO
                });
            }

            file.seek(SeekFrom::Start(chunk_num as u64 * CHUNK_SIZE as u64))
                .map_err(|e| eio(&e))?;
            file.write_all(&chunk.data).map_err(|e| eio(&e))?;

            if chunk.is_last {
                return Ok(());
            }
            chunk_num += 1;
        }
    }

    /// Turn a fetch outcome into descriptor state: readers open the cached
    /// version directly, writers fork a private working copy.
    fn setup_descriptor(
        store: &mut StoreInner,
        paths: &CachePaths,
        logical: &str,
        outcome: &FetchOutcome,
    ) -> Result<SessionState, i32> {
        match outcome {
            FetchOutcome::Directory { version } => Ok(SessionState {
                logical_path: logical.to_string(),
                mode: OpenMode::Read,
                cache_path: paths.versioned_cache_path(logical, *version),
                work_path: None,
                handle: None,
                dirty: false,
                size_bytes: 0,
                pinned: false,
            }),
            FetchOutcome::Cached {
                cache_path,
                mode: OpenMode::Read,
                ..
            } => {
                let handle = File::open(cache_path).map_err(|e| {
                    warn!(path = %cache_path.display(), error = %e, "cannot open cached file");
                    errno::EIO
                })?;
                Ok(SessionState {
                    logical_path: logical.to_string(),
                    mode: OpenMode::Read,
                    cache_path: cache_path.clone(),
                    work_path: None,
                    handle: Some(handle),
                    dirty: false,
                    size_bytes: 0,
                    pinned: true,
                })
            }
            FetchOutcome::Cached {
                cache_path,
                version,
                mode: OpenMode::ReadWrite,
            } => Self::setup_writer(store, paths, logical, cache_path, *version, true),
            FetchOutcome::NotOnServer { version } => {
                let cache_path = paths.versioned_cache_path(logical, *version);
                Self::setup_writer(store, paths, logical, &cache_path, *version, false)
            }
        }
    }

    /// Fork a private working copy for a writer. The copy's footprint
    /// counts against the cache budget.
    fn setup_writer(
        store: &mut StoreInner,
        paths: &CachePaths,
        logical: &str,
        cache_path: &Path,
        version: u64,
        pinned: bool,
    ) -> Result<SessionState, i32> {
        let eio = |e: &dyn std::fmt::Display| {
            warn!(path = logical, error = %e, "cannot create working copy");
            errno::EIO
        };

        let work_path = paths.fresh_temp_path(logical, version);
        if let Some(parent) = work_path.parent() {
            fs::create_dir_all(parent).map_err(|e| eio(&e))?;
        }

        let mut copy_size = 0u64;
        if store.contains(cache_path) {
            copy_size = fs::metadata(cache_path).map_err(|e| eio(&e))?.len();
            if store.is_full(copy_size) {
                store.make_room(copy_size);
            }
            fs::copy(cache_path, &work_path).map_err(|e| eio(&e))?;
            store.adjust_size(copy_size as i64);
        }

        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&work_path)
            .map_err(|e| eio(&e))?;

        Ok(SessionState {
            logical_path: logical.to_string(),
            mode: OpenMode::ReadWrite,
            cache_path: cache_path.to_path_buf(),
            work_path: Some(work_path),
            handle: Some(handle),
            dirty: false,
            size_bytes: copy_size,
            pinned,
        })
    }

    /// Read from the descriptor's current position.
    pub fn read(&mut self, fd: u64, buf: &mut [u8]) -> i64 {
        let Some(state) = self.descriptors.get_mut(&fd) else {
            return errno::EBADF as i64;
        };
        let Some(handle) = state.handle.as_mut() else {
            return errno::EISDIR as i64;
        };
        match handle.read(buf) {
            Ok(n) => n as i64,
            Err(e) => {
                warn!(fd, error = %e, "read failed");
                errno::EIO as i64
            }
        }
    }

    /// Write at the descriptor's current position, evicting first if the
    /// working copy is about to outgrow the cache budget.
    pub fn write(&mut self, fd: u64, data: &[u8]) -> i64 {
        let Some(state) = self.descriptors.get_mut(&fd) else {
            return errno::EBADF as i64;
        };
        if state.mode != OpenMode::ReadWrite {
            return errno::EBADF as i64;
        }
        let Some(handle) = state.handle.as_mut() else {
            return errno::EBADF as i64;
        };

        {
            let mut guard = self.store.write();
            if state.size_bytes + data.len() as u64 > guard.max_size_bytes() {
                guard.make_room(data.len() as u64);
            }
        }

        if let Err(e) = handle.write_all(data) {
            warn!(fd, error = %e, "write failed");
            return errno::EIO as i64;
        }
        if let Ok(pos) = handle.stream_position() {
            state.size_bytes = state.size_bytes.max(pos);
        }
        state.dirty = true;
        data.len() as i64
    }

    /// Reposition the descriptor. Returns the new position.
    pub fn lseek(&mut self, fd: u64, offset: i64, whence: Whence) -> i64 {
        let Some(state) = self.descriptors.get_mut(&fd) else {
            return errno::EBADF as i64;
        };
        let Some(handle) = state.handle.as_mut() else {
            return errno::EBADF as i64;
        };

        let target = match whence {
            Whence::FromStart => {
                if offset < 0 {
                    return errno::EINVAL as i64;
                }
                offset
            }
            Whence::FromCurrent => match handle.stream_position() {
                Ok(pos) => match (pos as i64).checked_add(offset) {
                    Some(target) => target,
                    None => return errno::EINVAL as i64,
                },
                Err(_) => return errno::EIO as i64,
            },
            Whence::FromEnd => {
                if offset > 0 {
                    return errno::EINVAL as i64;
                }
                match handle.metadata() {
                    Ok(meta) => match (meta.len() as i64).checked_add(offset) {
                        Some(target) => target,
                        None => return errno::EINVAL as i64,
                    },
                    Err(_) => return errno::EIO as i64,
                }
            }
        };

        if target < 0 {
            return errno::EINVAL as i64;
        }
        match handle.seek(SeekFrom::Start(target as u64)) {
            Ok(pos) => pos as i64,
            Err(e) => {
                warn!(fd, error = %e, "seek failed");
                errno::EIO as i64
            }
        }
    }

    /// Close a descriptor. A dirty writer uploads its working copy as a
    /// new server version, installs it locally, and supersedes the old
    /// pinned version; the whole install runs under the store write lock.
    pub fn close(&mut self, fd: u64) -> i64 {
        let Self {
            store,
            paths,
            rpc,
            descriptors,
            ..
        } = self;
        let Some(state) = descriptors.get_mut(&fd) else {
            return errno::EBADF as i64;
        };

        // Directory sentinel: nothing to flush or unpin.
        if state.handle.is_none() {
            descriptors.remove(&fd);
            return 0;
        }

        let mut guard = store.write();
        let mut result = 0i64;

        if state.mode == OpenMode::ReadWrite && state.dirty {
            match Self::flush_writer(rpc, paths, &mut guard, state) {
                Ok(()) => {}
                // Retryable: the working copy and descriptor stay intact.
                Err(FlushError::Upload) => return errno::EIO as i64,
                Err(FlushError::Local) => result = errno::EIO as i64,
            }
        }

        state.handle = None;
        if let Some(work_path) = state.work_path.take() {
            if let Ok(meta) = fs::metadata(&work_path) {
                let work_size = meta.len();
                if let Err(e) = fs::remove_file(&work_path) {
                    warn!(path = %work_path.display(), error = %e, "cannot delete working copy");
                }
                guard.adjust_size(-(work_size as i64));
            }
        }

        if state.pinned && guard.contains(&state.cache_path) {
            guard.unpin(&state.cache_path);
            guard.reset_lru(&state.cache_path);
        }
        guard.sweep_stale(&CachePaths::strip_versioning(&state.cache_path));

        drop(guard);
        debug!(fd, path = %state.logical_path, "closed");
        descriptors.remove(&fd);
        result
    }

    /// Upload the working copy as the next server version, then promote it
    /// into the cache and mark the version it supersedes stale.
    ///
    /// The upload runs first: if it fails, nothing local has changed and
    /// the close can be retried.
    fn flush_writer(
        rpc: &mut RpcClient,
        paths: &CachePaths,
        store: &mut StoreInner,
        state: &SessionState,
    ) -> Result<(), FlushError> {
        let Some(work_path) = state.work_path.clone() else {
            return Err(FlushError::Local);
        };

        let latest = rpc.stat_version(&state.logical_path).map_err(|e| {
            warn!(path = %state.logical_path, error = %e, "version query failed");
            FlushError::Upload
        })?;
        let new_version = (latest + 1).max(0) as u64;

        rpc.upload(&state.logical_path, &work_path, new_version)
            .map_err(|e| {
                warn!(
                    path = %state.logical_path,
                    version = new_version,
                    error = %e,
                    "upload failed, keeping working copy for retry"
                );
                FlushError::Upload
            })?;

        let new_cache = paths.versioned_cache_path(&state.logical_path, new_version);
        let promote = |e: &dyn std::fmt::Display| {
            warn!(path = %new_cache.display(), error = %e, "cannot promote working copy");
            FlushError::Local
        };
        fs::copy(&work_path, &new_cache).map_err(|e| promote(&e))?;
        let size = fs::metadata(&new_cache).map_err(|e| promote(&e))?.len();

        store.install(CacheEntry::new(
            new_cache.clone(),
            state.logical_path.clone(),
            new_version,
            size,
        ));
        if state.cache_path != new_cache && store.contains(&state.cache_path) {
            store.set_stale(&state.cache_path);
        }

        debug!(
            path = %state.logical_path,
            version = new_version,
            size,
            "write close installed new version"
        );
        Ok(())
    }

    /// Remove a file on the server. The local cache is left alone; stale
    /// versions are collected when the path is next re-versioned.
    pub fn unlink(&mut self, logical: &str) -> i64 {
        match self.rpc.stat_exists(logical) {
            Ok(false) => return errno::ENOENT as i64,
            Ok(true) => {}
            Err(e) => {
                warn!(path = logical, error = %e, "stat failed");
                return errno::EIO as i64;
            }
        }
        match self.rpc.stat_is_dir(logical) {
            Ok(true) => return errno::EISDIR as i64,
            Ok(false) => {}
            Err(e) => {
                warn!(path = logical, error = %e, "stat failed");
                return errno::EIO as i64;
            }
        }
        match self.rpc.delete(logical) {
            Ok(true) => 0,
            Ok(false) => errno::EPERM as i64,
            Err(e) => {
                warn!(path = logical, error = %e, "delete failed");
                errno::EIO as i64
            }
        }
    }

    /// Teardown at client disconnect: drop every handle and all descriptor
    /// state. Entries pinned by descriptors the client never closed stay
    /// pinned.
    pub fn client_done(&mut self) {
        if !self.descriptors.is_empty() {
            debug!(
                open = self.descriptors.len(),
                "client done with descriptors still open"
            );
        }
        self.descriptors.clear();
    }
}
