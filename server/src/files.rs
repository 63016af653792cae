//! Rootdir-confined file storage with per-file versions.
//!
//! All paths arriving on the wire are server-relative; they resolve below
//! `root_dir` and anything escaping it is rejected. Versions live in an
//! in-memory map (files never uploaded count as version 0, absent files as
//! -1) and are bumped by the final chunk of an upload; the map is
//! rebuilt empty on restart.
//!
//! One readers-writer lock orders operations: chunk reads and stats take
//! the read side, uploads and deletes the write side.

use crate::metrics::{CHUNKS_SERVED, CHUNKS_STORED, FILES_DELETED};
use ahash::AHashMap;
use bytes::Bytes;
use protocol_chunk::rpc::ChunkResponse;
use protocol_chunk::{CHUNK_SIZE, MODE_R, MODE_RW, OpenOption, errno};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

/// The server's file store.
#[derive(Debug)]
pub struct ServerFiles {
    root: PathBuf,
    versions: RwLock<AHashMap<PathBuf, u64>>,
}

impl ServerFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            versions: RwLock::new(AHashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a server-relative path below the root, preserving at most
    /// one leading `../` and normalizing the rest lexically.
    fn resolve(&self, logical: &str) -> PathBuf {
        let root = self.root.to_string_lossy();
        let root_parent = root.starts_with("../");
        let logical_parent = logical.starts_with("../");

        let root = if root_parent { &root[3..] } else { &root[..] };
        let logical = if logical_parent {
            &logical[3..]
        } else {
            logical
        };

        let joined = Path::new(root).join(normalize(Path::new(logical)));
        let normalized = normalize(&joined);

        if root_parent || logical_parent {
            Path::new("..").join(normalized)
        } else {
            normalized
        }
    }

    /// Reject any resolved path that escapes the root.
    fn in_root(&self, path: &Path) -> bool {
        let root = absolute_normalized(&self.root);
        let path = absolute_normalized(path);
        path.starts_with(&root)
    }

    /// Apply an open option to a path: returns the granted mode
    /// (`MODE_R`/`MODE_RW`) or a negative errno.
    pub fn process_open(&self, logical: &str, option: OpenOption) -> i32 {
        let path = self.resolve(logical);
        if !self.in_root(&path) {
            warn!(path = logical, "blocked open outside root directory");
            return errno::EPERM;
        }

        match option {
            OpenOption::Read => {
                if !path.exists() {
                    return errno::ENOENT;
                }
                if path.is_dir() {
                    return MODE_R;
                }
                match File::open(&path) {
                    Ok(_) => MODE_R,
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => errno::EACCES,
                    Err(_) => errno::EINVAL,
                }
            }
            OpenOption::Write => {
                if !path.exists() {
                    return errno::ENOENT;
                }
                if path.is_dir() {
                    return errno::EISDIR;
                }
                match OpenOptions::new().read(true).write(true).open(&path) {
                    Ok(_) => MODE_RW,
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => errno::EACCES,
                    Err(_) => errno::EINVAL,
                }
            }
            OpenOption::Create => {
                if path.is_dir() {
                    return errno::EISDIR;
                }
                if !path.exists() {
                    if let Some(parent) = path.parent() {
                        if fs::create_dir_all(parent).is_err() {
                            return errno::EINVAL;
                        }
                    }
                    if let Err(e) = OpenOptions::new().write(true).create_new(true).open(&path) {
                        debug!(path = logical, error = %e, "create failed");
                        return errno::EINVAL;
                    }
                }
                MODE_RW
            }
            OpenOption::CreateNew => {
                if path.exists() {
                    return errno::EEXIST;
                }
                MODE_RW
            }
        }
    }

    /// Serve one chunk of a file, or probe metadata when `is_probe`.
    pub fn download_chunk(
        &self,
        logical: &str,
        chunk_num: u32,
        option: OpenOption,
        is_probe: bool,
    ) -> ChunkResponse {
        let versions = self.versions.read().unwrap();

        let status = self.process_open(logical, option);
        if status < 0 {
            debug!(path = logical, status, "open refused");
            return ChunkResponse::refused(status, chunk_num);
        }

        let path = self.resolve(logical);
        if !path.exists() {
            return ChunkResponse::absent(status, chunk_num);
        }

        let version = versions.get(&path).copied().unwrap_or(0);

        if path.is_dir() {
            return ChunkResponse {
                valid: true,
                exists: true,
                version,
                total_size: 0,
                chunk_number: chunk_num,
                is_last: true,
                status_code: status,
                data: Bytes::new(),
            };
        }

        let total_size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!(path = logical, error = %e, "stat failed");
                return ChunkResponse::refused(errno::EIO, chunk_num);
            }
        };

        let chunk_start = chunk_num as u64 * CHUNK_SIZE as u64;
        let data = if is_probe {
            Bytes::new()
        } else {
            let len = (CHUNK_SIZE as u64).min(total_size.saturating_sub(chunk_start));
            match read_chunk(&path, chunk_start, len as usize) {
                Ok(data) => data,
                Err(e) => {
                    error!(path = logical, chunk_num, error = %e, "chunk read failed");
                    return ChunkResponse::refused(errno::EIO, chunk_num);
                }
            }
        };

        if !is_probe {
            CHUNKS_SERVED.increment();
        }
        ChunkResponse {
            valid: true,
            exists: true,
            version,
            total_size,
            chunk_number: chunk_num,
            is_last: !is_probe && chunk_start + CHUNK_SIZE as u64 >= total_size,
            status_code: status,
            data,
        }
    }

    /// Store one chunk of a new file version. The first chunk truncates so
    /// a shorter version never keeps a stale tail; the final chunk commits
    /// the version.
    pub fn upload_chunk(
        &self,
        logical: &str,
        version: u64,
        chunk_num: u32,
        is_last: bool,
        data: &[u8],
    ) -> bool {
        let mut versions = self.versions.write().unwrap();

        let path = self.resolve(logical);
        if !self.in_root(&path) {
            warn!(path = logical, "blocked upload outside root directory");
            return false;
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!(path = logical, error = %e, "cannot create parent directories");
                return false;
            }
        }

        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(chunk_num == 0)
                .open(&path)?;
            file.seek(SeekFrom::Start(chunk_num as u64 * CHUNK_SIZE as u64))?;
            file.write_all(data)
        })();

        if let Err(e) = result {
            error!(path = logical, chunk_num, error = %e, "chunk write failed");
            return false;
        }

        CHUNKS_STORED.increment();
        if is_last {
            versions.insert(path.clone(), version);
            info!(
                path = logical,
                version,
                size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                "file uploaded"
            );
        }
        true
    }

    /// Does the path exist below the root?
    pub fn exists(&self, logical: &str) -> bool {
        let _versions = self.versions.read().unwrap();
        let path = self.resolve(logical);
        self.in_root(&path) && path.exists()
    }

    /// Is the path a directory below the root?
    pub fn is_dir(&self, logical: &str) -> bool {
        let _versions = self.versions.read().unwrap();
        let path = self.resolve(logical);
        self.in_root(&path) && path.is_dir()
    }

    /// Current version of the path, -1 if absent or outside the root.
    pub fn version(&self, logical: &str) -> i64 {
        let versions = self.versions.read().unwrap();
        let path = self.resolve(logical);
        if !self.in_root(&path) || !path.exists() {
            return -1;
        }
        versions.get(&path).copied().unwrap_or(0) as i64
    }

    /// Remove the path. Returns false when absent, outside the root, or
    /// not deletable.
    pub fn delete(&self, logical: &str) -> bool {
        let mut versions = self.versions.write().unwrap();
        let path = self.resolve(logical);
        if !self.in_root(&path) {
            warn!(path = logical, "blocked delete outside root directory");
            return false;
        }
        if !path.exists() {
            return false;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                versions.remove(&path);
                FILES_DELETED.increment();
                info!(path = logical, "file deleted");
                true
            }
            Err(e) => {
                warn!(path = logical, error = %e, "delete failed");
                false
            }
        }
    }
}

fn read_chunk(path: &Path, start: u64, len: usize) -> std::io::Result<Bytes> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

/// Lexical normalization: drops `.` components and resolves `..` against
/// preceding components where possible.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Absolute form with `..` resolved lexically, for containment checks.
fn absolute_normalized(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize(&absolute)
}
