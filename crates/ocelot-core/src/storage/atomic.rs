//! Atomic file operations for the canonical tree.
//!
//! The write protocol is: temp file with a PID+TID suffix, fsync, rename.
//! The rename is the only observable commit point; a crash anywhere before it
//! leaves no indexable artifact at the final path.

use crate::error::{LibraryError, Result};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::debug;

/// Read and parse a JSON file. `None` if the file does not exist.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| LibraryError::io_with_path(e, path))?;

    let data: T = serde_json::from_str(&contents).map_err(|e| LibraryError::Metadata {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically.
///
/// Serializes to a temp file, re-parses the output as a sanity check, fsyncs,
/// then renames over the target.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(data).map_err(|e| LibraryError::Metadata {
        message: format!("Failed to serialize for {}: {}", path.display(), e),
        source: Some(e),
    })?;

    serde_json::from_str::<serde_json::Value>(&serialized).map_err(|e| LibraryError::Metadata {
        message: format!("JSON validation failed for {}: {}", path.display(), e),
        source: Some(e),
    })?;

    atomic_write_bytes(path, serialized.as_bytes())
}

/// Write raw bytes atomically (tmp, fsync, rename).
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let temp_path = temp_sibling(path);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| LibraryError::io_with_path(e, &temp_path))?;
        file.write_all(bytes)
            .map_err(|e| LibraryError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| LibraryError::io_with_path(e, &temp_path))?;
    }

    commit_rename(&temp_path, path)
}

/// Stream a reader into `path` atomically, returning the byte count.
///
/// The caller may compose hashing into `reader` so the copy and the digest
/// share one pass.
pub fn atomic_write_stream(path: &Path, reader: &mut impl Read) -> Result<u64> {
    ensure_parent_dir(path)?;
    let temp_path = temp_sibling(path);

    let copied = {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| LibraryError::io_with_path(e, &temp_path))?;
        let copied = std::io::copy(reader, &mut file).map_err(|e| {
            // Leave no temp residue behind a failed copy.
            let _ = fs::remove_file(&temp_path);
            LibraryError::io_with_path(e, &temp_path)
        })?;
        file.sync_all()
            .map_err(|e| LibraryError::io_with_path(e, &temp_path))?;
        copied
    };

    commit_rename(&temp_path, path)?;
    Ok(copied)
}

/// Advisory per-file lock guard; unlocks on drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take an exclusive advisory lock on `<path>` (created if absent).
    ///
    /// Guards metadata writes so an overlay write and a baseline reindex
    /// cannot interleave.
    pub fn acquire(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        file.lock_exclusive()
            .map_err(|e| LibraryError::io_with_path(e, path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| LibraryError::io_with_path(e, parent))?;
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let pid = process::id();
    let tid = thread_id();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{}.{}.{}.tmp", file_name, pid, tid))
}

fn commit_rename(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path).map_err(|e| {
        let _ = fs::remove_file(temp_path);
        LibraryError::Io {
            message: format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;
    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Stable numeric identifier for the current thread.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}
