//! Own-write suppression for the filesystem watcher.
//!
//! Writes made by the library itself are marked here (path + mtime) so the
//! watcher can tell them apart from external changes and skip the redundant
//! reindex. Entries expire after a short TTL.

use crate::config::WatcherConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

#[derive(Debug)]
struct IgnoreEntry {
    mtime: Option<SystemTime>,
    inserted_at: Instant,
}

/// Short-lived set of paths whose next change event is ours.
#[derive(Debug, Default)]
pub struct WriteIgnoreSet {
    entries: Mutex<HashMap<PathBuf, IgnoreEntry>>,
}

impl WriteIgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a path the library just wrote.
    pub fn mark(&self, path: &Path) {
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let mut entries = self.entries.lock().expect("ignore set poisoned");
        entries.insert(
            path.to_path_buf(),
            IgnoreEntry {
                mtime,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Whether an event for `path` should be suppressed.
    ///
    /// Matches by path, and by mtime when both sides have one; a later
    /// external modification to the same path is not suppressed.
    pub fn should_ignore(&self, path: &Path) -> bool {
        let mut entries = self.entries.lock().expect("ignore set poisoned");
        entries.retain(|_, e| e.inserted_at.elapsed() < WatcherConfig::IGNORE_SET_TTL);

        let Some(entry) = entries.get(path) else {
            return false;
        };
        match (entry.mtime, std::fs::metadata(path).and_then(|m| m.modified()).ok()) {
            (Some(marked), Some(current)) => marked == current,
            _ => true,
        }
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().expect("ignore set poisoned");
        entries.retain(|_, e| e.inserted_at.elapsed() < WatcherConfig::IGNORE_SET_TTL);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn marked_write_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        std::fs::write(&path, b"{}").unwrap();

        let set = WriteIgnoreSet::new();
        set.mark(&path);
        assert!(set.should_ignore(&path));
    }

    #[test]
    fn unmarked_path_is_not_ignored() {
        let set = WriteIgnoreSet::new();
        assert!(!set.should_ignore(Path::new("/never/marked")));
    }

    #[test]
    fn external_rewrite_defeats_suppression() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        std::fs::write(&path, b"{}").unwrap();

        let set = WriteIgnoreSet::new();
        set.mark(&path);

        // Force a distinct mtime for the external write.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"{\"external\": true}").unwrap();
        file.set_modified(SystemTime::now()).unwrap();
        drop(file);

        assert!(!set.should_ignore(&path));
    }
}
