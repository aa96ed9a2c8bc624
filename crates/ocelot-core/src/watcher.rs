//! Debounced filesystem watcher on the library root.
//!
//! Events are coalesced inside a 500 ms window and dispatched as a set of
//! affected model ids for incremental reindex. Writes the library made
//! itself are suppressed through the shared ignore set.

use crate::config::WatcherConfig;
use crate::error::{LibraryError, Result};
use crate::storage::WriteIgnoreSet;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// File extensions that trigger a reindex.
const MODEL_EXTENSIONS: &[&str] = &[
    "gguf",
    "safetensors",
    "pt",
    "pth",
    "ckpt",
    "bin",
    "onnx",
    "json", // metadata.json changes
];

/// Suffixes of files the library writes transiently.
const TRANSIENT_SUFFIXES: &[&str] = &[".tmp", ".part", ".lock", "-wal", "-shm"];

/// Invoked with the affected model ids after each debounce window.
pub type ReindexCallback = Box<dyn Fn(Vec<String>) + Send + Sync + 'static>;

/// Recursive watcher over the canonical tree.
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    stop_tx: mpsc::Sender<()>,
}

impl LibraryWatcher {
    /// Start watching `models_root`.
    pub fn new(
        models_root: impl AsRef<Path>,
        ignore_set: Arc<WriteIgnoreSet>,
        on_change: ReindexCallback,
    ) -> Result<Self> {
        Self::with_debounce(
            models_root,
            ignore_set,
            WatcherConfig::DEBOUNCE_WINDOW,
            on_change,
        )
    }

    pub fn with_debounce(
        models_root: impl AsRef<Path>,
        ignore_set: Arc<WriteIgnoreSet>,
        debounce: Duration,
        on_change: ReindexCallback,
    ) -> Result<Self> {
        let models_root = models_root.as_ref().to_path_buf();
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let mut watcher = notify::recommended_watcher(event_tx)
            .map_err(|e| LibraryError::Other(format!("Failed to create file watcher: {}", e)))?;
        watcher
            .watch(&models_root, RecursiveMode::Recursive)
            .map_err(|e| LibraryError::Other(format!("Failed to watch directory: {}", e)))?;

        info!("Watching model library at {}", models_root.display());

        std::thread::spawn(move || {
            event_loop(&models_root, &ignore_set, debounce, on_change, event_rx, stop_rx);
        });

        Ok(Self {
            _watcher: watcher,
            stop_tx,
        })
    }

    /// Stop the dispatch thread. The OS watch drops with `self`.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

fn event_loop(
    models_root: &Path,
    ignore_set: &WriteIgnoreSet,
    debounce: Duration,
    on_change: ReindexCallback,
    event_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut window_open = false;

    loop {
        if stop_rx.try_recv().is_ok() {
            debug!("File watcher stopping");
            break;
        }

        // Block briefly for the next event; a closed channel ends the loop.
        let wait = if window_open { debounce } else { Duration::from_millis(200) };
        match event_rx.recv_timeout(wait) {
            Ok(Ok(event)) => {
                for path in &event.paths {
                    if let Some(model_id) = relevant_model_id(models_root, ignore_set, path) {
                        pending.insert(model_id);
                        window_open = true;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("File watcher error: {}", e);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if window_open && !pending.is_empty() {
                    let batch: Vec<String> = std::mem::take(&mut pending).into_iter().collect();
                    debug!("Dispatching reindex for {} model(s)", batch.len());
                    on_change(batch);
                }
                window_open = false;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!("File watcher channel closed");
                break;
            }
        }
    }
}

/// Map an event path to the affected model id, or suppress it.
fn relevant_model_id(
    models_root: &Path,
    ignore_set: &WriteIgnoreSet,
    path: &Path,
) -> Option<String> {
    let filename = path.file_name()?.to_string_lossy().to_lowercase();
    if TRANSIENT_SUFFIXES.iter().any(|s| filename.ends_with(s)) {
        return None;
    }
    if filename == "models.db" || filename == "registry.db" {
        return None;
    }

    let extension = path.extension()?.to_string_lossy().to_lowercase();
    if !MODEL_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }

    if ignore_set.should_ignore(path) {
        return None;
    }

    let relative = path.strip_prefix(models_root).ok()?;
    let components: Vec<String> = relative
        .components()
        .take(3)
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if components.len() < 3 {
        return None;
    }
    Some(components.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn relevance_filter() {
        let ignore = WriteIgnoreSet::new();
        let root = PathBuf::from("/lib/models");

        assert_eq!(
            relevant_model_id(&root, &ignore, &root.join("llm/llama/llama/model.gguf")),
            Some("llm/llama/llama".to_string())
        );
        assert_eq!(
            relevant_model_id(&root, &ignore, &root.join("llm/llama/llama/metadata.json")),
            Some("llm/llama/llama".to_string())
        );
        // Transient and database files never dispatch.
        assert_eq!(
            relevant_model_id(&root, &ignore, &root.join("llm/llama/llama/x.gguf.12.9.tmp")),
            None
        );
        assert_eq!(relevant_model_id(&root, &ignore, &root.join("models.db")), None);
        // Files above model depth never dispatch.
        assert_eq!(relevant_model_id(&root, &ignore, &root.join("stray.json")), None);
    }

    #[test]
    fn own_writes_are_suppressed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("models");
        let file = root.join("llm/llama/llama/metadata.json");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"{}").unwrap();

        let ignore = WriteIgnoreSet::new();
        ignore.mark(&file);
        assert_eq!(relevant_model_id(&root, &ignore, &file), None);
    }

    #[test]
    fn dispatches_coalesced_model_ids() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("models");
        std::fs::create_dir_all(root.join("llm/llama/llama")).unwrap();

        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let watcher = LibraryWatcher::with_debounce(
            &root,
            Arc::new(WriteIgnoreSet::new()),
            Duration::from_millis(100),
            Box::new(move |ids| {
                seen_clone.lock().unwrap().push(ids);
            }),
        )
        .unwrap();

        std::fs::write(root.join("llm/llama/llama/model.gguf"), b"a").unwrap();
        std::fs::write(root.join("llm/llama/llama/extra.gguf"), b"b").unwrap();

        // Allow the window to flush.
        std::thread::sleep(Duration::from_millis(700));
        watcher.stop();

        let batches = seen.lock().unwrap();
        assert!(!batches.is_empty());
        assert!(batches
            .iter()
            .flatten()
            .any(|id| id == "llm/llama/llama"));
    }
}
