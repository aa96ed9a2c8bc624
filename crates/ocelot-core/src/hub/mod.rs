//! HuggingFace integration: cached search, resumable downloads, ticket
//! lifecycle, and import finalization.

pub mod client;
pub mod search_cache;
pub mod tickets;

pub use client::{HfClient, RepoFileInfo, RepoFiles};
pub use search_cache::{SearchCache, SearchCacheStats};
pub use tickets::{DownloadState, DownloadTicket, TicketFile, TicketStore};

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{LibraryError, Result};
use crate::importer::{ImportHints, ModelImporter};
use crate::net::BackoffSchedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Response to a download start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadStarted {
    pub download_id: String,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

/// Status snapshot for one ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadStatus {
    pub download_id: String,
    pub repo_id: String,
    pub state: DownloadState,
    pub partial_bytes: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub error_detail: Option<String>,
    /// Model created by finalization, once complete
    #[serde(default)]
    pub model_id: Option<String>,
}

/// File extensions excluded from repository downloads.
const SKIPPED_EXTENSIONS: &[&str] = &["md", "gitattributes", "png", "jpg", "jpeg", "gif"];

/// Drives repository downloads from ticket to imported model.
pub struct HubDownloader {
    client: Arc<HfClient>,
    tickets: Arc<TicketStore>,
    importer: Arc<ModelImporter>,
    staging_root: PathBuf,
    /// Per-host stream budget
    streams: Arc<Semaphore>,
    /// Live cancellation tokens and finalization results, keyed by ticket
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    finalized: Arc<Mutex<HashMap<String, String>>>,
}

impl HubDownloader {
    pub fn new(
        client: Arc<HfClient>,
        tickets: Arc<TicketStore>,
        importer: Arc<ModelImporter>,
        staging_root: PathBuf,
    ) -> Self {
        Self {
            client,
            tickets,
            importer,
            staging_root,
            streams: Arc::new(Semaphore::new(NetworkConfig::DEFAULT_PER_HOST_STREAMS)),
            active: Arc::new(Mutex::new(HashMap::new())),
            finalized: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the per-host concurrent stream budget.
    pub fn with_stream_limit(mut self, streams: usize) -> Self {
        self.streams = Arc::new(Semaphore::new(streams.max(1)));
        self
    }

    /// The underlying HF client (search surface).
    pub fn client(&self) -> &HfClient {
        &self.client
    }

    /// Start downloading a repository; returns immediately with a ticket id.
    pub async fn start_download(
        &self,
        repo_id: &str,
        hints: ImportHints,
    ) -> Result<DownloadStarted> {
        let listing = self.client.repo_files(repo_id).await?;
        let files: Vec<TicketFile> = listing
            .files
            .iter()
            .filter(|f| is_wanted_file(&f.filename))
            .map(|f| TicketFile {
                filename: f.filename.clone(),
                size_bytes: f.size_bytes,
                downloaded_bytes: 0,
                sha256: f.sha256.clone(),
            })
            .collect();
        if files.is_empty() {
            return Err(LibraryError::DownloadFailed {
                url: repo_id.to_string(),
                message: "repository has no downloadable model files".to_string(),
            });
        }

        let download_id = uuid::Uuid::new_v4().to_string();
        let ticket = DownloadTicket {
            download_id: download_id.clone(),
            repo_id: repo_id.to_string(),
            files,
            state: DownloadState::Queued,
            error_detail: None,
            staging_dir: self.staging_root.join(&download_id),
            hints,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let total_bytes = ticket.total_bytes();
        self.tickets.create(ticket)?;

        self.spawn_worker(download_id.clone());
        Ok(DownloadStarted {
            download_id,
            total_bytes,
        })
    }

    /// Resume persisted tickets left paused or errored by a previous run.
    pub fn resume_pending(&self) -> Result<usize> {
        let resumable = self.tickets.resumable()?;
        let count = resumable.len();
        for ticket in resumable {
            self.spawn_worker(ticket.download_id);
        }
        Ok(count)
    }

    /// Status snapshot for one ticket.
    pub fn status(&self, download_id: &str) -> Result<DownloadStatus> {
        let ticket = self.tickets.get(download_id)?;
        Ok(DownloadStatus {
            download_id: ticket.download_id.clone(),
            repo_id: ticket.repo_id.clone(),
            state: ticket.state,
            partial_bytes: ticket.partial_bytes(),
            total_bytes: ticket.total_bytes(),
            error_detail: ticket.error_detail.clone(),
            model_id: self
                .finalized
                .lock()
                .ok()
                .and_then(|map| map.get(download_id).cloned()),
        })
    }

    /// Cancel a download: streams stop at the next chunk boundary and
    /// partial files are removed.
    pub fn cancel(&self, download_id: &str) -> Result<DownloadStatus> {
        if let Ok(active) = self.active.lock() {
            if let Some(token) = active.get(download_id) {
                token.cancel();
            }
        }

        let ticket = self.tickets.get(download_id)?;
        if !ticket.state.is_terminal() {
            self.tickets
                .transition(download_id, DownloadState::Cancelled, None)?;
        }
        let _ = std::fs::remove_dir_all(&ticket.staging_dir);
        self.status(download_id)
    }

    /// Re-verify cached repo details for locally-owned repositories only.
    ///
    /// Skips entirely while any download is active so foreground work is
    /// never contended.
    pub async fn background_refresh_owned(&self, owned_repo_ids: &[String]) -> Result<usize> {
        if self.active.lock().map(|a| !a.is_empty()).unwrap_or(true) {
            return Ok(0);
        }

        let mut refreshed = 0;
        for repo_id in owned_repo_ids {
            match self.client.repo_files(repo_id).await {
                Ok(_) => refreshed += 1,
                Err(e) if e.is_retryable() => break,
                Err(LibraryError::CircuitOpen { .. }) => break,
                Err(e) => {
                    warn!("Background refresh of {} failed: {}", repo_id, e);
                }
            }
        }
        Ok(refreshed)
    }

    fn spawn_worker(&self, download_id: String) {
        let cancel = CancellationToken::new();
        if let Ok(mut active) = self.active.lock() {
            active.insert(download_id.clone(), cancel.clone());
        }

        let client = Arc::clone(&self.client);
        let tickets = Arc::clone(&self.tickets);
        let importer = Arc::clone(&self.importer);
        let streams = Arc::clone(&self.streams);
        let active = Arc::clone(&self.active);
        let finalized = Arc::clone(&self.finalized);

        tokio::spawn(async move {
            let outcome = run_download(
                &client, &tickets, &importer, &streams, &download_id, &cancel, &finalized,
            )
            .await;
            if let Err(e) = outcome {
                match e {
                    LibraryError::Cancelled => {
                        info!("Download {} cancelled", download_id);
                    }
                    other => {
                        warn!("Download {} failed: {}", download_id, other);
                        let _ = tickets.transition(
                            &download_id,
                            DownloadState::Error,
                            Some(other.to_string()),
                        );
                    }
                }
            }
            if let Ok(mut active) = active.lock() {
                active.remove(&download_id);
            }
        });
    }
}

async fn run_download(
    client: &HfClient,
    tickets: &TicketStore,
    importer: &ModelImporter,
    streams: &Semaphore,
    download_id: &str,
    cancel: &CancellationToken,
    finalized: &Mutex<HashMap<String, String>>,
) -> Result<()> {
    let ticket = tickets.get(download_id)?;
    tickets.transition(download_id, DownloadState::Downloading, None)?;
    std::fs::create_dir_all(&ticket.staging_dir)
        .map_err(|e| LibraryError::io_with_path(e, &ticket.staging_dir))?;

    for file in &ticket.files {
        cancel.check()?;
        let part_path = ticket
            .staging_dir
            .join(format!("{}{}", file.filename, NetworkConfig::DOWNLOAD_TEMP_SUFFIX));
        if let Some(parent) = part_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LibraryError::io_with_path(e, parent))?;
        }

        let _stream_permit = streams
            .acquire()
            .await
            .map_err(|_| LibraryError::Other("stream semaphore closed".to_string()))?;

        // Each retry resumes from the bytes already on disk; cancellation
        // preempts the schedule.
        let mut backoff = BackoffSchedule::download();
        let written = loop {
            let attempt = client
                .download_file(
                    &ticket.repo_id,
                    &file.filename,
                    &part_path,
                    |bytes| {
                        let _ = tickets.update_progress(
                            download_id,
                            &file.filename,
                            bytes,
                            file.size_bytes,
                        );
                    },
                    cancel,
                )
                .await;
            match attempt {
                Ok(written) => break written,
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Download of {}/{} failed ({}), retrying in {:?}",
                            ticket.repo_id, file.filename, e, delay
                        );
                        cancel.check()?;
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        };

        if let Some(expected) = file.size_bytes {
            if written != expected {
                return Err(LibraryError::DownloadFailed {
                    url: format!("{}/{}", ticket.repo_id, file.filename),
                    message: format!("expected {} bytes, received {}", expected, written),
                });
            }
        }
        if let Some(expected_sha) = &file.sha256 {
            crate::hashing::verify_sha256(&part_path, expected_sha)?;
        }

        let final_path = ticket.staging_dir.join(&file.filename);
        std::fs::rename(&part_path, &final_path)
            .map_err(|e| LibraryError::io_with_path(e, &final_path))?;
    }

    // Finalize: hand the staged files to the importer, then clean up.
    let staged: Vec<PathBuf> = ticket
        .files
        .iter()
        .map(|f| ticket.staging_dir.join(&f.filename))
        .collect();
    let mut hints = ticket.hints.clone();
    if hints.source_repo_id.is_none() {
        hints.source_repo_id = Some(ticket.repo_id.clone());
    }
    let report = importer.import_paths(&staged, &hints, cancel).await?;

    if let Some(model_id) = report.model_ids.first() {
        if let Ok(mut map) = finalized.lock() {
            map.insert(download_id.to_string(), model_id.clone());
        }
    }
    let _ = std::fs::remove_dir_all(&ticket.staging_dir);

    tickets.transition(download_id, DownloadState::Complete, None)?;
    info!(
        "Download {} complete ({} files, models: {:?})",
        download_id,
        ticket.files.len(),
        report.model_ids
    );
    Ok(())
}

/// Whether a repository file belongs in a model download.
fn is_wanted_file(filename: &str) -> bool {
    if filename.starts_with('.') {
        return false;
    }
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension {
        Some(ext) => !SKIPPED_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_filter_keeps_weights_and_configs() {
        assert!(is_wanted_file("model-00001-of-00003.safetensors"));
        assert!(is_wanted_file("config.json"));
        assert!(is_wanted_file("tokenizer.model"));
        assert!(!is_wanted_file("README.md"));
        assert!(!is_wanted_file(".gitattributes"));
        assert!(!is_wanted_file("thumbnail.png"));
    }
}
