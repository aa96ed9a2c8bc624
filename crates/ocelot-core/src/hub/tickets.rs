//! Download tickets: persistent records of in-flight HuggingFace downloads.
//!
//! Tickets survive process restart; partial byte counts let ranged requests
//! resume where they stopped. Terminal states are `complete` and
//! `cancelled`.

use crate::error::{LibraryError, Result};
use crate::importer::ImportHints;
use crate::storage::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Download lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Downloading,
    Paused,
    Error,
    Complete,
    Cancelled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Error => "error",
            DownloadState::Complete => "complete",
            DownloadState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Complete | DownloadState::Cancelled)
    }

    /// Legal transitions of the ticket state machine.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Error)
                | (Downloading, Complete)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Error, Downloading)
                | (Error, Cancelled)
        )
    }
}

/// One file tracked by a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TicketFile {
    pub filename: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Expected SHA-256 from LFS metadata, when known
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Persistent record for one repository download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadTicket {
    pub download_id: String,
    pub repo_id: String,
    pub files: Vec<TicketFile>,
    pub state: DownloadState,
    #[serde(default)]
    pub error_detail: Option<String>,
    /// Directory partial files accumulate in
    pub staging_dir: PathBuf,
    /// Import hints applied at finalization
    #[serde(default)]
    pub hints: ImportHints,
    pub created_at: String,
}

impl DownloadTicket {
    /// Bytes fetched so far across all files.
    pub fn partial_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.downloaded_bytes).sum()
    }

    /// Total bytes across all files, when every size is known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TicketStoreData {
    tickets: Vec<DownloadTicket>,
}

/// JSON-backed ticket store (`downloads.json`).
pub struct TicketStore {
    path: PathBuf,
    tickets: Mutex<HashMap<String, DownloadTicket>>,
}

impl TicketStore {
    /// Open the store, loading persisted tickets.
    ///
    /// Tickets left in `downloading` by a crash are demoted to `paused` so
    /// their bytes can resume.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut tickets = HashMap::new();
        if let Some(data) = atomic_read_json::<TicketStoreData>(&path)? {
            for mut ticket in data.tickets {
                if ticket.state == DownloadState::Downloading {
                    info!(
                        "Recovering interrupted download {} as paused",
                        ticket.download_id
                    );
                    ticket.state = DownloadState::Paused;
                }
                tickets.insert(ticket.download_id.clone(), ticket);
            }
        }
        let store = Self {
            path,
            tickets: Mutex::new(tickets),
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        let tickets = self.lock()?;
        let mut data: Vec<DownloadTicket> = tickets.values().cloned().collect();
        data.sort_by(|a, b| a.download_id.cmp(&b.download_id));
        drop(tickets);
        atomic_write_json(&self.path, &TicketStoreData { tickets: data })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DownloadTicket>>> {
        self.tickets.lock().map_err(|_| LibraryError::Other(
            "ticket store lock poisoned".to_string(),
        ))
    }

    /// Insert a new ticket (state `queued`).
    pub fn create(&self, ticket: DownloadTicket) -> Result<()> {
        self.lock()?.insert(ticket.download_id.clone(), ticket);
        self.persist()
    }

    pub fn get(&self, download_id: &str) -> Result<DownloadTicket> {
        self.lock()?
            .get(download_id)
            .cloned()
            .ok_or_else(|| LibraryError::DownloadNotFound {
                download_id: download_id.to_string(),
            })
    }

    pub fn all(&self) -> Result<Vec<DownloadTicket>> {
        let tickets = self.lock()?;
        let mut all: Vec<DownloadTicket> = tickets.values().cloned().collect();
        all.sort_by(|a, b| a.download_id.cmp(&b.download_id));
        Ok(all)
    }

    /// Transition a ticket, enforcing the state machine.
    pub fn transition(
        &self,
        download_id: &str,
        next: DownloadState,
        error_detail: Option<String>,
    ) -> Result<DownloadTicket> {
        let updated = {
            let mut tickets = self.lock()?;
            let ticket = tickets.get_mut(download_id).ok_or_else(|| {
                LibraryError::DownloadNotFound {
                    download_id: download_id.to_string(),
                }
            })?;
            if !ticket.state.can_transition_to(next) {
                return Err(LibraryError::Validation {
                    field: "download_state".to_string(),
                    message: format!(
                        "illegal transition {} -> {} for {}",
                        ticket.state.as_str(),
                        next.as_str(),
                        download_id
                    ),
                });
            }
            ticket.state = next;
            ticket.error_detail = error_detail;
            ticket.clone()
        };
        self.persist()?;
        debug!("Ticket {} -> {}", download_id, updated.state.as_str());
        Ok(updated)
    }

    /// Update per-file progress without changing state.
    pub fn update_progress(
        &self,
        download_id: &str,
        filename: &str,
        downloaded_bytes: u64,
        size_bytes: Option<u64>,
    ) -> Result<()> {
        {
            let mut tickets = self.lock()?;
            let ticket = tickets.get_mut(download_id).ok_or_else(|| {
                LibraryError::DownloadNotFound {
                    download_id: download_id.to_string(),
                }
            })?;
            if let Some(file) = ticket.files.iter_mut().find(|f| f.filename == filename) {
                file.downloaded_bytes = downloaded_bytes;
                if size_bytes.is_some() {
                    file.size_bytes = size_bytes;
                }
            }
        }
        self.persist()
    }

    /// Drop terminal tickets older than the caller cares about.
    pub fn remove(&self, download_id: &str) -> Result<()> {
        self.lock()?.remove(download_id);
        self.persist()
    }

    /// Non-terminal tickets eligible for resume on startup.
    pub fn resumable(&self) -> Result<Vec<DownloadTicket>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|t| matches!(t.state, DownloadState::Paused | DownloadState::Error))
            .collect())
    }
}
