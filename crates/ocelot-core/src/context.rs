//! Process-wide context: the only "global" state, created once at startup
//! and passed explicitly to every component.

use crate::config::LibraryPaths;
use crate::error::Result;
use crate::io_queue::IoQueue;
use crate::net::{build_http_client, NetworkGate};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared runtime context for the library.
///
/// There are no implicit singletons; everything long-lived hangs off this
/// value.
#[derive(Clone)]
pub struct LibraryContext {
    pub paths: LibraryPaths,
    pub io_queue: Arc<IoQueue>,
    pub http: reqwest::Client,
    pub hf_gate: Arc<NetworkGate>,
}

impl LibraryContext {
    /// Build a context rooted at the launcher root, detecting device
    /// classes once.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            paths: LibraryPaths::new(root),
            io_queue: Arc::new(IoQueue::detect()),
            http: build_http_client()?,
            hf_gate: Arc::new(NetworkGate::new("huggingface", "huggingface.co")),
        })
    }

    /// Context with a caller-supplied I/O queue (tests, overrides).
    pub fn with_io_queue(root: impl Into<PathBuf>, io_queue: IoQueue) -> Result<Self> {
        Ok(Self {
            paths: LibraryPaths::new(root),
            io_queue: Arc::new(io_queue),
            http: build_http_client()?,
            hf_gate: Arc::new(NetworkGate::new("huggingface", "huggingface.co")),
        })
    }
}
