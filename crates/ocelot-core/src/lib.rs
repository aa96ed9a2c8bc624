//! Ocelot — a headless, content-addressed library for local AI models.
//!
//! The library imports, deduplicates, indexes, and exposes model artifacts
//! (single files, sharded sets, repository-style folders) for consumption by
//! host applications:
//!
//! - Canonical storage tree `{model_type}/{family}/{name}/` with an atomic
//!   write protocol
//! - Dual-hash (SHA-256 + BLAKE3) deduplication computed in one pass
//! - SQLite + FTS5 index, always rebuildable from the filesystem
//! - Metadata overlays over immutable baselines (JSON merge-patch)
//! - Deterministic, resolve-only dependency requirements reports
//! - Symlink/hardlink fan-out into application directory layouts with a
//!   persistent link registry for cascade delete and self-healing
//! - Resumable HuggingFace downloads with persisted tickets and cached search
//!
//! # Architecture
//!
//! ```text
//! ModelLibrary (facade)
//!     ├── StorageLayout   canonical tree + atomic writes + delete cascade
//!     ├── ModelIndex      SQLite WAL + FTS5 projection
//!     ├── ModelImporter   hash, dedup, place, baseline, index
//!     ├── ModelMapper     app-layout link fan-out + self-heal
//!     ├── HubDownloader   HF search/download + ticket lifecycle
//!     └── LibraryWatcher  debounced incremental reindex
//! ```
//!
//! Callers drive the library by method invocation; there is no daemon and no
//! network protocol of its own.

pub mod cancel;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod hashing;
pub mod hub;
pub mod importer;
pub mod index;
pub mod io_queue;
pub mod library;
pub mod mapper;
pub mod naming;
pub mod net;
pub mod overlay;
pub mod registry;
pub mod resolver;
pub mod sharding;
pub mod storage;
pub mod types;
pub mod watcher;

pub use cancel::CancellationToken;
pub use classify::{
    classify, detect_format,
    model_type::{resolve_model_type, ModelTypeResolution},
    task_signature::{normalize_task_signature, NormalizedTaskSignature, TaskNormalizationStatus},
    ClassificationHints,
};
pub use config::LibraryPaths;
pub use context::LibraryContext;
pub use error::{LibraryError, Result};
pub use hashing::{compute_fast_hash, hash_file, verify_blake3, verify_sha256, DualHash};
pub use hub::{DownloadState, DownloadTicket, HfClient, HubDownloader, SearchCache, TicketStore};
pub use importer::{ImportHints, ModelImporter};
pub use index::{ModelFilter, ModelIndex, ModelSort, ModelSummary};
pub use library::{FileTypeReport, LibraryStatus, LinkHealthReport, ModelLibrary};
pub use mapper::{ConflictChoice, MappingPlan, ModelMapper, PlanState};
pub use net::{NetworkGate, NetworkStatus};
pub use registry::LinkRegistry;
pub use resolver::{
    resolve_dependency_requirements, ResolverResponse, ValidationState,
    DEPENDENCY_CONTRACT_VERSION,
};
pub use storage::StorageLayout;
pub use types::*;
pub use watcher::LibraryWatcher;
