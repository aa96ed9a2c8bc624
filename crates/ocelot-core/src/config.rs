//! Centralized configuration: on-disk layout and operational constants.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk layout rooted at the launcher root directory.
///
/// ```text
/// <root>/
///   shared-resources/models/          canonical tree + models.db + registry.db
///   shared-resources/cache/           search.sqlite
///   launcher-data/
///     config/model-library-translation/
///     metadata/                       download tickets, misc caches
/// ```
#[derive(Debug, Clone)]
pub struct LibraryPaths {
    root: PathBuf,
}

impl LibraryPaths {
    pub const MODELS_DIR: &'static str = "shared-resources/models";
    pub const CACHE_DIR: &'static str = "shared-resources/cache";
    pub const TRANSLATION_CONFIG_DIR: &'static str = "launcher-data/config/model-library-translation";
    pub const METADATA_DIR: &'static str = "launcher-data/metadata";

    pub const INDEX_DB_FILENAME: &'static str = "models.db";
    pub const REGISTRY_DB_FILENAME: &'static str = "registry.db";
    pub const SEARCH_CACHE_FILENAME: &'static str = "search.sqlite";
    pub const MODEL_METADATA_FILENAME: &'static str = "metadata.json";
    pub const DOWNLOAD_TICKETS_FILENAME: &'static str = "downloads.json";

    /// Create a layout rooted at the given launcher root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform-default launcher root (`<local data dir>/ocelot`).
    pub fn default_root() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("ocelot"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the canonical model tree.
    pub fn models_root(&self) -> PathBuf {
        self.root.join(Self::MODELS_DIR)
    }

    /// SQLite index database path.
    pub fn index_db(&self) -> PathBuf {
        self.models_root().join(Self::INDEX_DB_FILENAME)
    }

    /// Link registry database path.
    pub fn registry_db(&self) -> PathBuf {
        self.models_root().join(Self::REGISTRY_DB_FILENAME)
    }

    /// HuggingFace search cache database path.
    pub fn search_cache_db(&self) -> PathBuf {
        self.root.join(Self::CACHE_DIR).join(Self::SEARCH_CACHE_FILENAME)
    }

    /// Directory holding per-app translation configs.
    pub fn translation_config_dir(&self) -> PathBuf {
        self.root.join(Self::TRANSLATION_CONFIG_DIR)
    }

    /// Directory for persistent library bookkeeping (download tickets, caches).
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(Self::METADATA_DIR)
    }

    /// Persistent download ticket store path.
    pub fn download_tickets_file(&self) -> PathBuf {
        self.metadata_dir().join(Self::DOWNLOAD_TICKETS_FILENAME)
    }
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    /// Connect / first-byte timeout for all network calls.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);
    /// Per-file retry schedule base; doubles per attempt.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
    /// Cap for the exponential backoff schedule (2s, 4s, 8s).
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
    pub const MAX_RETRIES: u32 = 3;
    /// Minimum blackout after an HTTP 429 from HuggingFace.
    pub const RATE_LIMIT_BLACKOUT: Duration = Duration::from_secs(60);
    /// Consecutive connect/timeout failures before the circuit opens.
    pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;
    /// How long an open circuit stays open before a half-open probe.
    pub const CIRCUIT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DOWNLOAD_CHUNK_SIZE: usize = 256 * 1024;
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const HF_API_BASE: &'static str = "https://huggingface.co";
    /// Default TTL for cached search results.
    pub const SEARCH_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Per-host concurrent download stream limit (configurable at runtime).
    pub const DEFAULT_PER_HOST_STREAMS: usize = 4;
}

/// Watcher configuration.
pub struct WatcherConfig;

impl WatcherConfig {
    /// Event coalescing window before a reindex dispatch.
    pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
    /// How long own-write markers stay in the ignore set.
    pub const IGNORE_SET_TTL: Duration = Duration::from_secs(5);
}
