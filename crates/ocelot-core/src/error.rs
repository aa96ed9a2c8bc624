//! Error types for the Ocelot library.
//!
//! Error kinds are stable and matched structurally by callers; RPC handlers
//! map them to deterministic JSON-RPC codes via [`LibraryError::to_rpc_error_code`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for library operations.
#[derive(Debug, Error)]
pub enum LibraryError {
    // Filesystem
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    // Boundary validation
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Metadata documents (metadata.json, overlays)
    #[error("Metadata error: {message}")]
    Metadata {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // SQLite index / registry
    #[error("Index error: {message}")]
    Index {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Network
    #[error("Network error: {message}")]
    Network {
        message: String,
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Circuit breaker open for {domain}")]
    CircuitOpen { domain: String },

    // Dependency governance
    #[error("Dependency profile {profile_id}:{profile_version} is immutable")]
    ProfileImmutable {
        profile_id: String,
        profile_version: i64,
    },

    // Mapping
    #[error("Conflicting link at {target}: target exists and is not ours")]
    ConflictingLink { target: PathBuf },

    #[error("Failed to create link from {source_path} to {target}: {reason}")]
    LinkFailed {
        source_path: PathBuf,
        target: PathBuf,
        reason: String,
    },

    // Library entities
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("Model import failed: {message}")]
    ImportFailed { message: String },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Download not found: {download_id}")]
    DownloadNotFound { download_id: String },

    // Cooperative cancellation
    #[error("Operation was cancelled")]
    Cancelled,

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, LibraryError>;

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LibraryError {
    fn from(err: serde_json::Error) -> Self {
        LibraryError::Metadata {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for LibraryError {
    fn from(err: rusqlite::Error) -> Self {
        LibraryError::Index {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for LibraryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LibraryError::Timeout(std::time::Duration::from_secs(0))
        } else {
            LibraryError::Network {
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
                message: err.to_string(),
            }
        }
    }
}

impl LibraryError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LibraryError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a metadata error without a serde source.
    pub fn metadata(message: impl Into<String>) -> Self {
        LibraryError::Metadata {
            message: message.into(),
            source: None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom application codes live in -32000..-32099:
    /// - -32000: network / rate limit / circuit breaker
    /// - -32002: model not found
    /// - -32003: import or download failed
    /// - -32004: cancelled by caller
    /// - -32005: validation / hash mismatch / conflicting link
    /// - -32006: immutable profile rejected
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            LibraryError::Network { .. }
            | LibraryError::Timeout(_)
            | LibraryError::RateLimited { .. }
            | LibraryError::CircuitOpen { .. } => -32000,

            LibraryError::ModelNotFound { .. } | LibraryError::DownloadNotFound { .. } => -32002,

            LibraryError::ImportFailed { .. }
            | LibraryError::DownloadFailed { .. }
            | LibraryError::LinkFailed { .. } => -32003,

            LibraryError::Cancelled => -32004,

            LibraryError::Validation { .. }
            | LibraryError::HashMismatch { .. }
            | LibraryError::ConflictingLink { .. } => -32005,

            LibraryError::ProfileImmutable { .. } => -32006,

            _ => -32603,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LibraryError::Network { .. }
                | LibraryError::Timeout(_)
                | LibraryError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_identity() {
        let err = LibraryError::ModelNotFound {
            model_id: "llm/llama/llama".into(),
        };
        assert_eq!(err.to_string(), "Model not found: llm/llama/llama");
    }

    #[test]
    fn rpc_error_codes() {
        assert_eq!(
            LibraryError::ModelNotFound {
                model_id: "x".into()
            }
            .to_rpc_error_code(),
            -32002
        );
        assert_eq!(LibraryError::Cancelled.to_rpc_error_code(), -32004);
        assert_eq!(
            LibraryError::ProfileImmutable {
                profile_id: "p".into(),
                profile_version: 1
            }
            .to_rpc_error_code(),
            -32006
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(LibraryError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(LibraryError::RateLimited {
            service: "huggingface".into(),
            retry_after_secs: Some(60)
        }
        .is_retryable());
        assert!(!LibraryError::Validation {
            field: "model_id".into(),
            message: "bad".into()
        }
        .is_retryable());
        assert!(!LibraryError::Cancelled.is_retryable());
    }
}
