//! Web-source capability trait.
//!
//! The downloader is written against this trait rather than HuggingFace
//! directly; a source declares which of the three capabilities it supports.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Capabilities a web source may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCapability {
    /// Free-text model search
    Search,
    /// Repository metadata (file lists, sizes, hashes)
    Metadata,
    /// Ranged file streaming for resumable downloads
    StreamFile,
}

/// A remote model source.
#[async_trait]
pub trait WebSource: Send + Sync {
    /// Unique source identifier (e.g. "huggingface").
    fn id(&self) -> &'static str;

    /// Domains this source connects to, for circuit-breaker tracking.
    fn domains(&self) -> &[&'static str];

    /// Capability set of this source.
    fn capabilities(&self) -> &[SourceCapability];

    /// Search the source. Sources without [`SourceCapability::Search`]
    /// return an empty result.
    async fn search(&self, query: &str, kind: Option<&str>, limit: usize) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSource;

    #[async_trait]
    impl WebSource for NullSource {
        fn id(&self) -> &'static str {
            "null"
        }

        fn domains(&self) -> &[&'static str] {
            &["null.example"]
        }

        fn capabilities(&self) -> &[SourceCapability] {
            &[SourceCapability::Metadata]
        }

        async fn search(&self, _query: &str, _kind: Option<&str>, _limit: usize) -> Result<Value> {
            Ok(Value::Array(vec![]))
        }
    }

    #[tokio::test]
    async fn capability_set_is_declared() {
        let source = NullSource;
        assert_eq!(source.id(), "null");
        assert!(!source.capabilities().contains(&SourceCapability::Search));
        assert_eq!(source.search("x", None, 5).await.unwrap(), Value::Array(vec![]));
    }
}
