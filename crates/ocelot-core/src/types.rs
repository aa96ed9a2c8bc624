//! Core library types and data structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current schema version for baseline metadata documents.
pub const METADATA_SCHEMA_VERSION: i64 = 1;

/// Supported model types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Large Language Model (text generation)
    Llm,
    /// Diffusion model (image/video generation)
    Diffusion,
    /// Audio model
    Audio,
    /// Vision model
    Vision,
    /// Embedding model
    Embedding,
    /// Unknown type
    #[default]
    Unknown,
}

impl ModelType {
    /// Return the canonical lowercase string for this model type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Diffusion => "diffusion",
            ModelType::Audio => "audio",
            ModelType::Vision => "vision",
            ModelType::Embedding => "embedding",
            ModelType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(ModelType::Llm),
            "diffusion" => Ok(ModelType::Diffusion),
            "audio" => Ok(ModelType::Audio),
            "vision" => Ok(ModelType::Vision),
            "embedding" => Ok(ModelType::Embedding),
            _ => Ok(ModelType::Unknown),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Physical layout of a stored model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLayout {
    /// One self-contained artifact (e.g. a GGUF file)
    SingleFile,
    /// Repository-style directory with config + weights subfolders
    DiffusionFolder,
    /// Multi-file weight set following shard naming
    ShardedSet,
}

impl ModelLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelLayout::SingleFile => "single_file",
            ModelLayout::DiffusionFolder => "diffusion_folder",
            ModelLayout::ShardedSet => "sharded_set",
        }
    }
}

/// File format detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Safetensors,
    Gguf,
    /// Legacy GGML container (also covers ggjt)
    Ggml,
    Onnx,
    /// PyTorch pickle / zip checkpoints (potentially unsafe to load)
    Pickle,
    Unknown,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Safetensors => "safetensors",
            FileFormat::Gguf => "gguf",
            FileFormat::Ggml => "ggml",
            FileFormat::Onnx => "onnx",
            FileFormat::Pickle => "pickle",
            FileFormat::Unknown => "unknown",
        }
    }
}

/// One file belonging to a stored model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelFileEntry {
    /// Path relative to the model directory
    pub rel_path: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256
    pub sha256: String,
    /// Lowercase hex BLAKE3
    pub blake3: String,
}

/// A classification attribute with provenance and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ClassifiedValue {
    pub value: String,
    /// Which signal produced the value (resolver rule set, header, caller hint)
    pub source: String,
    /// Confidence in [0.0, 1.0]
    pub confidence: f64,
}

/// Declared dependency binding reference carried in baseline metadata.
///
/// Authoritative binding rows live in the index; these references only mark
/// that bindings were declared at import time so an empty projection can be
/// distinguished from a never-bound model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeclaredBindingRef {
    pub profile_id: String,
    pub profile_version: i64,
    pub binding_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_selector: Option<String>,
    #[serde(default = "default_binding_priority")]
    pub priority: i64,
}

fn default_binding_priority() -> i64 {
    100
}

/// Immutable baseline metadata persisted as `metadata.json` per model.
///
/// Authoritative for content; the SQLite index is a rebuildable projection.
/// Edits never mutate this document — they produce overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BaselineMetadata {
    pub schema_version: i64,
    /// Canonical id: `{model_type}/{family}/{name}`
    pub model_id: String,
    pub model_type: ModelType,
    pub family: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_name: Option<String>,
    pub layout: ModelLayout,
    pub files: Vec<ModelFileEntry>,
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type_primary: Option<ClassifiedValue>,
    #[serde(default)]
    pub input_modalities: Vec<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
    #[serde(default)]
    pub architecture_tokens: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata_needs_review: bool,
    /// Sorted, deduped, lowercase
    #[serde(default)]
    pub review_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_bindings: Vec<DeclaredBindingRef>,
    /// RFC3339 import timestamp
    pub created_at: String,
}

impl BaselineMetadata {
    /// Sum of file sizes; kept denormalized for cheap listing.
    pub fn computed_total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Normalize review reasons: lowercase, deduped, sorted.
pub fn normalize_review_reasons(reasons: &[String]) -> Vec<String> {
    let mut out: Vec<String> = reasons
        .iter()
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Append a review reason, keeping the list normalized, and set the flag.
pub fn push_review_reason(metadata: &mut BaselineMetadata, reason: &str) {
    let mut reasons = metadata.review_reasons.clone();
    reasons.push(reason.to_string());
    metadata.review_reasons = normalize_review_reasons(&reasons);
    metadata.metadata_needs_review = true;
}

/// Kind of link materialized by the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Relative symlink, preferred within one filesystem
    SymlinkRelative,
    /// Absolute symlink, used across filesystems (with a warning)
    SymlinkAbsolute,
    /// Hardlink, only when symlinks are unavailable
    Hardlink,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::SymlinkRelative => "symlink_relative",
            LinkKind::SymlinkAbsolute => "symlink_absolute",
            LinkKind::Hardlink => "hardlink",
        }
    }
}

impl std::str::FromStr for LinkKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "symlink_relative" => Ok(LinkKind::SymlinkRelative),
            "symlink_absolute" => Ok(LinkKind::SymlinkAbsolute),
            "hardlink" => Ok(LinkKind::Hardlink),
            _ => Err(()),
        }
    }
}

/// One materialized link tracked for cascade delete and self-healing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LinkRecord {
    pub model_id: String,
    /// Path inside the canonical tree the link resolves to
    pub source_canonical_path: PathBuf,
    /// Path inside the application directory
    pub target_app_path: PathBuf,
    pub link_kind: LinkKind,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_tag: Option<String>,
    /// RFC3339 creation timestamp
    pub created_at: String,
}

/// Per-file outcome of an import request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ImportFileOutcome {
    Committed { path: PathBuf, model_id: String },
    Duplicate { path: PathBuf, model_id: String },
    Failed { path: PathBuf, reason: String },
}

/// Ordered report returned to the caller after an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImportReport {
    pub outcomes: Vec<ImportFileOutcome>,
    /// Models created or updated by this import
    pub model_ids: Vec<String>,
}

impl ImportReport {
    pub fn committed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ImportFileOutcome::Committed { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ImportFileOutcome::Failed { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_roundtrip() {
        for (s, t) in [
            ("llm", ModelType::Llm),
            ("diffusion", ModelType::Diffusion),
            ("audio", ModelType::Audio),
            ("vision", ModelType::Vision),
            ("embedding", ModelType::Embedding),
            ("unknown", ModelType::Unknown),
        ] {
            assert_eq!(s.parse::<ModelType>().unwrap(), t);
            assert_eq!(t.as_str(), s);
        }
        assert_eq!("whatever".parse::<ModelType>().unwrap(), ModelType::Unknown);
    }

    #[test]
    fn review_reasons_normalize() {
        let raw = vec![
            "Model-Type-Unresolved".to_string(),
            "incomplete-sharded-set".to_string(),
            "model-type-unresolved".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(
            normalize_review_reasons(&raw),
            vec!["incomplete-sharded-set", "model-type-unresolved"]
        );
    }

    #[test]
    fn push_reason_sets_flag() {
        let mut metadata = BaselineMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            model_id: "llm/llama/llama".into(),
            model_type: ModelType::Llm,
            family: "llama".into(),
            name: "llama".into(),
            official_name: None,
            layout: ModelLayout::SingleFile,
            files: vec![],
            total_size_bytes: 0,
            task_type_primary: None,
            input_modalities: vec![],
            output_modalities: vec![],
            architecture_tokens: vec![],
            tags: vec![],
            metadata_needs_review: false,
            review_reasons: vec![],
            source_repo_id: None,
            dependency_bindings: vec![],
            created_at: "2025-01-01T00:00:00Z".into(),
        };
        push_review_reason(&mut metadata, "Invalid-Task-Signature");
        assert!(metadata.metadata_needs_review);
        assert_eq!(metadata.review_reasons, vec!["invalid-task-signature"]);
    }

    #[test]
    fn baseline_serializes_snake_case() {
        let entry = ModelFileEntry {
            rel_path: "model.gguf".into(),
            size_bytes: 10,
            sha256: "aa".into(),
            blake3: "bb".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["rel_path"], "model.gguf");
        assert_eq!(json["size_bytes"], 10);
    }
}
