//! Model importer: local files, in-place discovery, and download
//! finalization all funnel through here.
//!
//! Pipeline per candidate group: shard grouping, classification, one shared
//! hash+copy pass into a staging area, SHA-256 dedup, atomic move into the
//! canonical tree, baseline emit, index upsert. A failed file never rolls
//! back committed siblings; sharded sets stay flagged for review until every
//! shard arrives.

use crate::cancel::CancellationToken;
use crate::classify::{self, model_type, task_signature};
use crate::error::{LibraryError, Result};
use crate::hashing::{hash_file, hash_file_into, DualHash};
use crate::index::ModelIndex;
use crate::io_queue::IoQueue;
use crate::naming::{collision_suffixed, normalize_component, normalize_filename};
use crate::sharding::{detect_shard_groups, validate_shard_completeness, ShardGroup};
use crate::storage::StorageLayout;
use crate::types::{
    normalize_review_reasons, BaselineMetadata, ClassifiedValue, ImportFileOutcome, ImportReport,
    ModelFileEntry, ModelLayout, ModelType, METADATA_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Review reason recorded for shard sets with absent members.
pub const REASON_INCOMPLETE_SHARDED_SET: &str = "incomplete-sharded-set";
/// Review reason recorded for unparseable task labels.
pub const REASON_INVALID_TASK_SIGNATURE: &str = "invalid-task-signature";

/// Caller-provided hints accompanying an import request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImportHints {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Soft model-type hint; never decides the type on its own
    #[serde(default)]
    pub model_type: Option<String>,
    /// Raw task label (HF pipeline tag or free-form signature)
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(default)]
    pub source_repo_id: Option<String>,
}

/// Imports byte sources into the canonical tree.
pub struct ModelImporter {
    layout: Arc<StorageLayout>,
    index: Arc<ModelIndex>,
    io_queue: Arc<IoQueue>,
}

impl ModelImporter {
    pub fn new(layout: Arc<StorageLayout>, index: Arc<ModelIndex>, io_queue: Arc<IoQueue>) -> Self {
        Self {
            layout,
            index,
            io_queue,
        }
    }

    /// Import a set of local paths (files and/or repository directories).
    ///
    /// Returns an ordered per-file outcome report; one failing file does not
    /// abort the rest.
    pub async fn import_paths(
        &self,
        paths: &[PathBuf],
        hints: &ImportHints,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        let mut files = Vec::new();
        for path in paths {
            cancel.check()?;
            if !path.exists() {
                report.outcomes.push(ImportFileOutcome::Failed {
                    path: path.clone(),
                    reason: "path does not exist".to_string(),
                });
                continue;
            }
            if path.is_dir() {
                match self.import_directory(path, hints, cancel).await {
                    Ok((model_id, outcomes)) => {
                        report.outcomes.extend(outcomes);
                        push_unique(&mut report.model_ids, model_id);
                    }
                    Err(LibraryError::Cancelled) => return Err(LibraryError::Cancelled),
                    Err(e) => report.outcomes.push(ImportFileOutcome::Failed {
                        path: path.clone(),
                        reason: e.to_string(),
                    }),
                }
            } else {
                files.push(path.clone());
            }
        }

        for group in detect_shard_groups(&files) {
            cancel.check()?;
            match self.import_file_group(&group, hints, cancel).await {
                Ok((model_id, outcomes)) => {
                    report.outcomes.extend(outcomes);
                    push_unique(&mut report.model_ids, model_id);
                }
                Err(LibraryError::Cancelled) => return Err(LibraryError::Cancelled),
                Err(e) => {
                    for path in &group.files {
                        report.outcomes.push(ImportFileOutcome::Failed {
                            path: path.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            "Import finished: {} committed, {} failed, {} models",
            report.committed_count(),
            report.failed_count(),
            report.model_ids.len()
        );
        Ok(report)
    }

    /// Scan the canonical tree for model directories that carry weights but
    /// no `metadata.json`, and adopt them in place.
    pub async fn discover_in_place(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let models_root = self.layout.models_root().to_path_buf();

        let mut candidate_dirs = Vec::new();
        for entry in WalkDir::new(&models_root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() && !entry.path().join("metadata.json").exists() {
                candidate_dirs.push(entry.path().to_path_buf());
            }
        }

        for dir in candidate_dirs {
            cancel.check()?;
            let Some(model_id) = self.layout.model_id_for_dir(&dir) else {
                continue;
            };
            match self.adopt_in_place(&dir, &model_id, cancel).await {
                Ok(outcomes) => {
                    report.outcomes.extend(outcomes);
                    push_unique(&mut report.model_ids, model_id);
                }
                Err(LibraryError::Cancelled) => return Err(LibraryError::Cancelled),
                Err(e) => {
                    warn!("In-place adoption of {} failed: {}", dir.display(), e);
                    report.outcomes.push(ImportFileOutcome::Failed {
                        path: dir,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn import_directory(
        &self,
        dir: &Path,
        hints: &ImportHints,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ImportFileOutcome>)> {
        let members: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();
        if members.is_empty() {
            return Err(LibraryError::ImportFailed {
                message: format!("directory {} contains no files", dir.display()),
            });
        }

        let classification = classify::classify(dir)?;
        let base_name = hints
            .name
            .clone()
            .unwrap_or_else(|| dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());

        let mut staged = Vec::new();
        for path in &members {
            let rel = path
                .strip_prefix(dir)
                .map_err(|_| LibraryError::ImportFailed {
                    message: "directory member escaped its root".to_string(),
                })?
                .to_string_lossy()
                .replace('\\', "/");
            staged.push((path.clone(), rel));
        }

        self.commit_group(
            &staged,
            &base_name,
            ModelLayout::DiffusionFolder,
            classification,
            hints,
            None,
            cancel,
        )
        .await
    }

    async fn import_file_group(
        &self,
        group: &ShardGroup,
        hints: &ImportHints,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ImportFileOutcome>)> {
        let classification = classify::classify(&group.files[0])?;

        let (layout_kind, shard_validation) = if group.is_sharded {
            (
                ModelLayout::ShardedSet,
                Some(validate_shard_completeness(&group.files)),
            )
        } else {
            (ModelLayout::SingleFile, None)
        };

        let base_name = hints.name.clone().unwrap_or_else(|| {
            let stem = group
                .key
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&group.key);
            stem.to_string()
        });

        let staged: Vec<(PathBuf, String)> = group
            .files
            .iter()
            .map(|path| {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                // Shard filenames keep their numbering; plain files normalize.
                let rel = if group.is_sharded {
                    filename
                } else {
                    normalize_filename(&filename)
                };
                (path.clone(), rel)
            })
            .collect();

        self.commit_group(
            &staged,
            &base_name,
            layout_kind,
            classification,
            hints,
            shard_validation.map(|v| !v.is_complete),
            cancel,
        )
        .await
    }

    /// Shared tail of every import: hash, dedup, place, baseline, index.
    #[allow(clippy::too_many_arguments)]
    async fn commit_group(
        &self,
        sources: &[(PathBuf, String)],
        base_name: &str,
        layout_kind: ModelLayout,
        classification: classify::ClassificationHints,
        hints: &ImportHints,
        incomplete_shards: Option<bool>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ImportFileOutcome>)> {
        let mut outcomes = Vec::new();

        // Stage and hash in one pass per file.
        let staging_root = self
            .layout
            .models_root()
            .join(format!(".import-{}", uuid::Uuid::new_v4()));
        let mut entries: Vec<ModelFileEntry> = Vec::new();
        let mut staged_files: Vec<(PathBuf, String, PathBuf)> = Vec::new();
        let mut any_failed = false;

        for (source, rel_path) in sources {
            cancel.check()?;
            match self
                .stage_one(source, &staging_root.join(rel_path), cancel)
                .await
            {
                Ok(hash) => {
                    entries.push(ModelFileEntry {
                        rel_path: rel_path.clone(),
                        size_bytes: hash.size_bytes,
                        sha256: hash.sha256,
                        blake3: hash.blake3,
                    });
                    staged_files.push((source.clone(), rel_path.clone(), staging_root.join(rel_path)));
                }
                Err(LibraryError::Cancelled) => {
                    let _ = std::fs::remove_dir_all(&staging_root);
                    return Err(LibraryError::Cancelled);
                }
                Err(e) => {
                    any_failed = true;
                    outcomes.push(ImportFileOutcome::Failed {
                        path: source.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if entries.is_empty() {
            let _ = std::fs::remove_dir_all(&staging_root);
            return Err(LibraryError::ImportFailed {
                message: "no files could be staged".to_string(),
            });
        }

        // Idempotent import: same hashes, same relative paths.
        if let Some(existing) = self.index.find_duplicate(&entries)? {
            let _ = std::fs::remove_dir_all(&staging_root);
            for (source, _, _) in &staged_files {
                outcomes.push(ImportFileOutcome::Duplicate {
                    path: source.clone(),
                    model_id: existing.clone(),
                });
            }
            debug!("Import deduplicated into existing model {}", existing);
            return Ok((existing, outcomes));
        }

        // Classification and naming.
        let arch_rules = self.index.list_active_arch_rules()?;
        let config_rules = self.index.list_active_config_rules()?;
        let signals = model_type::TypeSignals {
            architectures: classification.architecture_tokens.clone(),
            config_model_type: classification.config_model_type.clone(),
        };
        let soft_hints: Vec<&str> = hints
            .model_type
            .as_deref()
            .into_iter()
            .chain(hints.task.as_deref())
            .collect();
        let resolution =
            model_type::resolve_model_type(&arch_rules, &config_rules, &signals, &soft_hints);

        let mut review_reasons: Vec<String> = resolution.review_reasons.clone();
        let model_type = resolution.model_type;

        let family = normalize_component(
            hints
                .family
                .as_deref()
                .or(classification.config_model_type.as_deref())
                .or(classification.architecture_tokens.first().map(String::as_str))
                .unwrap_or("unknown"),
        );
        let mut name = normalize_component(base_name);

        // Task signature handling.
        let task_value = self.classify_task(hints.task.as_deref(), &mut review_reasons)?;
        let (input_modalities, output_modalities) = match &task_value {
            Some((_, inputs, outputs)) => (inputs.clone(), outputs.clone()),
            None => (Vec::new(), Vec::new()),
        };

        if incomplete_shards == Some(true) || any_failed && layout_kind == ModelLayout::ShardedSet {
            review_reasons.push(REASON_INCOMPLETE_SHARDED_SET.to_string());
        }

        let mut model_id = format!("{}/{}/{}", model_type.as_str(), family, name);

        // Shard arrivals merge into the existing set; true collisions get a
        // content-hash suffix.
        let mut merged_from_existing = false;
        if let Some(existing) = self.layout.read_metadata(&model_id)? {
            if layout_kind == ModelLayout::ShardedSet && existing.layout == ModelLayout::ShardedSet {
                let mut merged = existing.files.clone();
                for entry in &entries {
                    merged.retain(|f| f.rel_path != entry.rel_path);
                    merged.push(entry.clone());
                }
                merged.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
                entries = merged;
                merged_from_existing = true;
            } else {
                name = collision_suffixed(&name, &entries[0].sha256);
                model_id = format!("{}/{}/{}", model_type.as_str(), family, name);
            }
        }

        // Re-validate shard completeness over the merged set.
        if layout_kind == ModelLayout::ShardedSet {
            let all: Vec<PathBuf> = entries.iter().map(|e| PathBuf::from(&e.rel_path)).collect();
            let validation = validate_shard_completeness(&all);
            if validation.is_complete {
                review_reasons.retain(|r| r != REASON_INCOMPLETE_SHARDED_SET);
            } else if !review_reasons.iter().any(|r| r == REASON_INCOMPLETE_SHARDED_SET) {
                review_reasons.push(REASON_INCOMPLETE_SHARDED_SET.to_string());
            }
        }

        // Move staged files into the canonical directory. Staging lives under
        // the models root, so the rename is the atomic commit.
        let model_dir = self.layout.model_dir(&model_id);
        for (source, rel_path, staged_path) in &staged_files {
            let final_path = model_dir.join(rel_path);
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LibraryError::io_with_path(e, parent))?;
            }
            match std::fs::rename(staged_path, &final_path) {
                Ok(()) => {
                    self.layout.ignore_set().mark(&final_path);
                    outcomes.push(ImportFileOutcome::Committed {
                        path: source.clone(),
                        model_id: model_id.clone(),
                    });
                }
                Err(e) => {
                    outcomes.push(ImportFileOutcome::Failed {
                        path: source.clone(),
                        reason: e.to_string(),
                    });
                    entries.retain(|entry| entry.rel_path != *rel_path);
                }
            }
        }
        let _ = std::fs::remove_dir_all(&staging_root);

        let review_reasons = normalize_review_reasons(&review_reasons);
        let total_size_bytes = entries.iter().map(|f| f.size_bytes).sum();
        let baseline = BaselineMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            model_id: model_id.clone(),
            model_type,
            family,
            name: name.clone(),
            official_name: hints.official_name.clone().or_else(|| {
                classification.extra.get("general.name").cloned()
            }),
            layout: layout_kind,
            files: entries,
            total_size_bytes,
            task_type_primary: task_value.map(|(value, _, _)| value),
            input_modalities,
            output_modalities,
            architecture_tokens: classification.architecture_tokens.clone(),
            tags: hints.tags.clone(),
            metadata_needs_review: !review_reasons.is_empty(),
            review_reasons,
            source_repo_id: hints.source_repo_id.clone(),
            dependency_bindings: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        self.layout.write_metadata(&model_id, &baseline)?;
        self.index.upsert_model(&baseline)?;

        if merged_from_existing {
            debug!("Merged shard arrivals into {}", model_id);
        }
        Ok((model_id, outcomes))
    }

    /// Hash a task label and map it to a primary task type.
    ///
    /// Unparseable labels queue a pending mapping row and flag the model,
    /// without blocking the import.
    fn classify_task(
        &self,
        raw_task: Option<&str>,
        review_reasons: &mut Vec<String>,
    ) -> Result<Option<(ClassifiedValue, Vec<String>, Vec<String>)>> {
        let Some(raw_task) = raw_task else {
            return Ok(None);
        };

        let signature = task_signature::normalize_task_signature(raw_task);
        if signature.normalization_status == task_signature::TaskNormalizationStatus::Error {
            self.index
                .record_pending_task_signature(&signature.signature_key)?;
            review_reasons.push(REASON_INVALID_TASK_SIGNATURE.to_string());
            return Ok(Some((
                ClassifiedValue {
                    value: "unknown".to_string(),
                    source: "task-signature".to_string(),
                    confidence: 0.0,
                },
                signature.input_modalities,
                signature.output_modalities,
            )));
        }

        match self.index.active_task_mapping(&signature.signature_key)? {
            Some((task_type_primary, inputs, outputs)) => Ok(Some((
                ClassifiedValue {
                    value: task_type_primary,
                    source: "task-signature-mapping".to_string(),
                    confidence: 0.9,
                },
                inputs,
                outputs,
            ))),
            None => {
                // Parseable signature with no mapping yet: queue it, keep the
                // normalized modalities.
                self.index
                    .record_pending_task_signature(&signature.signature_key)?;
                Ok(Some((
                    ClassifiedValue {
                        value: signature.signature_key.clone(),
                        source: "task-signature".to_string(),
                        confidence: 0.5,
                    },
                    signature.input_modalities,
                    signature.output_modalities,
                )))
            }
        }
    }

    /// Copy one source into the staging area, hashing along the way.
    async fn stage_one(
        &self,
        source: &Path,
        staged_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<DualHash> {
        let _permit = self.io_queue.acquire(source).await;

        let source = source.to_path_buf();
        let staged_path = staged_path.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<DualHash> {
            if let Some(parent) = staged_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LibraryError::io_with_path(e, parent))?;
            }
            let mut dest = std::fs::File::create(&staged_path)
                .map_err(|e| LibraryError::io_with_path(e, &staged_path))?;
            let hash = hash_file_into(&source, &mut dest, &cancel)?;
            dest.sync_all()
                .map_err(|e| LibraryError::io_with_path(e, &staged_path))?;
            Ok(hash)
        })
        .await
        .map_err(|e| LibraryError::Other(format!("staging task failed: {}", e)))?
    }

    /// Adopt an already-in-place model directory: hash in place, classify,
    /// write the baseline, index.
    async fn adopt_in_place(
        &self,
        dir: &Path,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ImportFileOutcome>> {
        let mut outcomes = Vec::new();
        let mut entries = Vec::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            cancel.check()?;
            let path = entry.path().to_path_buf();
            let rel = path
                .strip_prefix(dir)
                .map_err(|_| LibraryError::ImportFailed {
                    message: "member escaped model directory".to_string(),
                })?
                .to_string_lossy()
                .replace('\\', "/");

            let _permit = self.io_queue.acquire(&path).await;
            let cancel_clone = cancel.clone();
            let hash_path = path.clone();
            let hash = tokio::task::spawn_blocking(move || hash_file(&hash_path, &cancel_clone))
                .await
                .map_err(|e| LibraryError::Other(format!("hash task failed: {}", e)))??;

            entries.push(ModelFileEntry {
                rel_path: rel,
                size_bytes: hash.size_bytes,
                sha256: hash.sha256,
                blake3: hash.blake3,
            });
            outcomes.push(ImportFileOutcome::Committed {
                path,
                model_id: model_id.to_string(),
            });
        }

        let classification = classify::classify(dir)?;
        let segments: Vec<&str> = model_id.split('/').collect();
        let (model_type, family, name) = (
            segments.first().copied().unwrap_or("unknown"),
            segments.get(1).copied().unwrap_or("unknown"),
            segments.get(2).copied().unwrap_or("unknown"),
        );

        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let total_size_bytes = entries.iter().map(|f| f.size_bytes).sum();
        let baseline = BaselineMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            model_id: model_id.to_string(),
            model_type: model_type.parse::<ModelType>().unwrap_or(ModelType::Unknown),
            family: family.to_string(),
            name: name.to_string(),
            official_name: None,
            layout: if entries.len() > 1 {
                ModelLayout::DiffusionFolder
            } else {
                ModelLayout::SingleFile
            },
            files: entries,
            total_size_bytes,
            task_type_primary: None,
            input_modalities: Vec::new(),
            output_modalities: Vec::new(),
            architecture_tokens: classification.architecture_tokens,
            tags: Vec::new(),
            metadata_needs_review: false,
            review_reasons: Vec::new(),
            source_repo_id: None,
            dependency_bindings: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        self.layout.write_metadata(model_id, &baseline)?;
        self.index.upsert_model(&baseline)?;
        Ok(outcomes)
    }
}

fn push_unique(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LibraryPaths;
    use crate::registry::LinkRegistry;
    use tempfile::TempDir;

    fn gguf_file(dir: &Path, filename: &str, arch: &str, payload: &[u8]) -> PathBuf {
        // Minimal GGUF: magic, version, tensor count, one KV (architecture).
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GGUF");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        let key = b"general.architecture";
        bytes.extend_from_slice(&(key.len() as u64).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&(arch.len() as u64).to_le_bytes());
        bytes.extend_from_slice(arch.as_bytes());
        bytes.extend_from_slice(payload);

        let path = dir.join(filename);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    struct Fixture {
        _tmp: TempDir,
        inbox: PathBuf,
        layout: Arc<StorageLayout>,
        index: Arc<ModelIndex>,
        importer: ModelImporter,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = LibraryPaths::new(tmp.path().join("root"));
        let registry = Arc::new(LinkRegistry::open(paths.registry_db()).unwrap());
        let layout = Arc::new(StorageLayout::new(&paths, registry).unwrap());
        let index = Arc::new(ModelIndex::open(paths.index_db()).unwrap());
        let importer = ModelImporter::new(
            Arc::clone(&layout),
            Arc::clone(&index),
            Arc::new(IoQueue::with_uniform_slots(2)),
        );
        let inbox = tmp.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        Fixture {
            _tmp: tmp,
            inbox,
            layout,
            index,
            importer,
        }
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let fx = fixture();
        let source = gguf_file(&fx.inbox, "llama.gguf", "llama", b"weights-1");

        let first = fx
            .importer
            .import_paths(&[source.clone()], &ImportHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.model_ids, vec!["llm/llama/llama"]);
        assert_eq!(first.committed_count(), 1);
        assert!(fx.layout.model_exists("llm/llama/llama"));

        let again = fx
            .importer
            .import_paths(&[source], &ImportHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.model_ids, vec!["llm/llama/llama"]);
        assert_eq!(again.committed_count(), 0);
        assert!(matches!(
            again.outcomes[0],
            ImportFileOutcome::Duplicate { .. }
        ));
        assert_eq!(fx.index.all_model_ids().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_shard_set_flags_review_and_heals() {
        let fx = fixture();
        let hints = ImportHints {
            family: Some("llama".into()),
            model_type: Some("llm".into()),
            ..Default::default()
        };

        let s1 = gguf_file(&fx.inbox, "model-00001-of-00003.gguf", "llama", b"s1");
        let s2 = gguf_file(&fx.inbox, "model-00002-of-00003.gguf", "llama", b"s2");
        let report = fx
            .importer
            .import_paths(&[s1, s2], &hints, &CancellationToken::new())
            .await
            .unwrap();
        let model_id = report.model_ids[0].clone();

        let baseline = fx.layout.read_metadata(&model_id).unwrap().unwrap();
        assert_eq!(baseline.layout, ModelLayout::ShardedSet);
        assert!(baseline.metadata_needs_review);
        assert!(baseline
            .review_reasons
            .contains(&REASON_INCOMPLETE_SHARDED_SET.to_string()));

        let s3 = gguf_file(&fx.inbox, "model-00003-of-00003.gguf", "llama", b"s3");
        let second = fx
            .importer
            .import_paths(&[s3], &hints, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.model_ids, vec![model_id.clone()]);

        let healed = fx.layout.read_metadata(&model_id).unwrap().unwrap();
        assert_eq!(healed.files.len(), 3);
        assert!(!healed
            .review_reasons
            .contains(&REASON_INCOMPLETE_SHARDED_SET.to_string()));
    }

    #[tokio::test]
    async fn unknown_task_signature_queues_pending_row() {
        let fx = fixture();
        let source = gguf_file(&fx.inbox, "mystic.gguf", "llama", b"w");
        let hints = ImportHints {
            task: Some("galactic-to-cosmic".into()),
            ..Default::default()
        };

        let report = fx
            .importer
            .import_paths(&[source], &hints, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.committed_count(), 1);

        let baseline = fx
            .layout
            .read_metadata(&report.model_ids[0])
            .unwrap()
            .unwrap();
        assert_eq!(
            baseline.task_type_primary.as_ref().map(|t| t.value.as_str()),
            Some("unknown")
        );
        assert!(baseline
            .review_reasons
            .contains(&REASON_INVALID_TASK_SIGNATURE.to_string()));
        assert_eq!(
            fx.index.task_signature_status("unknown->unknown").unwrap(),
            Some("pending".to_string())
        );
    }

    #[tokio::test]
    async fn cancellation_leaves_no_staging_residue() {
        let fx = fixture();
        let source = gguf_file(&fx.inbox, "llama.gguf", "llama", b"weights");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fx
            .importer
            .import_paths(&[source], &ImportHints::default(), &cancel)
            .await;
        assert!(matches!(result, Err(LibraryError::Cancelled)));

        let residue: Vec<_> = std::fs::read_dir(fx.layout.models_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".import-"))
            .collect();
        assert!(residue.is_empty());
    }

    #[tokio::test]
    async fn directory_import_preserves_relative_paths() {
        let fx = fixture();
        let repo = fx.inbox.join("sdxl-base");
        std::fs::create_dir_all(repo.join("unet")).unwrap();
        std::fs::write(
            repo.join("model_index.json"),
            serde_json::json!({"_class_name": "StableDiffusionXLPipeline"}).to_string(),
        )
        .unwrap();
        std::fs::write(repo.join("unet").join("weights.bin"), b"u").unwrap();

        let hints = ImportHints {
            family: Some("sdxl".into()),
            ..Default::default()
        };
        let report = fx
            .importer
            .import_paths(&[repo], &hints, &CancellationToken::new())
            .await
            .unwrap();
        let model_id = &report.model_ids[0];
        assert!(model_id.starts_with("diffusion/sdxl/"));

        let baseline = fx.layout.read_metadata(model_id).unwrap().unwrap();
        assert_eq!(baseline.layout, ModelLayout::DiffusionFolder);
        assert!(baseline
            .files
            .iter()
            .any(|f| f.rel_path == "unet/weights.bin"));
    }

    #[tokio::test]
    async fn in_place_discovery_adopts_unindexed_dirs() {
        let fx = fixture();
        let dir = fx.layout.model_dir("llm/llama/found-on-disk");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("weights.gguf"), b"discovered").unwrap();

        let report = fx
            .importer
            .discover_in_place(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.model_ids, vec!["llm/llama/found-on-disk"]);
        assert!(fx.layout.model_exists("llm/llama/found-on-disk"));
        assert!(fx.index.contains_model("llm/llama/found-on-disk").unwrap());
    }
}
