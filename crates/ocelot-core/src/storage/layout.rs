//! Canonical directory tree `{model_type}/{family}/{name}/` and its
//! atomic-write protocol.

use crate::config::LibraryPaths;
use crate::error::{LibraryError, Result};
use crate::registry::LinkRegistry;
use crate::storage::atomic::{atomic_write_json, atomic_write_stream, FileLock};
use crate::storage::ignore::WriteIgnoreSet;
use crate::types::BaselineMetadata;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Advisory lock filename inside each model directory.
const MODEL_LOCK_FILENAME: &str = ".ocelot.lock";

/// Outcome of a cascade delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeleteReport {
    pub model_id: String,
    /// Link targets removed ahead of the canonical directory
    pub removed_links: Vec<PathBuf>,
    /// Paths that could not be removed, with the failure reason
    pub residue: Vec<(PathBuf, String)>,
}

impl DeleteReport {
    /// Whether everything came off disk cleanly.
    pub fn is_clean(&self) -> bool {
        self.residue.is_empty()
    }
}

/// Owns the canonical model tree.
pub struct StorageLayout {
    models_root: PathBuf,
    registry: Arc<LinkRegistry>,
    ignore_set: Arc<WriteIgnoreSet>,
}

impl StorageLayout {
    /// Create the layout, ensuring the tree root exists.
    pub fn new(paths: &LibraryPaths, registry: Arc<LinkRegistry>) -> Result<Self> {
        let models_root = paths.models_root();
        std::fs::create_dir_all(&models_root)
            .map_err(|e| LibraryError::io_with_path(e, &models_root))?;
        Ok(Self {
            models_root,
            registry,
            ignore_set: Arc::new(WriteIgnoreSet::new()),
        })
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    /// Own-write suppression set shared with the watcher.
    pub fn ignore_set(&self) -> Arc<WriteIgnoreSet> {
        Arc::clone(&self.ignore_set)
    }

    /// Absolute directory for a canonical model id.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.models_root.join(model_id)
    }

    /// Model id for a directory under the tree, if it is one.
    pub fn model_id_for_dir(&self, model_dir: &Path) -> Option<String> {
        model_dir
            .strip_prefix(&self.models_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    /// Stream bytes into `{model_dir}/{rel_path}` atomically.
    ///
    /// Writes to a temp sibling, fsyncs, renames. The rename is the commit
    /// point: a crash before it leaves nothing indexable behind.
    pub fn place(&self, model_id: &str, rel_path: &str, reader: &mut impl Read) -> Result<PathBuf> {
        let final_path = self.model_dir(model_id).join(rel_path);
        atomic_write_stream(&final_path, reader)?;
        self.ignore_set.mark(&final_path);
        Ok(final_path)
    }

    /// Write `metadata.json` atomically under the per-model advisory lock.
    pub fn write_metadata(&self, model_id: &str, baseline: &BaselineMetadata) -> Result<()> {
        let model_dir = self.model_dir(model_id);
        let _lock = FileLock::acquire(&model_dir.join(MODEL_LOCK_FILENAME))?;
        let path = model_dir.join(LibraryPaths::MODEL_METADATA_FILENAME);
        atomic_write_json(&path, baseline)?;
        self.ignore_set.mark(&path);
        Ok(())
    }

    /// Read `metadata.json` for a model, `None` when absent.
    pub fn read_metadata(&self, model_id: &str) -> Result<Option<BaselineMetadata>> {
        let path = self
            .model_dir(model_id)
            .join(LibraryPaths::MODEL_METADATA_FILENAME);
        crate::storage::atomic::atomic_read_json(&path)
    }

    /// Whether a canonical directory with metadata exists for the id.
    pub fn model_exists(&self, model_id: &str) -> bool {
        self.model_dir(model_id)
            .join(LibraryPaths::MODEL_METADATA_FILENAME)
            .exists()
    }

    /// Enumerate canonical model ids by scanning for `metadata.json` files.
    pub fn list_canonical(&self) -> Vec<String> {
        WalkDir::new(&self.models_root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && e.file_name() == LibraryPaths::MODEL_METADATA_FILENAME
            })
            .filter_map(|e| {
                e.path()
                    .parent()
                    .and_then(|dir| self.model_id_for_dir(dir))
            })
            .collect()
    }

    /// Remove a model: every registered link target first, then the
    /// canonical directory.
    ///
    /// Partial failures do not abort; they are reported as residue and the
    /// caller keeps the index entry marked orphaned until a later pass
    /// succeeds.
    pub fn delete(&self, model_id: &str) -> Result<DeleteReport> {
        let mut report = DeleteReport {
            model_id: model_id.to_string(),
            ..Default::default()
        };

        for record in self.registry.remove_all_for_model(model_id)? {
            let target = &record.target_app_path;
            match remove_link_target(target) {
                Ok(()) => report.removed_links.push(target.clone()),
                Err(e) => {
                    warn!("Failed to unlink {}: {}", target.display(), e);
                    report.residue.push((target.clone(), e.to_string()));
                }
            }
        }

        let model_dir = self.model_dir(model_id);
        if model_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&model_dir) {
                report.residue.push((model_dir.clone(), e.to_string()));
            }
        }

        info!(
            "Deleted model {} ({} links removed, {} residue)",
            model_id,
            report.removed_links.len(),
            report.residue.len()
        );
        Ok(report)
    }
}

/// Remove a link target; absent targets are not an error.
fn remove_link_target(target: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(meta) => {
            if meta.is_dir() {
                std::fs::remove_dir_all(target)
            } else {
                std::fs::remove_file(target)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LinkKind, LinkRecord, ModelLayout, ModelType, METADATA_SCHEMA_VERSION};
    use tempfile::TempDir;

    fn baseline(model_id: &str) -> BaselineMetadata {
        BaselineMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            model_id: model_id.to_string(),
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
        }
    }

    fn setup() -> (TempDir, StorageLayout) {
        let tmp = TempDir::new().unwrap();
        let paths = LibraryPaths::new(tmp.path());
        let registry = Arc::new(LinkRegistry::open(paths.registry_db()).unwrap());
        let layout = StorageLayout::new(&paths, registry).unwrap();
        (tmp, layout)
    }

    #[test]
    fn place_commits_atomically() {
        let (_tmp, layout) = setup();
        let path = layout
            .place("llm/llama/llama", "model.gguf", &mut &b"GGUF-bytes"[..])
            .unwrap();
        assert!(path.ends_with("llm/llama/llama/model.gguf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"GGUF-bytes");
        assert!(layout.ignore_set().should_ignore(&path));
    }

    #[test]
    fn metadata_roundtrip_and_listing() {
        let (_tmp, layout) = setup();
        layout
            .write_metadata("llm/llama/llama", &baseline("llm/llama/llama"))
            .unwrap();
        layout
            .write_metadata("diffusion/sdxl/base", &{
                let mut b = baseline("diffusion/sdxl/base");
                b.model_type = ModelType::Diffusion;
                b
            })
            .unwrap();

        let read = layout.read_metadata("llm/llama/llama").unwrap().unwrap();
        assert_eq!(read.model_id, "llm/llama/llama");

        let mut ids = layout.list_canonical();
        ids.sort();
        assert_eq!(ids, vec!["diffusion/sdxl/base", "llm/llama/llama"]);
    }

    #[test]
    fn delete_cascades_through_registry() {
        let (tmp, layout) = setup();
        let model_id = "llm/llama/llama";
        layout
            .place(model_id, "model.gguf", &mut &b"bytes"[..])
            .unwrap();
        layout.write_metadata(model_id, &baseline(model_id)).unwrap();

        // Materialize a fake app link and register it.
        let app_dir = tmp.path().join("app-models");
        std::fs::create_dir_all(&app_dir).unwrap();
        let target = app_dir.join("model.gguf");
        std::fs::write(&target, b"linked").unwrap();
        layout
            .registry
            .register(&LinkRecord {
                model_id: model_id.to_string(),
                source_canonical_path: layout.model_dir(model_id).join("model.gguf"),
                target_app_path: target.clone(),
                link_kind: LinkKind::SymlinkRelative,
                app_id: "comfyui".into(),
                version_tag: None,
                created_at: "2025-01-01T00:00:00Z".into(),
            })
            .unwrap();

        let report = layout.delete(model_id).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.removed_links, vec![target.clone()]);
        assert!(!target.exists());
        assert!(!layout.model_dir(model_id).exists());
        assert_eq!(layout.registry.count().unwrap(), 0);
    }

    #[test]
    fn delete_ignores_absent_targets() {
        let (_tmp, layout) = setup();
        let model_id = "llm/llama/llama";
        layout.write_metadata(model_id, &baseline(model_id)).unwrap();
        layout
            .registry
            .register(&LinkRecord {
                model_id: model_id.to_string(),
                source_canonical_path: layout.model_dir(model_id).join("model.gguf"),
                target_app_path: PathBuf::from("/definitely/not/here.gguf"),
                link_kind: LinkKind::SymlinkAbsolute,
                app_id: "comfyui".into(),
                version_tag: None,
                created_at: "2025-01-01T00:00:00Z".into(),
            })
            .unwrap();

        let report = layout.delete(model_id).unwrap();
        assert!(report.is_clean());
    }
}
