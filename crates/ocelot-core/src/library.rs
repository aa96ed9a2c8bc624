//! The `ModelLibrary` facade: every RPC-visible operation enters here.
//!
//! Construction rebuilds the index from the filesystem so the library is
//! queryable immediately; the index never becomes load-bearing state.

use crate::cancel::CancellationToken;
use crate::classify;
use crate::context::LibraryContext;
use crate::error::{LibraryError, Result};
use crate::hub::{
    DownloadStarted, DownloadStatus, HfClient, HubDownloader, SearchCache, TicketStore,
};
use crate::importer::{ImportHints, ModelImporter};
use crate::index::{
    DependencyBindingRecord, DependencyProfileRecord, EffectiveMetadata, ModelFilter, ModelIndex,
    ModelSort, ModelSummary, OverlayRecord,
};
use crate::mapper::{ApplyReport, ConflictChoice, MappingPlan, ModelMapper};
use crate::net::NetworkStatus;
use crate::registry::LinkRegistry;
use crate::resolver::{self, ResolverResponse};
use crate::storage::{DeleteReport, StorageLayout};
use crate::types::{BaselineMetadata, ImportReport, LinkRecord};
use crate::watcher::LibraryWatcher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Review reason left behind when a delete could not fully clean up.
const REASON_DELETE_RESIDUE: &str = "delete-residue";

/// Aggregate library health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LibraryStatus {
    pub model_count: usize,
    pub total_size_bytes: u64,
    pub link_count: usize,
    pub active_downloads: usize,
    pub index_db_path: PathBuf,
}

/// Link-health report (`get_link_health`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LinkHealthReport {
    pub total: usize,
    pub healthy: usize,
    pub broken: Vec<LinkRecord>,
}

/// File-type validation result (`validate_file_type`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileTypeReport {
    pub format: String,
    /// Formats the library knows how to classify and index
    pub supported: bool,
}

/// The central registry facade.
pub struct ModelLibrary {
    context: LibraryContext,
    index: Arc<ModelIndex>,
    layout: Arc<StorageLayout>,
    registry: Arc<LinkRegistry>,
    importer: Arc<ModelImporter>,
    mapper: ModelMapper,
    downloader: HubDownloader,
    tickets: Arc<TicketStore>,
}

impl ModelLibrary {
    /// Open (or initialize) a library under the context's root.
    pub async fn new(context: LibraryContext) -> Result<Self> {
        let registry = Arc::new(LinkRegistry::open(context.paths.registry_db())?);
        let layout = Arc::new(StorageLayout::new(&context.paths, Arc::clone(&registry))?);
        let index = Arc::new(ModelIndex::open(context.paths.index_db())?);
        let importer = Arc::new(ModelImporter::new(
            Arc::clone(&layout),
            Arc::clone(&index),
            Arc::clone(&context.io_queue),
        ));
        let mapper = ModelMapper::new(
            Arc::clone(&layout),
            Arc::clone(&index),
            Arc::clone(&registry),
            context.paths.translation_config_dir(),
        );

        let cache = Arc::new(SearchCache::open(context.paths.search_cache_db())?);
        let hf = Arc::new(HfClient::new(
            context.http.clone(),
            Arc::clone(&context.hf_gate),
            cache,
        ));
        let tickets = Arc::new(TicketStore::open(context.paths.download_tickets_file())?);
        let downloader = HubDownloader::new(
            Arc::clone(&hf),
            Arc::clone(&tickets),
            Arc::clone(&importer),
            context.paths.metadata_dir().join("download-staging"),
        );

        let library = Self {
            context,
            index,
            layout,
            registry,
            importer,
            mapper,
            downloader,
            tickets,
        };

        if let Err(e) = library.rebuild_index() {
            warn!("Index rebuild on startup failed: {}", e);
        }
        Ok(library)
    }

    pub fn context(&self) -> &LibraryContext {
        &self.context
    }

    pub fn index(&self) -> &ModelIndex {
        &self.index
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    // ========================================
    // Model CRUD
    // ========================================

    /// List models with filters, a sort key, and pagination.
    pub fn list_models(
        &self,
        filter: &ModelFilter,
        sort: ModelSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ModelSummary>> {
        self.index.list_models(filter, sort, limit, offset)
    }

    /// Full-text search over the index.
    pub fn search_models_fts(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
        model_type: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<ModelSummary>> {
        self.index.search(query, model_type, tags, limit, offset)
    }

    /// Baseline, active overlay, and effective metadata for one model.
    pub fn get_library_model_metadata(&self, model_id: &str) -> Result<EffectiveMetadata> {
        self.index.effective_metadata(model_id)
    }

    /// Import local paths, then fan links out to every installed app.
    pub async fn import_model(
        &self,
        paths: &[PathBuf],
        hints: &ImportHints,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        let report = self.importer.import_paths(paths, hints, cancel).await?;
        if !report.model_ids.is_empty() {
            if let Err(e) = self.refresh_model_mappings(None) {
                warn!("Post-import mapping refresh failed: {}", e);
            }
        }
        Ok(report)
    }

    /// Delete a model: link targets first, then the canonical directory,
    /// then the index row.
    ///
    /// Partial failure keeps the index row and flags it with a review
    /// overlay so the orphan stays visible.
    pub fn delete_model(&self, model_id: &str) -> Result<DeleteReport> {
        if !self.layout.model_exists(model_id) && !self.index.contains_model(model_id)? {
            return Err(LibraryError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }

        let report = self.layout.delete(model_id)?;
        if report.is_clean() {
            self.index.delete_model(model_id)?;
        } else if self.index.contains_model(model_id)? {
            let patch = serde_json::json!({
                "metadata_needs_review": true,
                "review_reasons": [REASON_DELETE_RESIDUE],
            });
            self.index
                .submit_overlay(model_id, &patch, "ocelot-library", Some("delete residue"))?;
        }
        Ok(report)
    }

    /// Adopt on-disk models missing from the index, then rebuild.
    pub async fn scan_shared_storage(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        let report = self.importer.discover_in_place(cancel).await?;
        self.rebuild_index()?;
        Ok(report)
    }

    /// Rebuild the index projection from `metadata.json` files on disk.
    pub fn rebuild_index(&self) -> Result<()> {
        let mut baselines: Vec<BaselineMetadata> = Vec::new();
        for model_id in self.layout.list_canonical() {
            match self.layout.read_metadata(&model_id) {
                Ok(Some(baseline)) => baselines.push(baseline),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable metadata for {}: {}", model_id, e),
            }
        }
        baselines.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        self.index.rebuild_from_filesystem(&baselines)
    }

    /// Incrementally reindex a set of model ids (watcher dispatch).
    pub fn reindex_models(&self, model_ids: &[String]) -> Result<()> {
        for model_id in model_ids {
            match self.layout.read_metadata(model_id)? {
                Some(baseline) => self.index.upsert_model(&baseline)?,
                None => {
                    if self.index.contains_model(model_id)? {
                        self.index.delete_model(model_id)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Start the filesystem watcher; events drive incremental reindex.
    pub fn start_watcher(self: Arc<Self>) -> Result<LibraryWatcher> {
        let library = Arc::clone(&self);
        LibraryWatcher::new(
            self.layout.models_root(),
            self.layout.ignore_set(),
            Box::new(move |model_ids| {
                if let Err(e) = library.reindex_models(&model_ids) {
                    warn!("Incremental reindex failed: {}", e);
                }
            }),
        )
    }

    // ========================================
    // Metadata review
    // ========================================

    /// Apply a review patch as a new active overlay.
    pub fn submit_model_review(
        &self,
        model_id: &str,
        patch: &Value,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<OverlayRecord> {
        self.index.submit_overlay(model_id, patch, reviewer, reason)
    }

    /// Revert the active overlay; baseline becomes effective again.
    pub fn reset_model_review(
        &self,
        model_id: &str,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.index.revert_overlay(model_id, reviewer, reason)
    }

    pub fn list_models_needing_review(
        &self,
        model_type: Option<&str>,
    ) -> Result<Vec<ModelSummary>> {
        self.index.models_needing_review(model_type)
    }

    /// Effective metadata document only.
    pub fn get_effective_model_metadata(&self, model_id: &str) -> Result<Value> {
        Ok(self.index.effective_metadata(model_id)?.effective_metadata)
    }

    // ========================================
    // Dependencies (resolve-only)
    // ========================================

    /// Deterministic declarative requirements report. Never installs.
    pub fn resolve_model_dependency_requirements(
        &self,
        model_id: &str,
        platform_key: &str,
        backend_key: Option<&str>,
        selected_binding_ids: Option<&[String]>,
    ) -> Result<ResolverResponse> {
        resolver::resolve_dependency_requirements(
            &self.index,
            model_id,
            platform_key,
            backend_key,
            selected_binding_ids,
        )
    }

    /// Register a content-hashed dependency profile (immutable per
    /// `(id, version)`).
    pub fn register_dependency_profile(
        &self,
        profile_id: &str,
        profile_version: i64,
        environment_kind: &str,
        spec_json: &str,
    ) -> Result<DependencyProfileRecord> {
        self.index
            .upsert_dependency_profile(profile_id, profile_version, environment_kind, spec_json)
    }

    /// Attach a binding to a model; the projection refreshes in the same
    /// transaction.
    pub fn attach_dependency_binding(&self, record: &DependencyBindingRecord) -> Result<()> {
        self.index.attach_dependency_binding(record)
    }

    // ========================================
    // HuggingFace
    // ========================================

    /// Cached HuggingFace model search.
    pub async fn search_hf_models(
        &self,
        query: &str,
        kind: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Value> {
        self.downloader
            .client()
            .search_models(query, kind, limit.unwrap_or(20))
            .await
    }

    /// Start a repository download; returns the ticket id.
    pub async fn start_model_download_from_hf(
        &self,
        repo_id: &str,
        family: &str,
        official_name: &str,
        model_type: Option<&str>,
        subtype: Option<&str>,
        quant: Option<&str>,
    ) -> Result<DownloadStarted> {
        let tags = [subtype, quant]
            .into_iter()
            .flatten()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let hints = ImportHints {
            family: Some(family.to_string()),
            name: Some(official_name.to_string()),
            model_type: model_type.map(String::from),
            tags,
            official_name: Some(official_name.to_string()),
            source_repo_id: Some(repo_id.to_string()),
            ..Default::default()
        };
        self.downloader.start_download(repo_id, hints).await
    }

    pub fn get_model_download_status(&self, download_id: &str) -> Result<DownloadStatus> {
        self.downloader.status(download_id)
    }

    pub fn cancel_model_download(&self, download_id: &str) -> Result<DownloadStatus> {
        self.downloader.cancel(download_id)
    }

    /// Resume persisted tickets from a previous run.
    pub fn resume_pending_downloads(&self) -> Result<usize> {
        self.downloader.resume_pending()
    }

    /// Re-verify cached search metadata for models this library owns.
    pub async fn refresh_owned_search_cache(&self) -> Result<usize> {
        let mut owned: Vec<String> = Vec::new();
        for model_id in self.index.all_model_ids()? {
            if let Some(blob) = self.index.get_model_blob(&model_id)? {
                if let Some(repo_id) = blob.get("source_repo_id").and_then(Value::as_str) {
                    owned.push(repo_id.to_string());
                }
            }
        }
        owned.sort();
        owned.dedup();
        self.downloader.background_refresh_owned(&owned).await
    }

    // ========================================
    // Mapping
    // ========================================

    /// Recompute and apply conflict-free mappings.
    ///
    /// With `app_id = None`, every app with a translation config refreshes.
    /// Conflicts are left for `dry_run` + `sync_with_resolutions`.
    pub fn refresh_model_mappings(&self, app_id: Option<&str>) -> Result<Vec<ApplyReport>> {
        let mut reports = Vec::new();
        for (config_app, version) in self.installed_app_configs()? {
            if let Some(app_id) = app_id {
                if app_id != config_app {
                    continue;
                }
            }
            let mut plan = self.mapper.dry_run(&config_app, &version)?;
            // Auto-apply only the conflict-free part.
            plan.conflicts.clear();
            let (_, report) = self.mapper.apply(plan, &HashMap::new())?;
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn dry_run_mapping(&self, app_id: &str, version_tag: &str) -> Result<MappingPlan> {
        Ok(self.mapper.validate(self.mapper.dry_run(app_id, version_tag)?))
    }

    /// Apply a plan with caller-provided conflict resolutions.
    pub fn sync_with_resolutions(
        &self,
        plan: MappingPlan,
        choices: &HashMap<PathBuf, ConflictChoice>,
    ) -> Result<(MappingPlan, ApplyReport)> {
        self.mapper.apply(plan, choices)
    }

    /// Repair or retire broken registered links.
    pub fn self_heal_links(&self) -> Result<crate::mapper::SelfHealReport> {
        self.mapper.self_heal()
    }

    /// Whether mapping this app crosses filesystems (absolute symlinks).
    pub fn get_cross_filesystem_warning(&self, app_id: &str) -> Result<bool> {
        for (config_app, version) in self.installed_app_configs()? {
            if config_app == app_id {
                return self.mapper.cross_filesystem_warning(app_id, &version);
            }
        }
        Err(LibraryError::Validation {
            field: "app_id".to_string(),
            message: format!("no translation config installed for {}", app_id),
        })
    }

    /// Apps with installed translation configs, as `(app_id, version)`.
    fn installed_app_configs(&self) -> Result<Vec<(String, String)>> {
        let dir = self.context.paths.translation_config_dir();
        let mut apps = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(apps);
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = filename.strip_suffix(".json") else {
                continue;
            };
            let mut parts = stem.splitn(3, '_');
            if let (Some(app), Some(version), Some(_)) = (parts.next(), parts.next(), parts.next())
            {
                let version = if version == "any" { "0.0.0" } else { version };
                apps.push((app.to_string(), version.to_string()));
            }
        }
        apps.sort();
        apps.dedup();
        Ok(apps)
    }

    // ========================================
    // Health
    // ========================================

    /// Walk the registry and report link health without mutating anything.
    pub fn get_link_health(&self, version_tag: Option<&str>) -> Result<LinkHealthReport> {
        let mut report = LinkHealthReport::default();
        for record in self.registry.all_records()? {
            if let Some(version_tag) = version_tag {
                if record.version_tag.as_deref() != Some(version_tag) {
                    continue;
                }
            }
            report.total += 1;
            let alive = std::fs::metadata(&record.target_app_path).is_ok()
                && record.source_canonical_path.exists();
            if alive {
                report.healthy += 1;
            } else {
                report.broken.push(record);
            }
        }
        Ok(report)
    }

    pub fn get_network_status(&self) -> NetworkStatus {
        self.context.hf_gate.status()
    }

    pub fn get_library_status(&self) -> Result<LibraryStatus> {
        let summaries = self.index.list_models(
            &ModelFilter::default(),
            ModelSort::ModelId,
            i64::MAX as usize,
            0,
        )?;
        let active_downloads = self
            .tickets
            .all()?
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .count();
        Ok(LibraryStatus {
            model_count: summaries.len(),
            total_size_bytes: summaries.iter().map(|s| s.total_size_bytes).sum(),
            link_count: self.registry.count()?,
            active_downloads,
            index_db_path: self.index.db_path().to_path_buf(),
        })
    }

    /// Inspect a file's magic bytes and report its format.
    pub fn validate_file_type(&self, path: &Path) -> Result<FileTypeReport> {
        let format = classify::detect_format(path)?;
        Ok(FileTypeReport {
            format: format.as_str().to_string(),
            supported: format != crate::types::FileFormat::Unknown,
        })
    }
}
