//! Mapper: projects the canonical tree into application directory layouts
//! without copying bytes.
//!
//! Plans move `draft -> validated -> (applied | aborted)`. Every materialized
//! link lands in the registry so cascade delete and self-healing can find it
//! later. Per-link failures never abort a plan.

pub mod config;

pub use config::{
    expand_template, load_translation_config, version_matches, ModelRule, RuleMatch, RuleOverride,
    TranslationConfig,
};

use crate::error::{LibraryError, Result};
use crate::index::{ModelFilter, ModelIndex, ModelSort};
use crate::registry::LinkRegistry;
use crate::storage::StorageLayout;
use crate::types::{LinkKind, LinkRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mapping plan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Draft,
    Validated,
    Applied,
    Aborted,
}

/// One link the plan intends to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlannedLink {
    pub model_id: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub link_kind: LinkKind,
}

/// A target that exists and is not one of our links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MappingConflict {
    pub model_id: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub reason: String,
}

/// Caller decision for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Skip,
    Overwrite,
    Rename,
}

/// Computed mapping plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MappingPlan {
    pub app_id: String,
    pub version_tag: String,
    pub state: PlanState,
    pub creates: Vec<PlannedLink>,
    /// Targets already linked correctly
    pub skips: Vec<PlannedLink>,
    pub conflicts: Vec<MappingConflict>,
    /// True when any link must span filesystems (absolute symlinks)
    pub cross_filesystem: bool,
}

impl MappingPlan {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ApplyReport {
    pub created: Vec<LinkRecord>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Outcome of a self-heal pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SelfHealReport {
    pub repaired: Vec<LinkRecord>,
    pub removed: Vec<LinkRecord>,
}

/// Materializes application-side views of the canonical tree.
pub struct ModelMapper {
    layout: Arc<StorageLayout>,
    index: Arc<ModelIndex>,
    registry: Arc<LinkRegistry>,
    config_dir: PathBuf,
}

impl ModelMapper {
    pub fn new(
        layout: Arc<StorageLayout>,
        index: Arc<ModelIndex>,
        registry: Arc<LinkRegistry>,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            layout,
            index,
            registry,
            config_dir,
        }
    }

    /// Compute the plan for an app/version without touching the filesystem.
    pub fn dry_run(&self, app_id: &str, version_tag: &str) -> Result<MappingPlan> {
        let config = load_translation_config(&self.config_dir, app_id, version_tag)?;

        let mut plan = MappingPlan {
            app_id: app_id.to_string(),
            version_tag: version_tag.to_string(),
            state: PlanState::Draft,
            creates: Vec::new(),
            skips: Vec::new(),
            conflicts: Vec::new(),
            cross_filesystem: false,
        };

        let summaries = self.index.list_models(
            &ModelFilter::default(),
            ModelSort::ModelId,
            i64::MAX as usize,
            0,
        )?;
        for summary in &summaries {
            let override_entry = config.overrides.iter().find(|o| {
                o.model_id == summary.model_id && version_matches(&o.version_range, version_tag)
            });
            if override_entry.map(|o| o.skip) == Some(true) {
                continue;
            }

            let rule = config.model_rules.iter().find(|rule| {
                rule.match_clause.matches(
                    &summary.model_type,
                    &summary.family,
                    &effective_tags(&summary.effective_metadata),
                )
            });
            let Some(rule) = rule else {
                continue;
            };

            let template = override_entry
                .and_then(|o| o.target_path_template.as_deref())
                .unwrap_or(&rule.target_path_template);
            let link_preference = override_entry
                .and_then(|o| o.link_preference.as_deref())
                .or(rule.link_preference.as_deref());

            for file in model_files(&summary.effective_metadata) {
                let source = self.layout.model_dir(&summary.model_id).join(&file);
                let filename = Path::new(&file)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.clone());
                let target = config.app_root.join(expand_template(
                    template,
                    &summary.model_type,
                    &summary.family,
                    &summary.name,
                    &filename,
                ));

                let link_kind = choose_link_kind(&source, &target, link_preference);
                if link_kind == LinkKind::SymlinkAbsolute {
                    plan.cross_filesystem = true;
                }

                let planned = PlannedLink {
                    model_id: summary.model_id.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    link_kind,
                };

                if target.exists() || target.symlink_metadata().is_ok() {
                    match self.registry.get_by_target(&target)? {
                        Some(record) if record.source_canonical_path == source => {
                            plan.skips.push(planned);
                        }
                        _ => plan.conflicts.push(MappingConflict {
                            model_id: summary.model_id.clone(),
                            source,
                            target,
                            reason: "target exists and is not a registered link".to_string(),
                        }),
                    }
                } else {
                    plan.creates.push(planned);
                }
            }
        }

        debug!(
            "Plan for {}@{}: {} creates, {} skips, {} conflicts",
            app_id,
            version_tag,
            plan.creates.len(),
            plan.skips.len(),
            plan.conflicts.len()
        );
        Ok(plan)
    }

    /// Validate a draft plan: conflict-free plans advance to `validated`.
    pub fn validate(&self, mut plan: MappingPlan) -> MappingPlan {
        if plan.state == PlanState::Draft && !plan.has_conflicts() {
            plan.state = PlanState::Validated;
        }
        plan
    }

    /// Apply a plan, materializing links and registering each one.
    ///
    /// Conflicts must carry a caller decision (`skip` / `overwrite` /
    /// `rename`); an undecided conflict aborts the plan before any link is
    /// written.
    pub fn apply(
        &self,
        mut plan: MappingPlan,
        choices: &HashMap<PathBuf, ConflictChoice>,
    ) -> Result<(MappingPlan, ApplyReport)> {
        if plan.state == PlanState::Applied || plan.state == PlanState::Aborted {
            return Err(LibraryError::Validation {
                field: "plan.state".to_string(),
                message: format!("plan is already {:?}", plan.state),
            });
        }
        let undecided = plan
            .conflicts
            .iter()
            .find(|c| !choices.contains_key(&c.target))
            .map(|c| c.target.clone());
        if let Some(target) = undecided {
            plan.state = PlanState::Aborted;
            return Err(LibraryError::ConflictingLink { target });
        }
        plan.state = PlanState::Validated;

        let mut report = ApplyReport::default();

        // Resolved conflicts first, then clean creates.
        let mut work: Vec<PlannedLink> = Vec::new();
        for conflict in &plan.conflicts {
            match choices[&conflict.target] {
                ConflictChoice::Skip => report.skipped.push(conflict.target.clone()),
                ConflictChoice::Overwrite => {
                    if let Err(e) = remove_existing_target(&conflict.target) {
                        report.failed.push((conflict.target.clone(), e.to_string()));
                        continue;
                    }
                    work.push(PlannedLink {
                        model_id: conflict.model_id.clone(),
                        source: conflict.source.clone(),
                        target: conflict.target.clone(),
                        link_kind: choose_link_kind(&conflict.source, &conflict.target, None),
                    });
                }
                ConflictChoice::Rename => {
                    let renamed = renamed_target(&conflict.target);
                    work.push(PlannedLink {
                        model_id: conflict.model_id.clone(),
                        source: conflict.source.clone(),
                        target: renamed.clone(),
                        link_kind: choose_link_kind(&conflict.source, &renamed, None),
                    });
                }
            }
        }
        work.extend(plan.creates.iter().cloned());

        for planned in work {
            match self.materialize(&planned, &plan.app_id, &plan.version_tag) {
                Ok(record) => report.created.push(record),
                Err(e) => {
                    warn!(
                        "Link {} -> {} failed: {}",
                        planned.source.display(),
                        planned.target.display(),
                        e
                    );
                    report.failed.push((planned.target.clone(), e.to_string()));
                }
            }
        }

        plan.state = PlanState::Applied;
        info!(
            "Applied mapping plan for {}@{}: {} created, {} failed",
            plan.app_id,
            plan.version_tag,
            report.created.len(),
            report.failed.len()
        );
        Ok((plan, report))
    }

    /// Create one link on disk and record it.
    fn materialize(
        &self,
        planned: &PlannedLink,
        app_id: &str,
        version_tag: &str,
    ) -> Result<LinkRecord> {
        if let Some(parent) = planned.target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LibraryError::io_with_path(e, parent))?;
        }

        let kind = create_link(&planned.source, &planned.target, planned.link_kind)?;
        let record = LinkRecord {
            model_id: planned.model_id.clone(),
            source_canonical_path: planned.source.clone(),
            target_app_path: planned.target.clone(),
            link_kind: kind,
            app_id: app_id.to_string(),
            version_tag: Some(version_tag.to_string()),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.registry.register(&record)?;
        Ok(record)
    }

    /// Walk the registry and repair or retire broken links.
    ///
    /// A broken link is re-pointed at any library copy with the same SHA-256;
    /// unrepairable entries are unregistered and reported.
    pub fn self_heal(&self) -> Result<SelfHealReport> {
        let mut report = SelfHealReport::default();

        for record in self.registry.all_records()? {
            let target_alive = record.target_app_path.symlink_metadata().is_ok()
                && std::fs::metadata(&record.target_app_path).is_ok();
            let source_alive = record.source_canonical_path.exists();
            if target_alive && source_alive {
                continue;
            }

            match self.relocate_source(&record)? {
                Some(new_source) => {
                    let _ = remove_existing_target(&record.target_app_path);
                    let planned = PlannedLink {
                        model_id: record.model_id.clone(),
                        source: new_source,
                        target: record.target_app_path.clone(),
                        link_kind: choose_link_kind(
                            &record.source_canonical_path,
                            &record.target_app_path,
                            None,
                        ),
                    };
                    match self.materialize(
                        &planned,
                        &record.app_id,
                        record.version_tag.as_deref().unwrap_or("any"),
                    ) {
                        Ok(new_record) => report.repaired.push(new_record),
                        Err(e) => {
                            warn!(
                                "Could not repair link {}: {}",
                                record.target_app_path.display(),
                                e
                            );
                            self.registry.unregister(&record.target_app_path)?;
                            report.removed.push(record);
                        }
                    }
                }
                None => {
                    self.registry.unregister(&record.target_app_path)?;
                    let _ = remove_existing_target(&record.target_app_path);
                    report.removed.push(record);
                }
            }
        }

        info!(
            "Self-heal: {} repaired, {} removed",
            report.repaired.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Find a live library copy of the bytes a record pointed at.
    fn relocate_source(&self, record: &LinkRecord) -> Result<Option<PathBuf>> {
        if record.source_canonical_path.exists() {
            return Ok(Some(record.source_canonical_path.clone()));
        }

        // Recover the hash from the owning model's file entry.
        let Some(blob) = self.index.get_model_blob(&record.model_id)? else {
            return Ok(None);
        };
        let model_dir = self.layout.model_dir(&record.model_id);
        let wanted_rel = record
            .source_canonical_path
            .strip_prefix(&model_dir)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"));
        let sha256 = blob
            .get("files")
            .and_then(Value::as_array)
            .and_then(|files| {
                files.iter().find(|f| {
                    f.get("rel_path").and_then(Value::as_str) == wanted_rel.as_deref()
                })
            })
            .and_then(|f| f.get("sha256"))
            .and_then(Value::as_str)
            .map(String::from);
        let Some(sha256) = sha256 else {
            return Ok(None);
        };

        for (model_id, rel_path) in self.index.models_with_sha256(&sha256)? {
            let candidate = self.layout.model_dir(&model_id).join(&rel_path);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Remove every registered link for a model and unlink each target.
    ///
    /// Already-absent targets are ignored.
    pub fn cascade_unlink(&self, model_id: &str) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for record in self.registry.remove_all_for_model(model_id)? {
            match remove_existing_target(&record.target_app_path) {
                Ok(()) => removed.push(record.target_app_path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Failed to unlink {}: {}",
                        record.target_app_path.display(),
                        e
                    );
                }
            }
        }
        Ok(removed)
    }

    /// Whether mapping this app would require cross-filesystem links.
    pub fn cross_filesystem_warning(&self, app_id: &str, version_tag: &str) -> Result<bool> {
        let config = load_translation_config(&self.config_dir, app_id, version_tag)?;
        Ok(!same_filesystem(
            self.layout.models_root(),
            &config.app_root,
        ))
    }
}

fn effective_tags(effective: &Value) -> Vec<String> {
    effective
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn model_files(effective: &Value) -> Vec<String> {
    effective
        .get("files")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|f| f.get("rel_path").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Pick the link kind: relative symlink within one filesystem, absolute
/// symlink across filesystems, hardlink only when asked for (or when
/// symlinks fail at creation time).
fn choose_link_kind(source: &Path, target: &Path, preference: Option<&str>) -> LinkKind {
    if preference == Some("hardlink") {
        return LinkKind::Hardlink;
    }
    if same_filesystem(source, target) {
        LinkKind::SymlinkRelative
    } else {
        LinkKind::SymlinkAbsolute
    }
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    fn device_of(path: &Path) -> Option<u64> {
        let mut probe = path;
        loop {
            if let Ok(meta) = std::fs::metadata(probe) {
                return Some(meta.dev());
            }
            probe = probe.parent()?;
        }
    }

    match (device_of(a), device_of(b)) {
        (Some(da), Some(db)) => da == db,
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_filesystem(a: &Path, b: &Path) -> bool {
    // Best effort off unix: compare path roots (drive letters).
    a.components().next() == b.components().next()
}

/// Create the link on disk, degrading symlink -> hardlink when the platform
/// refuses symlinks. Returns the kind actually created.
fn create_link(source: &Path, target: &Path, kind: LinkKind) -> Result<LinkKind> {
    match kind {
        LinkKind::Hardlink => {
            std::fs::hard_link(source, target).map_err(|e| LibraryError::LinkFailed {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;
            Ok(LinkKind::Hardlink)
        }
        LinkKind::SymlinkRelative => {
            let relative = relative_path(target.parent().unwrap_or(Path::new("")), source);
            match create_symlink(&relative, target) {
                Ok(()) => Ok(LinkKind::SymlinkRelative),
                // Symlinks unavailable (e.g. unprivileged Windows): hardlink.
                Err(_) => create_link(source, target, LinkKind::Hardlink),
            }
        }
        LinkKind::SymlinkAbsolute => match create_symlink(source, target) {
            Ok(()) => Ok(LinkKind::SymlinkAbsolute),
            Err(e) => Err(LibraryError::LinkFailed {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            }),
        },
    }
}

#[cfg(unix)]
fn create_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn create_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, target)
}

/// Relative path from `base` to `path` (lexical, no filesystem access).
fn relative_path(base: &Path, path: &Path) -> PathBuf {
    use std::path::Component;

    let base_components: Vec<Component> = base.components().collect();
    let path_components: Vec<Component> = path.components().collect();

    let common = base_components
        .iter()
        .zip(path_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &path_components[common..] {
        relative.push(component);
    }
    relative
}

fn remove_existing_target(target: &Path) -> std::io::Result<()> {
    match target.symlink_metadata() {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target),
        Ok(_) => std::fs::remove_file(target),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn renamed_target(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "link".to_string());
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = target.parent().unwrap_or(Path::new(""));

    for n in 1..1000 {
        let candidate = parent.join(format!("{}-{}{}", stem, n, ext));
        if candidate.symlink_metadata().is_err() {
            return candidate;
        }
    }
    parent.join(format!("{}-{}{}", stem, uuid::Uuid::new_v4(), ext))
}
