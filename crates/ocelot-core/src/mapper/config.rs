//! Per-application translation configs.
//!
//! Configs live at
//! `launcher-data/config/model-library-translation/{app}_{appver}_{modelcfg}.json`
//! and describe how canonical models project into an application's expected
//! directory layout. Version constraints accept exact versions, wildcards
//! (`*`), and range expressions (`>=0.5,<0.7`).

use crate::error::{LibraryError, Result};
use crate::storage::atomic_read_json;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Match clause of one mapping rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuleMatch {
    #[serde(default)]
    pub model_types: Option<Vec<String>>,
    #[serde(default)]
    pub families: Option<Vec<String>>,
    /// OR semantics over tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_tags: Option<Vec<String>>,
}

/// One mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelRule {
    #[serde(rename = "match", default)]
    pub match_clause: RuleMatch,
    /// Target path relative to the app root; placeholders:
    /// `{model_type}`, `{family}`, `{name}`, `{filename}`
    pub target_path_template: String,
    /// `symlink` (default) or `hardlink`
    #[serde(default)]
    pub link_preference: Option<String>,
}

/// Per-model override keyed by `(model_id, version_range)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuleOverride {
    pub model_id: String,
    /// Applies when the app version matches; `*` matches everything
    #[serde(default = "default_version_range")]
    pub version_range: String,
    #[serde(default)]
    pub target_path_template: Option<String>,
    #[serde(default)]
    pub link_preference: Option<String>,
    /// Exclude the model from this app entirely
    #[serde(default)]
    pub skip: bool,
}

fn default_version_range() -> String {
    "*".to_string()
}

/// One translation config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TranslationConfig {
    pub schema_version: i64,
    pub app_id: String,
    /// Version constraint this config applies to (`*` for any)
    #[serde(default = "default_version_range")]
    pub version: String,
    /// Application model root the templates resolve under
    pub app_root: PathBuf,
    pub model_rules: Vec<ModelRule>,
    #[serde(default)]
    pub overrides: Vec<RuleOverride>,
    /// Directories the app expects to exist
    #[serde(default)]
    pub app_directories: Vec<String>,
}

impl RuleMatch {
    /// Whether a model summary satisfies this clause.
    pub fn matches(
        &self,
        model_type: &str,
        family: &str,
        tags: &[String],
    ) -> bool {
        if let Some(ref types) = self.model_types {
            if !types.iter().any(|t| t == model_type) {
                return false;
            }
        }
        if let Some(ref families) = self.families {
            if !families.iter().any(|f| f == family) {
                return false;
            }
        }
        if let Some(ref wanted) = self.tags {
            if !wanted.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(ref excluded) = self.exclude_tags {
            if excluded.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

/// Match a version constraint: exact, `*`, or a range like `>=0.5,<0.7`.
pub fn version_matches(constraint: &str, version: &str) -> bool {
    let constraint = constraint.trim();
    if constraint.is_empty() || constraint == "*" {
        return true;
    }

    let Some(version) = lenient_version(version) else {
        return false;
    };

    if let Some(exact) = lenient_version(constraint) {
        return exact == version;
    }
    match VersionReq::parse(constraint) {
        Ok(req) => req.matches(&version),
        Err(_) => false,
    }
}

/// Parse versions leniently: `0.5` becomes `0.5.0`.
fn lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Load the best translation config for `(app_id, version_tag)`.
///
/// Filenames follow `{app}_{appver}_{modelcfg}.json`; the in-document
/// `version` constraint is re-checked so wildcard files can host ranges.
pub fn load_translation_config(
    config_dir: &Path,
    app_id: &str,
    version_tag: &str,
) -> Result<TranslationConfig> {
    let entries = std::fs::read_dir(config_dir).map_err(|e| LibraryError::Io {
        message: format!("Cannot read translation config dir: {}", e),
        path: Some(config_dir.to_path_buf()),
        source: Some(e),
    })?;

    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let filename = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = filename.strip_suffix(".json") else {
            continue;
        };
        let mut parts = stem.splitn(3, '_');
        let (Some(file_app), Some(file_ver), Some(_cfg)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if file_app != app_id {
            continue;
        }
        if file_ver != "any" && !version_matches(file_ver, version_tag) {
            continue;
        }
        candidates.push((entry.path(), file_ver.to_string()));
    }

    // Exact version files beat wildcard files.
    candidates.sort_by_key(|(_, ver)| (ver == "any", ver.clone()));

    for (path, _) in candidates {
        let Some(config) = atomic_read_json::<TranslationConfig>(&path)? else {
            continue;
        };
        if config.app_id != app_id {
            continue;
        }
        if !version_matches(&config.version, version_tag) {
            continue;
        }
        debug!(
            "Loaded translation config {} for {}@{}",
            path.display(),
            app_id,
            version_tag
        );
        return Ok(config);
    }

    Err(LibraryError::Validation {
        field: "translation_config".to_string(),
        message: format!(
            "no translation config matches {}@{} under {}",
            app_id,
            version_tag,
            config_dir.display()
        ),
    })
}

/// Expand a target template for one model file.
pub fn expand_template(
    template: &str,
    model_type: &str,
    family: &str,
    name: &str,
    filename: &str,
) -> String {
    template
        .replace("{model_type}", model_type)
        .replace("{family}", family)
        .replace("{name}", name)
        .replace("{filename}", filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn version_constraints() {
        assert!(version_matches("*", "0.6.0"));
        assert!(version_matches("0.6.0", "0.6.0"));
        assert!(version_matches("0.6", "0.6.0"));
        assert!(!version_matches("0.6.0", "0.7.0"));
        assert!(version_matches(">=0.5, <0.7", "0.6.2"));
        assert!(!version_matches(">=0.5, <0.7", "0.7.0"));
    }

    #[test]
    fn rule_match_clauses() {
        let clause = RuleMatch {
            model_types: Some(vec!["diffusion".into()]),
            families: None,
            tags: Some(vec!["checkpoint".into(), "base".into()]),
            exclude_tags: Some(vec!["broken".into()]),
        };
        assert!(clause.matches("diffusion", "sdxl", &["base".into()]));
        assert!(!clause.matches("llm", "llama", &["base".into()]));
        assert!(!clause.matches("diffusion", "sdxl", &["other".into()]));
        assert!(!clause.matches("diffusion", "sdxl", &["base".into(), "broken".into()]));
    }

    #[test]
    fn template_expansion() {
        assert_eq!(
            expand_template(
                "models/checkpoints/{family}/{filename}",
                "diffusion",
                "sdxl",
                "base",
                "model.safetensors"
            ),
            "models/checkpoints/sdxl/model.safetensors"
        );
    }

    #[test]
    fn config_selection_prefers_exact_version() {
        let tmp = TempDir::new().unwrap();
        let write = |name: &str, version: &str, root: &str| {
            let config = TranslationConfig {
                schema_version: 1,
                app_id: "comfyui".into(),
                version: version.into(),
                app_root: PathBuf::from(root),
                model_rules: vec![],
                overrides: vec![],
                app_directories: vec![],
            };
            std::fs::write(
                tmp.path().join(name),
                serde_json::to_string_pretty(&config).unwrap(),
            )
            .unwrap();
        };
        write("comfyui_any_default.json", "*", "/apps/any");
        write("comfyui_0.6.0_default.json", "0.6.0", "/apps/exact");

        let config = load_translation_config(tmp.path(), "comfyui", "0.6.0").unwrap();
        assert_eq!(config.app_root, PathBuf::from("/apps/exact"));

        let fallback = load_translation_config(tmp.path(), "comfyui", "0.9.0").unwrap();
        assert_eq!(fallback.app_root, PathBuf::from("/apps/any"));

        assert!(load_translation_config(tmp.path(), "unknown-app", "1.0.0").is_err());
    }
}
