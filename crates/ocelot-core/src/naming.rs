//! Filesystem-safe normalization of canonical path components.
//!
//! Model identity is `{model_type}/{family}/{name}`; every segment passes
//! through [`normalize_component`] before it touches the filesystem.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum length for a normalized component.
const MAX_COMPONENT_LENGTH: usize = 128;

/// Reserved device names on Windows NTFS.
const NTFS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Anything outside the canonical alphabet gets stripped to a separator.
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9._-]+").unwrap());

/// Runs of separators collapse to a single hyphen.
static SEPARATOR_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-_.]{2,}").unwrap());

/// Normalize one canonical-path component.
///
/// Rules: lowercase ASCII, characters outside `[a-z0-9._-]` become `-`,
/// separator runs collapse to a single `-`, leading/trailing separators are
/// trimmed, length is capped at 128.
///
/// # Examples
///
/// ```
/// use ocelot_library::naming::normalize_component;
///
/// assert_eq!(normalize_component("Llama 2 7B"), "llama-2-7b");
/// assert_eq!(normalize_component("SDXL__1.0--Base"), "sdxl-1.0-base");
/// assert_eq!(normalize_component("model/test:file"), "model-test-file");
/// ```
pub fn normalize_component(name: &str) -> String {
    let mut result = name.to_lowercase();

    result = DISALLOWED.replace_all(&result, "-").to_string();
    result = SEPARATOR_RUNS.replace_all(&result, "-").to_string();
    result = result.trim_matches(['-', '_', '.']).to_string();

    if result.len() > MAX_COMPONENT_LENGTH {
        result.truncate(MAX_COMPONENT_LENGTH);
        // Prefer breaking at a separator so we do not leave a dangling token.
        if let Some(pos) = result.rfind(['-', '_', '.']) {
            if pos > MAX_COMPONENT_LENGTH / 2 {
                result.truncate(pos);
            }
        }
        result = result.trim_matches(['-', '_', '.']).to_string();
    }

    let upper = result.to_uppercase();
    if NTFS_RESERVED_NAMES.contains(&upper.as_str()) {
        result = format!("{}-model", result);
    }

    if result.is_empty() {
        result = "unnamed-model".to_string();
    }

    result
}

/// Normalize a filename while preserving its extension.
pub fn normalize_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}.{}", normalize_component(stem), ext.to_lowercase())
        }
        _ => normalize_component(filename),
    }
}

/// Resolve a rename collision by appending the first 8 hex chars of the
/// content SHA-256.
pub fn collision_suffixed(name: &str, sha256: &str) -> String {
    let prefix: String = sha256.chars().take(8).collect();
    format!("{}-{}", name, prefix)
}

/// Validate a full canonical model id (`type/family/name`).
///
/// Returns the id unchanged when every segment is already in normalized form.
pub fn validate_model_id(model_id: &str) -> crate::error::Result<&str> {
    let segments: Vec<&str> = model_id.split('/').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(crate::error::LibraryError::Validation {
            field: "model_id".to_string(),
            message: format!("'{}' is not of the form model_type/family/name", model_id),
        });
    }
    if model_id.len() > 3 * MAX_COMPONENT_LENGTH + 2 {
        return Err(crate::error::LibraryError::Validation {
            field: "model_id".to_string(),
            message: "model id exceeds maximum length".to_string(),
        });
    }
    for segment in segments.iter().copied() {
        if normalize_component(segment) != segment {
            return Err(crate::error::LibraryError::Validation {
                field: "model_id".to_string(),
                message: format!("segment '{}' is not in canonical form", segment),
            });
        }
    }
    Ok(model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_normalization() {
        assert_eq!(normalize_component("Llama 2 7B"), "llama-2-7b");
        assert_eq!(normalize_component("stable_diffusion_v1.5"), "stable_diffusion_v1.5");
        assert_eq!(normalize_component("model<>test"), "model-test");
    }

    #[test]
    fn separator_runs_collapse() {
        assert_eq!(normalize_component("test---model"), "test-model");
        assert_eq!(normalize_component("test-_-model"), "test-model");
        assert_eq!(normalize_component("--test--"), "test");
    }

    #[test]
    fn reserved_names_get_suffix() {
        assert_eq!(normalize_component("CON"), "con-model");
        assert_eq!(normalize_component("nul"), "nul-model");
    }

    #[test]
    fn empty_falls_back() {
        assert_eq!(normalize_component(""), "unnamed-model");
        assert_eq!(normalize_component("///"), "unnamed-model");
    }

    #[test]
    fn long_names_truncate() {
        let long = "a".repeat(300);
        assert!(normalize_component(&long).len() <= MAX_COMPONENT_LENGTH);
    }

    #[test]
    fn filenames_keep_extension() {
        assert_eq!(normalize_filename("My Model.SafeTensors"), "my-model.safetensors");
        assert_eq!(normalize_filename("TEST.GGUF"), "test.gguf");
    }

    #[test]
    fn collision_suffix_uses_hash_prefix() {
        assert_eq!(
            collision_suffixed("llama", "a1b2c3d4e5f6a7b8deadbeef"),
            "llama-a1b2c3d4"
        );
    }

    #[test]
    fn model_id_validation() {
        assert!(validate_model_id("llm/llama/llama-2-7b").is_ok());
        assert!(validate_model_id("llm/llama").is_err());
        assert!(validate_model_id("llm//x").is_err());
        assert!(validate_model_id("LLM/llama/x").is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["Llama 2 7B", "test---model", "CON", "weird::name"] {
            let once = normalize_component(raw);
            assert_eq!(normalize_component(&once), once);
        }
    }
}
