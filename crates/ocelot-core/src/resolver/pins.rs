//! Dependency pin schema parsing, canonicalization, and hashing.
//!
//! Profile specs are JSON documents whose `python_packages` carry PEP-440
//! pins. Structural problems (bad JSON, missing fields, unknown modality
//! tokens) are rejected at the boundary; non-exact versions are accepted into
//! storage and recorded as unpinned so the resolver can report them.

use crate::classify::task_signature::CANONICAL_MODALITY_TOKENS;
use crate::error::{LibraryError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Exact `==` pin; local build tags (`+cu121`) allowed.
static EXACT_PIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^==[A-Za-z0-9]+[A-Za-z0-9._+\-]*$").expect("dependency pin regex must compile")
});

/// One Python package pin as stored in a profile spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PythonPackagePin {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_index_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_requires: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform_constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Modality override attached to one binding id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct BindingModalityOverride {
    #[serde(default)]
    pub input_modalities: Vec<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
}

/// Parsed and canonicalized profile spec.
#[derive(Debug, Clone)]
pub struct ParsedPinSpec {
    pub python_packages: Vec<PythonPackagePin>,
    /// Packages listed under `pin_policy.required_packages`
    pub required_policy_packages: Vec<String>,
    /// Package names whose versions are not exact `==` pins
    pub unpinned_packages: Vec<String>,
    pub binding_modality_overrides: HashMap<String, BindingModalityOverride>,
    /// `dependency_contract_version` declared by the spec, defaulting to 1
    pub contract_version: i64,
    /// Sorted-key canonical JSON
    pub canonical_json: String,
    /// SHA-256 of the canonical JSON
    pub profile_hash: String,
}

/// Parse and canonicalize a profile spec.
///
/// `field_context` names the document for error messages (e.g.
/// `dependency_profiles.torch-core:1`).
pub fn parse_and_canonicalize_profile_spec(
    spec_json: &str,
    environment_kind: &str,
    field_context: &str,
) -> Result<ParsedPinSpec> {
    let mut value: Value = serde_json::from_str(spec_json).map_err(|err| LibraryError::Validation {
        field: field_context.to_string(),
        message: format!("invalid_dependency_pin: invalid JSON: {}", err),
    })?;
    let root = value.as_object_mut().ok_or_else(|| LibraryError::Validation {
        field: field_context.to_string(),
        message: "invalid_dependency_pin: profile spec must be a JSON object".to_string(),
    })?;

    let contract_version = root
        .get("dependency_contract_version")
        .and_then(Value::as_i64)
        .unwrap_or(1);

    let (mut python_packages, unpinned_packages) =
        parse_python_packages(root.get("python_packages"), field_context)?;
    python_packages.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    let package_names: HashSet<String> =
        python_packages.iter().map(|pin| pin.name.clone()).collect();

    if environment_kind.trim().to_lowercase().starts_with("python") && python_packages.is_empty() {
        return Err(LibraryError::Validation {
            field: format!("{}.python_packages", field_context),
            message: "invalid_dependency_pin: python environments require at least one package pin"
                .to_string(),
        });
    }

    let required_policy_packages =
        parse_required_policy_packages(root.get("pin_policy"), field_context)?;
    for package in &required_policy_packages {
        if !package_names.contains(package) {
            return Err(LibraryError::Validation {
                field: format!("{}.pin_policy.required_packages", field_context),
                message: format!(
                    "invalid_dependency_pin: required package '{}' is missing from python_packages",
                    package
                ),
            });
        }
    }

    let binding_modality_overrides =
        parse_binding_modality_overrides(root.get("binding_modality_overrides"), field_context)?;

    root.insert(
        "python_packages".to_string(),
        serde_json::to_value(&python_packages)?,
    );

    let canonical_value = canonicalize_value(&value);
    let canonical_json = serde_json::to_string(&canonical_value)?;
    let profile_hash = compute_profile_hash(&canonical_json);

    Ok(ParsedPinSpec {
        python_packages,
        required_policy_packages,
        unpinned_packages,
        binding_modality_overrides,
        contract_version,
        canonical_json,
        profile_hash,
    })
}

fn parse_python_packages(
    value: Option<&Value>,
    field_context: &str,
) -> Result<(Vec<PythonPackagePin>, Vec<String>)> {
    let Some(value) = value else {
        return Ok((Vec::new(), Vec::new()));
    };
    let array = value.as_array().ok_or_else(|| LibraryError::Validation {
        field: format!("{}.python_packages", field_context),
        message: "invalid_dependency_pin: must be an array".to_string(),
    })?;

    let mut pins = Vec::new();
    let mut unpinned = Vec::new();
    let mut seen_versions = HashMap::<String, String>::new();
    for (idx, item) in array.iter().enumerate() {
        let obj = item.as_object().ok_or_else(|| LibraryError::Validation {
            field: format!("{}.python_packages[{}]", field_context, idx),
            message: "invalid_dependency_pin: package entry must be an object".to_string(),
        })?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(normalize_package_name)
            .ok_or_else(|| LibraryError::Validation {
                field: format!("{}.python_packages[{}].name", field_context, idx),
                message: "invalid_dependency_pin: package name is required".to_string(),
            })?;

        let version = obj
            .get("version")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LibraryError::Validation {
                field: format!("{}.python_packages[{}].version", field_context, idx),
                message: "invalid_dependency_pin: version is required".to_string(),
            })?
            .to_string();

        if !is_exact_pin_version(&version) {
            unpinned.push(name.clone());
        }

        if let Some(prior) = seen_versions.get(&name) {
            if prior != &version {
                return Err(LibraryError::Validation {
                    field: format!("{}.python_packages[{}].name", field_context, idx),
                    message: format!(
                        "invalid_dependency_pin: package '{}' appears with conflicting versions ('{}' and '{}')",
                        name, prior, version
                    ),
                });
            }
            continue;
        }
        seen_versions.insert(name.clone(), version.clone());

        pins.push(PythonPackagePin {
            name,
            version,
            index_url: optional_string(obj.get("index_url")),
            extra_index_urls: string_array(obj.get("extra_index_urls")),
            markers: optional_string(obj.get("markers")),
            python_requires: optional_string(obj.get("python_requires")),
            platform_constraints: string_array(obj.get("platform_constraints")),
            hashes: string_array(obj.get("hashes")),
            source: optional_string(obj.get("source")),
        });
    }

    unpinned.sort();
    unpinned.dedup();
    Ok((pins, unpinned))
}

fn parse_required_policy_packages(value: Option<&Value>, field_context: &str) -> Result<Vec<String>> {
    let Some(policy) = value else {
        return Ok(Vec::new());
    };
    let policy_obj = policy.as_object().ok_or_else(|| LibraryError::Validation {
        field: format!("{}.pin_policy", field_context),
        message: "invalid_dependency_pin: pin_policy must be an object".to_string(),
    })?;
    let Some(required_raw) = policy_obj.get("required_packages") else {
        return Ok(Vec::new());
    };
    let array = required_raw.as_array().ok_or_else(|| LibraryError::Validation {
        field: format!("{}.pin_policy.required_packages", field_context),
        message: "invalid_dependency_pin: required_packages must be an array".to_string(),
    })?;

    let mut required = Vec::new();
    for (idx, item) in array.iter().enumerate() {
        let name = match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => obj.get("name").and_then(Value::as_str),
            _ => None,
        }
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(normalize_package_name)
        .ok_or_else(|| LibraryError::Validation {
            field: format!("{}.pin_policy.required_packages[{}]", field_context, idx),
            message: "invalid_dependency_pin: required package name is required".to_string(),
        })?;
        required.push(name);
    }

    required.sort();
    required.dedup();
    Ok(required)
}

fn parse_binding_modality_overrides(
    value: Option<&Value>,
    field_context: &str,
) -> Result<HashMap<String, BindingModalityOverride>> {
    let Some(raw) = value else {
        return Ok(HashMap::new());
    };
    let obj = raw.as_object().ok_or_else(|| LibraryError::Validation {
        field: format!("{}.binding_modality_overrides", field_context),
        message: "invalid_dependency_pin: binding_modality_overrides must be an object".to_string(),
    })?;

    let mut overrides = HashMap::new();
    for (binding_id, entry) in obj {
        let binding_id = binding_id.trim();
        if binding_id.is_empty() {
            return Err(LibraryError::Validation {
                field: format!("{}.binding_modality_overrides", field_context),
                message: "invalid_dependency_pin: binding id keys must be non-empty".to_string(),
            });
        }
        let entry_obj = entry.as_object().ok_or_else(|| LibraryError::Validation {
            field: format!("{}.binding_modality_overrides.{}", field_context, binding_id),
            message: "invalid_dependency_pin: override entry must be an object".to_string(),
        })?;

        overrides.insert(
            binding_id.to_string(),
            BindingModalityOverride {
                input_modalities: modality_array(
                    entry_obj.get("input_modalities"),
                    &format!(
                        "{}.binding_modality_overrides.{}.input_modalities",
                        field_context, binding_id
                    ),
                )?,
                output_modalities: modality_array(
                    entry_obj.get("output_modalities"),
                    &format!(
                        "{}.binding_modality_overrides.{}.output_modalities",
                        field_context, binding_id
                    ),
                )?,
            },
        );
    }
    Ok(overrides)
}

fn modality_array(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    let array = raw.as_array().ok_or_else(|| LibraryError::Validation {
        field: field.to_string(),
        message: "invalid_dependency_pin: modalities must be an array of strings".to_string(),
    })?;

    let mut modalities = Vec::new();
    for (idx, modality) in array.iter().enumerate() {
        let normalized = modality
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_lowercase)
            .ok_or_else(|| LibraryError::Validation {
                field: format!("{}[{}]", field, idx),
                message: "invalid_dependency_pin: modality token must be a non-empty string"
                    .to_string(),
            })?;
        if !CANONICAL_MODALITY_TOKENS.contains(&normalized.as_str()) {
            return Err(LibraryError::Validation {
                field: format!("{}[{}]", field, idx),
                message: format!("invalid_dependency_pin: modality '{}' is not canonical", normalized),
            });
        }
        modalities.push(normalized);
    }
    Ok(modalities)
}

fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut normalized = Map::new();
            for key in keys {
                if let Some(v) = map.get(&key) {
                    normalized.insert(key, canonicalize_value(v));
                }
            }
            Value::Object(normalized)
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize_value).collect()),
        _ => value.clone(),
    }
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub fn normalize_package_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

pub fn is_exact_pin_version(version: &str) -> bool {
    EXACT_PIN_RE.is_match(version.trim())
}

pub fn compute_profile_hash(canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_hashes_stably() {
        let raw = serde_json::json!({
            "pin_policy": {"required_packages": [{"name": "XFORMERS"}]},
            "python_packages": [
                {"name": "XFORMERS", "version": "==0.0.30"},
                {"name": "Torch", "version": "==2.5.1+cu121"}
            ]
        })
        .to_string();
        let parsed = parse_and_canonicalize_profile_spec(&raw, "python-venv", "ctx").unwrap();
        assert_eq!(parsed.python_packages[0].name, "torch");
        assert_eq!(parsed.python_packages[1].name, "xformers");
        assert_eq!(parsed.required_policy_packages, vec!["xformers"]);
        assert!(parsed.unpinned_packages.is_empty());
        assert_eq!(parsed.profile_hash.len(), 64);

        // Key order does not affect the hash.
        let reordered = serde_json::json!({
            "python_packages": [
                {"version": "==2.5.1+cu121", "name": "Torch"},
                {"version": "==0.0.30", "name": "XFORMERS"}
            ],
            "pin_policy": {"required_packages": [{"name": "XFORMERS"}]}
        })
        .to_string();
        let parsed2 = parse_and_canonicalize_profile_spec(&reordered, "python-venv", "ctx").unwrap();
        assert_eq!(parsed.profile_hash, parsed2.profile_hash);
    }

    #[test]
    fn non_exact_pins_are_recorded_not_rejected() {
        let raw = serde_json::json!({
            "python_packages": [
                {"name": "torch", "version": ">=2.5"},
                {"name": "numpy", "version": "==2.1.0"}
            ]
        })
        .to_string();
        let parsed = parse_and_canonicalize_profile_spec(&raw, "python-venv", "ctx").unwrap();
        assert_eq!(parsed.unpinned_packages, vec!["torch"]);
        assert_eq!(parsed.python_packages.len(), 2);
    }

    #[test]
    fn rejects_structural_problems() {
        assert!(parse_and_canonicalize_profile_spec("not json", "python-venv", "ctx").is_err());
        let missing_version = serde_json::json!({
            "python_packages": [{"name": "torch"}]
        })
        .to_string();
        assert!(
            parse_and_canonicalize_profile_spec(&missing_version, "python-venv", "ctx").is_err()
        );
        let conflicting = serde_json::json!({
            "python_packages": [
                {"name": "torch", "version": "==2.5.0"},
                {"name": "torch", "version": "==2.6.0"}
            ]
        })
        .to_string();
        assert!(parse_and_canonicalize_profile_spec(&conflicting, "python-venv", "ctx").is_err());
    }

    #[test]
    fn rejects_unknown_modality_override_token() {
        let raw = serde_json::json!({
            "python_packages": [{"name": "torch", "version": "==2.5.1"}],
            "binding_modality_overrides": {
                "b1": {"input_modalities": ["galactic"], "output_modalities": ["text"]}
            }
        })
        .to_string();
        assert!(parse_and_canonicalize_profile_spec(&raw, "python-venv", "ctx").is_err());
    }

    #[test]
    fn python_environment_requires_packages() {
        assert!(parse_and_canonicalize_profile_spec("{}", "python-venv", "ctx").is_err());
        assert!(parse_and_canonicalize_profile_spec("{}", "system", "ctx").is_ok());
    }

    #[test]
    fn exact_pin_syntax() {
        assert!(is_exact_pin_version("==2.5.1"));
        assert!(is_exact_pin_version("==2.5.1+cu121"));
        assert!(!is_exact_pin_version(">=2.5"));
        assert!(!is_exact_pin_version("==2.*"));
        assert!(!is_exact_pin_version("2.5.1"));
    }

    #[test]
    fn contract_version_passthrough() {
        let raw = serde_json::json!({
            "dependency_contract_version": 2,
            "python_packages": [{"name": "torch", "version": "==2.5.1"}]
        })
        .to_string();
        let parsed = parse_and_canonicalize_profile_spec(&raw, "python-venv", "ctx").unwrap();
        assert_eq!(parsed.contract_version, 2);
    }
}
