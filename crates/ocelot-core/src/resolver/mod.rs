//! Deterministic dependency-requirements resolver (resolve-only contract).
//!
//! Given a model and an execution context, produces a declarative report of
//! required pins. The library never executes installs; resolver problems are
//! carried inside a well-formed response (state + `validation_errors`), not
//! as transport errors. For a fixed library state the response is
//! byte-identical across invocations.

pub mod pins;

use crate::error::{LibraryError, Result};
use crate::index::{ModelIndex, ResolvedBindingRow};
use pins::{parse_and_canonicalize_profile_spec, ParsedPinSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Contract version consumers must fail fast on.
pub const DEPENDENCY_CONTRACT_VERSION: i64 = 1;

/// Top-level and per-binding validation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Resolved,
    UnknownProfile,
    InvalidProfile,
    ProfileConflict,
    ManualInterventionRequired,
}

/// One structured validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ValidationError {
    pub code: String,
    /// `binding` or `model`
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

/// Pin bookkeeping for one binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PinSummary {
    pub pinned: bool,
    pub required_count: u32,
    pub pinned_count: u32,
    pub missing_count: u32,
}

/// A required pin with its requirement provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequiredPin {
    pub name: String,
    /// `backend_required` | `modality_required` | `profile_policy_required`
    pub reasons: Vec<String>,
}

/// One declarative requirement entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Requirement {
    /// Always `python_package` today
    pub kind: String,
    pub name: String,
    pub exact_pin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extra_index_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_requires: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub platform_constraints: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub hashes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Per-binding section of the resolver response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BindingReport {
    pub binding_id: String,
    pub binding_kind: String,
    pub profile_id: String,
    pub profile_version: i64,
    pub profile_hash: Option<String>,
    pub backend_key: Option<String>,
    pub platform_selector: Option<String>,
    pub environment_kind: Option<String>,
    pub env_id: Option<String>,
    pub validation_state: ValidationState,
    pub validation_errors: Vec<ValidationError>,
    pub pin_summary: PinSummary,
    pub required_pins: Vec<RequiredPin>,
    pub missing_pins: Vec<String>,
    pub requirements: Vec<Requirement>,
}

/// The resolver contract response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResolverResponse {
    pub model_id: String,
    pub platform_key: String,
    pub backend_key: Option<String>,
    pub dependency_contract_version: i64,
    pub validation_state: ValidationState,
    pub validation_errors: Vec<ValidationError>,
    /// Required-only, deduped, sorted
    pub missing_pins: Vec<String>,
    pub bindings: Vec<BindingReport>,
}

const REASON_BACKEND_REQUIRED: &str = "backend_required";
const REASON_MODALITY_REQUIRED: &str = "modality_required";
const REASON_PROFILE_POLICY_REQUIRED: &str = "profile_policy_required";

const CODE_UNPINNED_DEPENDENCY: &str = "unpinned_dependency";
const CODE_MODALITY_RESOLUTION_UNKNOWN: &str = "modality_resolution_unknown";
const CODE_PROFILE_CONFLICT: &str = "profile_conflict";
const CODE_UNKNOWN_PROFILE: &str = "unknown_profile";
const CODE_INVALID_PROFILE: &str = "invalid_profile";
const CODE_REQUIRED_BINDING_OMITTED: &str = "required_binding_omitted";
const CODE_DECLARED_BINDINGS_UNRESOLVED: &str = "declared_bindings_unresolved";

/// Resolve the declarative dependency requirements for a model/context.
///
/// Inputs must be structurally valid (the model must exist); everything else
/// is reported in-band.
pub fn resolve_dependency_requirements(
    index: &ModelIndex,
    model_id: &str,
    platform_key: &str,
    backend_key: Option<&str>,
    selected_binding_ids: Option<&[String]>,
) -> Result<ResolverResponse> {
    if !index.contains_model(model_id)? {
        return Err(LibraryError::ModelNotFound {
            model_id: model_id.to_string(),
        });
    }

    let platform_key = normalize_platform_key(platform_key);
    let effective = index.effective_metadata(model_id)?.effective_metadata;

    let candidate_rows: Vec<ResolvedBindingRow> = index
        .list_active_bindings(model_id, backend_key)?
        .into_iter()
        .filter(|row| {
            platform_selector_matches(row.binding.platform_selector.as_deref(), &platform_key)
        })
        .collect();

    let mut response = ResolverResponse {
        model_id: model_id.to_string(),
        platform_key: platform_key.clone(),
        backend_key: backend_key.map(String::from),
        dependency_contract_version: DEPENDENCY_CONTRACT_VERSION,
        validation_state: ValidationState::Resolved,
        validation_errors: Vec::new(),
        missing_pins: Vec::new(),
        bindings: Vec::new(),
    };

    if candidate_rows.is_empty() {
        // Declared-but-unresolvable bindings are distinguishable from a
        // never-bound model via the baseline's declared refs.
        let declared = effective
            .get("dependency_bindings")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if declared {
            response.validation_state = ValidationState::UnknownProfile;
            response.validation_errors.push(ValidationError {
                code: CODE_DECLARED_BINDINGS_UNRESOLVED.to_string(),
                scope: "model".to_string(),
                binding_id: None,
                field: None,
                message: "Model metadata declares dependency bindings, but no active binding rows matched"
                    .to_string(),
            });
        }
        return Ok(response);
    }

    // Caller selection: non-selected bindings drop out of the report, but
    // omitting a required binding is an error.
    let selection: Option<HashSet<&str>> = selected_binding_ids
        .map(|ids| ids.iter().map(String::as_str).collect());
    let mut omitted_required: Vec<String> = Vec::new();
    let rows: Vec<&ResolvedBindingRow> = candidate_rows
        .iter()
        .filter(|row| match &selection {
            Some(set) => {
                let selected = set.contains(row.binding.binding_id.as_str());
                if !selected && is_required_binding_kind(&row.binding.binding_kind) {
                    omitted_required.push(row.binding.binding_id.clone());
                }
                selected || is_required_binding_kind(&row.binding.binding_kind)
            }
            None => true,
        })
        .collect();

    for row in &rows {
        response.bindings.push(evaluate_binding(
            row,
            &platform_key,
            backend_key,
            &effective,
        ));
    }

    for binding_id in &omitted_required {
        if let Some(report) = response
            .bindings
            .iter_mut()
            .find(|b| b.binding_id == *binding_id)
        {
            report.validation_state = ValidationState::ManualInterventionRequired;
            report.validation_errors.push(ValidationError {
                code: CODE_REQUIRED_BINDING_OMITTED.to_string(),
                scope: "binding".to_string(),
                binding_id: Some(binding_id.clone()),
                field: None,
                message: "Caller selection omitted a required binding".to_string(),
            });
        }
    }

    mark_profile_conflicts(&mut response.bindings);
    aggregate(&mut response);
    Ok(response)
}

fn evaluate_binding(
    row: &ResolvedBindingRow,
    platform_key: &str,
    context_backend: Option<&str>,
    effective_metadata: &Value,
) -> BindingReport {
    let binding = &row.binding;
    let resolved_backend = binding
        .backend_key
        .clone()
        .or_else(|| context_backend.map(String::from));

    let env_id = row.environment_kind.as_ref().map(|kind| {
        build_env_id(
            kind,
            &binding.profile_id,
            binding.profile_version,
            row.profile_hash.as_deref(),
            platform_key,
            resolved_backend.as_deref(),
        )
    });

    let mut report = BindingReport {
        binding_id: binding.binding_id.clone(),
        binding_kind: binding.binding_kind.clone(),
        profile_id: binding.profile_id.clone(),
        profile_version: binding.profile_version,
        profile_hash: row.profile_hash.clone(),
        backend_key: binding.backend_key.clone(),
        platform_selector: binding.platform_selector.clone(),
        environment_kind: row.environment_kind.clone(),
        env_id,
        validation_state: ValidationState::Resolved,
        validation_errors: Vec::new(),
        pin_summary: PinSummary::default(),
        required_pins: Vec::new(),
        missing_pins: Vec::new(),
        requirements: Vec::new(),
    };

    let Some(spec_json) = row.spec_json.as_deref() else {
        report.validation_state = ValidationState::UnknownProfile;
        report.validation_errors.push(ValidationError {
            code: CODE_UNKNOWN_PROFILE.to_string(),
            scope: "binding".to_string(),
            binding_id: Some(binding.binding_id.clone()),
            field: None,
            message: format!(
                "Dependency profile {}:{} is missing from the index",
                binding.profile_id, binding.profile_version
            ),
        });
        return report;
    };

    let environment_kind = row.environment_kind.as_deref().unwrap_or("unknown");
    let field_context = format!(
        "dependency_profiles.{}:{}",
        binding.profile_id, binding.profile_version
    );
    let parsed = match parse_and_canonicalize_profile_spec(spec_json, environment_kind, &field_context)
    {
        Ok(parsed) => parsed,
        Err(err) => {
            report.validation_state = ValidationState::InvalidProfile;
            report.validation_errors.push(ValidationError {
                code: CODE_INVALID_PROFILE.to_string(),
                scope: "binding".to_string(),
                binding_id: Some(binding.binding_id.clone()),
                field: Some(field_context),
                message: err.to_string(),
            });
            return report;
        }
    };

    if parsed.contract_version != DEPENDENCY_CONTRACT_VERSION {
        report.validation_state = ValidationState::InvalidProfile;
        report.validation_errors.push(ValidationError {
            code: CODE_INVALID_PROFILE.to_string(),
            scope: "binding".to_string(),
            binding_id: Some(binding.binding_id.clone()),
            field: Some("dependency_contract_version".to_string()),
            message: format!(
                "Expected dependency_contract_version {}, found {}",
                DEPENDENCY_CONTRACT_VERSION, parsed.contract_version
            ),
        });
        return report;
    }

    report.requirements = requirements_from(&parsed);
    evaluate_pins(&mut report, binding, &parsed, resolved_backend.as_deref(), effective_metadata);
    report
}

/// Compute required pins and their satisfaction for one binding.
fn evaluate_pins(
    report: &mut BindingReport,
    binding: &crate::index::DependencyBindingRecord,
    parsed: &ParsedPinSpec,
    backend: Option<&str>,
    effective_metadata: &Value,
) {
    let mut required: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for package in &parsed.required_policy_packages {
        required
            .entry(package.clone())
            .or_default()
            .insert(REASON_PROFILE_POLICY_REQUIRED.to_string());
    }

    let normalized_backend = backend
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase);
    let mut modality_unknown = None;
    if normalized_backend.as_deref() == Some("pytorch") {
        required
            .entry("torch".to_string())
            .or_default()
            .insert(REASON_BACKEND_REQUIRED.to_string());

        match resolve_effective_modalities(&binding.binding_id, parsed, effective_metadata) {
            Some(modalities) => {
                if modalities.contains("image") {
                    required
                        .entry("torchvision".to_string())
                        .or_default()
                        .insert(REASON_MODALITY_REQUIRED.to_string());
                }
                if modalities.contains("audio") {
                    required
                        .entry("torchaudio".to_string())
                        .or_default()
                        .insert(REASON_MODALITY_REQUIRED.to_string());
                }
            }
            None => {
                modality_unknown = Some(
                    "unable to resolve modalities via binding override, model metadata, or task fallback"
                        .to_string(),
                );
            }
        }
    }

    let exactly_pinned: HashSet<&str> = parsed
        .python_packages
        .iter()
        .filter(|pin| pins::is_exact_pin_version(&pin.version))
        .map(|pin| pin.name.as_str())
        .collect();

    report.required_pins = required
        .iter()
        .map(|(name, reasons)| RequiredPin {
            name: name.clone(),
            reasons: reasons.iter().cloned().collect(),
        })
        .collect();

    // A required pin is missing when it is absent or present without an
    // exact version.
    let missing: BTreeSet<String> = required
        .keys()
        .filter(|name| !exactly_pinned.contains(name.as_str()))
        .cloned()
        .collect();
    report.missing_pins = missing.into_iter().collect();

    let required_count = report.required_pins.len() as u32;
    let missing_count = report.missing_pins.len() as u32;
    report.pin_summary = PinSummary {
        pinned: report.missing_pins.is_empty() && modality_unknown.is_none(),
        required_count,
        pinned_count: required_count.saturating_sub(missing_count),
        missing_count,
    };

    if let Some(message) = modality_unknown {
        report.validation_state = ValidationState::ManualInterventionRequired;
        report.validation_errors.push(ValidationError {
            code: CODE_MODALITY_RESOLUTION_UNKNOWN.to_string(),
            scope: "binding".to_string(),
            binding_id: Some(binding.binding_id.clone()),
            field: None,
            message,
        });
    } else if !report.missing_pins.is_empty() {
        report.validation_state = ValidationState::ManualInterventionRequired;
        report.validation_errors.push(ValidationError {
            code: CODE_UNPINNED_DEPENDENCY.to_string(),
            scope: "binding".to_string(),
            binding_id: Some(binding.binding_id.clone()),
            field: None,
            message: format!(
                "Required dependency pins are missing or not exact: {}",
                report.missing_pins.join(",")
            ),
        });
    }
}

fn requirements_from(parsed: &ParsedPinSpec) -> Vec<Requirement> {
    let mut requirements: Vec<Requirement> = parsed
        .python_packages
        .iter()
        .map(|pin| Requirement {
            kind: "python_package".to_string(),
            name: pin.name.clone(),
            exact_pin: pin.version.clone(),
            index_url: pin.index_url.clone(),
            extra_index_urls: pin.extra_index_urls.clone(),
            markers: pin.markers.clone(),
            python_requires: pin.python_requires.clone(),
            platform_constraints: pin.platform_constraints.clone(),
            hashes: pin.hashes.clone(),
            source: pin.source.clone(),
        })
        .collect();
    requirements.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.exact_pin.cmp(&b.exact_pin))
    });
    requirements
}

/// Modality precedence: binding-level override, then metadata modalities,
/// then the task-signature fallback.
fn resolve_effective_modalities(
    binding_id: &str,
    parsed: &ParsedPinSpec,
    effective_metadata: &Value,
) -> Option<BTreeSet<String>> {
    if let Some(overrides) = parsed.binding_modality_overrides.get(binding_id) {
        return classify_modalities(&overrides.input_modalities, &overrides.output_modalities);
    }

    let inputs = string_vec(effective_metadata.get("input_modalities"));
    let outputs = string_vec(effective_metadata.get("output_modalities"));
    if !inputs.is_empty() || !outputs.is_empty() {
        return classify_modalities(&inputs, &outputs);
    }

    let task = effective_metadata
        .get("task_type_primary")
        .and_then(|t| t.get("value"))
        .and_then(Value::as_str)
        .or_else(|| {
            effective_metadata
                .get("task_type_primary")
                .and_then(Value::as_str)
        })?;
    let signature = crate::classify::task_signature::normalize_task_signature(task);
    classify_modalities(&signature.input_modalities, &signature.output_modalities)
}

fn classify_modalities(inputs: &[String], outputs: &[String]) -> Option<BTreeSet<String>> {
    let combined: BTreeSet<String> = inputs
        .iter()
        .chain(outputs.iter())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if combined.is_empty() || combined.contains("unknown") || combined.contains("any") {
        return None;
    }
    Some(combined)
}

fn string_vec(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Mark every binding participating in an environment-target collision with
/// differing profile hashes.
fn mark_profile_conflicts(bindings: &mut [BindingReport]) {
    let mut by_target: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for report in bindings.iter() {
        let target = conflict_target_key(report);
        by_target
            .entry(target)
            .or_default()
            .insert(report.profile_hash.clone().unwrap_or_else(|| "unknown".into()));
    }

    for report in bindings.iter_mut() {
        let target = conflict_target_key(report);
        if by_target.get(&target).map(|hashes| hashes.len() > 1) == Some(true) {
            report.validation_state = ValidationState::ProfileConflict;
            report.validation_errors.push(ValidationError {
                code: CODE_PROFILE_CONFLICT.to_string(),
                scope: "binding".to_string(),
                binding_id: Some(report.binding_id.clone()),
                field: None,
                message: "Different profile hashes resolved to the same environment id".to_string(),
            });
        }
    }
}

fn conflict_target_key(report: &BindingReport) -> String {
    format!(
        "{}:{}",
        report.environment_kind.as_deref().unwrap_or("unknown"),
        report.backend_key.as_deref().unwrap_or("any"),
    )
}

/// Fold binding states into the top-level state and roll up missing pins.
fn aggregate(response: &mut ResolverResponse) {
    let states: Vec<ValidationState> = response
        .bindings
        .iter()
        .map(|b| b.validation_state)
        .collect();

    // Pin problems on optional bindings stay binding-local; only required
    // bindings escalate to the top-level state.
    let top = if states.contains(&ValidationState::ProfileConflict) {
        ValidationState::ProfileConflict
    } else if states.contains(&ValidationState::InvalidProfile) {
        ValidationState::InvalidProfile
    } else if states.contains(&ValidationState::UnknownProfile) {
        ValidationState::UnknownProfile
    } else if response.bindings.iter().any(|b| {
        is_required_binding_kind_report(b)
            && b.validation_errors.iter().any(|e| {
                e.code == CODE_UNPINNED_DEPENDENCY
                    || e.code == CODE_MODALITY_RESOLUTION_UNKNOWN
                    || e.code == CODE_REQUIRED_BINDING_OMITTED
            })
    }) {
        ValidationState::ManualInterventionRequired
    } else {
        ValidationState::Resolved
    };
    response.validation_state = top;

    // Top-level missing pins are required-only, deduped, sorted.
    let mut missing = BTreeSet::new();
    for binding in response
        .bindings
        .iter()
        .filter(|b| is_required_binding_kind_report(b))
    {
        for pin in &binding.missing_pins {
            missing.insert(pin.clone());
        }
    }
    response.missing_pins = missing.into_iter().collect();

    // Surface binding errors at the top for convenience, model-scope first.
    let mut rolled: Vec<ValidationError> = response.validation_errors.clone();
    for binding in &response.bindings {
        rolled.extend(binding.validation_errors.iter().cloned());
    }
    response.validation_errors = rolled;
}

fn is_required_binding_kind_report(report: &BindingReport) -> bool {
    is_required_binding_kind(&report.binding_kind)
}

fn normalize_platform_key(platform_key: &str) -> String {
    let normalized = platform_key.trim().to_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn platform_selector_matches(selector: Option<&str>, platform_key: &str) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let selector = selector.trim().to_lowercase();
    if selector.is_empty() || selector == "*" {
        return true;
    }
    selector
        .split([',', '|'])
        .map(str::trim)
        .any(|token| token == "*" || token == platform_key)
}

fn build_env_id(
    environment_kind: &str,
    profile_id: &str,
    profile_version: i64,
    profile_hash: Option<&str>,
    platform_key: &str,
    backend_key: Option<&str>,
) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        environment_kind,
        profile_id,
        profile_version,
        profile_hash.unwrap_or("unknown"),
        platform_key,
        backend_key.unwrap_or("any"),
    )
}

fn is_required_binding_kind(binding_kind: &str) -> bool {
    matches!(
        binding_kind.to_lowercase().as_str(),
        "required_core" | "required_custom"
    )
}
