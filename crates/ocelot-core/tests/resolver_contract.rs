//! Contract fixtures for the dependency-requirements resolver.
//!
//! These lock the response shape and the deterministic ordering rules so
//! consumers can rely on byte-stable output for a fixed library state.

use ocelot_library::index::{DependencyBindingRecord, ModelIndex};
use ocelot_library::resolver::{resolve_dependency_requirements, ValidationState};
use ocelot_library::types::{
    BaselineMetadata, ModelFileEntry, ModelLayout, ModelType, METADATA_SCHEMA_VERSION,
};
use tempfile::TempDir;

const PLATFORM: &str = "linux-x86_64";

fn baseline(model_id: &str, input_modalities: &[&str], output_modalities: &[&str]) -> BaselineMetadata {
    let mut parts = model_id.split('/');
    let model_type = parts.next().unwrap().parse::<ModelType>().unwrap();
    let family = parts.next().unwrap().to_string();
    let name = parts.next().unwrap().to_string();
    BaselineMetadata {
        schema_version: METADATA_SCHEMA_VERSION,
        model_id: model_id.to_string(),
        model_type,
        family,
        name: name.clone(),
        official_name: None,
        layout: ModelLayout::SingleFile,
        files: vec![ModelFileEntry {
            rel_path: format!("{}.safetensors", name),
            size_bytes: 16,
            sha256: format!("sha-{}", name),
            blake3: format!("b3-{}", name),
        }],
        total_size_bytes: 16,
        task_type_primary: None,
        input_modalities: input_modalities.iter().map(|s| s.to_string()).collect(),
        output_modalities: output_modalities.iter().map(|s| s.to_string()).collect(),
        architecture_tokens: vec![],
        tags: vec![],
        metadata_needs_review: false,
        review_reasons: vec![],
        source_repo_id: None,
        dependency_bindings: vec![],
        created_at: "2025-01-01T00:00:00Z".to_string(),
    }
}

fn binding(
    binding_id: &str,
    model_id: &str,
    profile_id: &str,
    binding_kind: &str,
) -> DependencyBindingRecord {
    DependencyBindingRecord {
        binding_id: binding_id.to_string(),
        model_id: model_id.to_string(),
        profile_id: profile_id.to_string(),
        profile_version: 1,
        binding_kind: binding_kind.to_string(),
        backend_key: Some("pytorch".to_string()),
        platform_selector: Some(PLATFORM.to_string()),
        priority: 100,
        status: "active".to_string(),
    }
}

fn pinned_spec(pins: &[(&str, &str)]) -> String {
    let packages: Vec<_> = pins
        .iter()
        .map(|(name, version)| serde_json::json!({"name": name, "version": version}))
        .collect();
    serde_json::json!({ "python_packages": packages }).to_string()
}

fn open_index(tmp: &TempDir) -> ModelIndex {
    ModelIndex::open(tmp.path().join("models.db")).unwrap()
}

#[test]
fn no_declared_bindings_resolves_clean() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    index
        .upsert_model(&baseline("llm/llama/plain", &["text"], &["text"]))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, "llm/llama/plain", PLATFORM, None, None).unwrap();
    assert_eq!(response.validation_state, ValidationState::Resolved);
    assert_eq!(response.dependency_contract_version, 1);
    assert!(response.bindings.is_empty());
    assert!(response.missing_pins.is_empty());
    assert!(response.validation_errors.is_empty());
}

#[test]
fn declared_but_unresolvable_bindings_are_unknown_profile() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let mut model = baseline("llm/llama/declared", &["text"], &["text"]);
    model.dependency_bindings = vec![ocelot_library::types::DeclaredBindingRef {
        profile_id: "ghost".to_string(),
        profile_version: 1,
        binding_kind: "required_core".to_string(),
        backend_key: None,
        platform_selector: None,
        priority: 100,
    }];
    index.upsert_model(&model).unwrap();

    let response =
        resolve_dependency_requirements(&index, "llm/llama/declared", PLATFORM, None, None)
            .unwrap();
    assert_eq!(response.validation_state, ValidationState::UnknownProfile);
    assert_eq!(
        response.validation_errors[0].code,
        "declared_bindings_unresolved"
    );
}

#[test]
fn unpinned_required_dependency_demands_manual_intervention() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/unpinned";
    index
        .upsert_model(&baseline(model_id, &["text"], &["text"]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "torch-loose",
            1,
            "python-venv",
            &pinned_spec(&[("torch", ">=2.5")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-loose", "required_core"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();

    assert_eq!(
        response.validation_state,
        ValidationState::ManualInterventionRequired
    );
    assert_eq!(response.missing_pins, vec!["torch"]);

    let report = &response.bindings[0];
    assert_eq!(
        report.validation_state,
        ValidationState::ManualInterventionRequired
    );
    assert_eq!(report.validation_errors[0].code, "unpinned_dependency");
    assert_eq!(report.missing_pins, vec!["torch"]);
    assert!(!report.pin_summary.pinned);
    assert_eq!(report.pin_summary.missing_count, 1);
}

#[test]
fn profile_conflict_on_same_environment_target() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/conflict";
    index
        .upsert_model(&baseline(model_id, &["text"], &["text"]))
        .unwrap();
    index
        .upsert_dependency_profile("p1", 1, "python-venv", &pinned_spec(&[("torch", "==2.4.0")]))
        .unwrap();
    index
        .upsert_dependency_profile("p2", 1, "python-venv", &pinned_spec(&[("torch", "==2.5.0")]))
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "p1", "required_core"))
        .unwrap();
    index
        .attach_dependency_binding(&binding("b2", model_id, "p2", "required_core"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();
    assert_eq!(response.validation_state, ValidationState::ProfileConflict);
    assert!(response
        .bindings
        .iter()
        .all(|b| b.validation_state == ValidationState::ProfileConflict));
    assert!(response
        .validation_errors
        .iter()
        .any(|e| e.code == "profile_conflict"));
}

#[test]
fn image_modality_requires_torchvision() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "diffusion/sdxl/base";
    index
        .upsert_model(&baseline(model_id, &["text"], &["image"]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec(&[("torch", "==2.5.1")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-core", "required_core"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();

    let report = &response.bindings[0];
    let required: Vec<&str> = report.required_pins.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(required, vec!["torch", "torchvision"]);
    assert_eq!(report.missing_pins, vec!["torchvision"]);
    assert!(report
        .required_pins
        .iter()
        .find(|p| p.name == "torchvision")
        .unwrap()
        .reasons
        .contains(&"modality_required".to_string()));
    assert_eq!(
        response.validation_state,
        ValidationState::ManualInterventionRequired
    );
}

#[test]
fn optional_binding_problems_stay_binding_local() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/optional-only";
    index
        .upsert_model(&baseline(model_id, &["text"], &["text"]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "xformers-loose",
            1,
            "python-venv",
            &pinned_spec(&[("torch", ">=2.5")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "xformers-loose", "optional_accel"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();

    // The optional binding carries the problem...
    let report = &response.bindings[0];
    assert_eq!(
        report.validation_state,
        ValidationState::ManualInterventionRequired
    );
    assert_eq!(report.validation_errors[0].code, "unpinned_dependency");
    assert_eq!(report.missing_pins, vec!["torch"]);

    // ...but with no required binding affected, the top level stays
    // resolved and required-only missing pins stay empty.
    assert_eq!(response.validation_state, ValidationState::Resolved);
    assert!(response.missing_pins.is_empty());
}

#[test]
fn optional_binding_unknown_modalities_stay_binding_local() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/optional-mystery";
    index.upsert_model(&baseline(model_id, &[], &[])).unwrap();
    index
        .upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec(&[("torch", "==2.5.1")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-core", "optional_feature"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();
    assert_eq!(
        response.bindings[0].validation_errors[0].code,
        "modality_resolution_unknown"
    );
    assert_eq!(response.validation_state, ValidationState::Resolved);
}

#[test]
fn unresolvable_modalities_flag_modality_resolution_unknown() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/mystery";
    index
        .upsert_model(&baseline(model_id, &[], &[]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec(&[("torch", "==2.5.1")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-core", "required_core"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();
    assert_eq!(
        response.validation_state,
        ValidationState::ManualInterventionRequired
    );
    assert_eq!(
        response.bindings[0].validation_errors[0].code,
        "modality_resolution_unknown"
    );
}

#[test]
fn wrong_contract_version_is_invalid_profile() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/contract";
    index
        .upsert_model(&baseline(model_id, &["text"], &["text"]))
        .unwrap();
    let spec = serde_json::json!({
        "dependency_contract_version": 2,
        "python_packages": [{"name": "torch", "version": "==2.5.1"}]
    })
    .to_string();
    index
        .upsert_dependency_profile("future", 1, "python-venv", &spec)
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "future", "required_core"))
        .unwrap();

    let response =
        resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None).unwrap();
    assert_eq!(response.validation_state, ValidationState::InvalidProfile);
    assert_eq!(response.bindings[0].validation_errors[0].code, "invalid_profile");
}

#[test]
fn omitting_a_required_binding_is_reported() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/selection";
    index
        .upsert_model(&baseline(model_id, &["text"], &["text"]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec(&[("torch", "==2.5.1")]),
        )
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-core", "required_core"))
        .unwrap();
    index
        .attach_dependency_binding(&binding("b2", model_id, "torch-core", "optional_feature"))
        .unwrap();

    let selection = vec!["b2".to_string()];
    let response = resolve_dependency_requirements(
        &index,
        model_id,
        PLATFORM,
        Some("pytorch"),
        Some(&selection),
    )
    .unwrap();

    assert_eq!(
        response.validation_state,
        ValidationState::ManualInterventionRequired
    );
    let omitted = response
        .bindings
        .iter()
        .find(|b| b.binding_id == "b1")
        .unwrap();
    assert!(omitted
        .validation_errors
        .iter()
        .any(|e| e.code == "required_binding_omitted"));
}

#[test]
fn response_is_byte_deterministic_for_fixed_state() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let model_id = "llm/llama/deterministic";
    index
        .upsert_model(&baseline(model_id, &["text"], &["image"]))
        .unwrap();
    index
        .upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec(&[("torchvision", "==0.20.0"), ("torch", "==2.5.1")]),
        )
        .unwrap();
    // Insert bindings in non-sorted order; the report order must not care.
    index
        .attach_dependency_binding(&binding("b9", model_id, "torch-core", "required_core"))
        .unwrap();
    index
        .attach_dependency_binding(&binding("b1", model_id, "torch-core", "optional_accel"))
        .unwrap();

    let first = resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None)
        .unwrap();
    let second = resolve_dependency_requirements(&index, model_id, PLATFORM, Some("pytorch"), None)
        .unwrap();

    let first_json = serde_json::to_string(&first).unwrap();
    let second_json = serde_json::to_string(&second).unwrap();
    assert_eq!(first_json, second_json);

    // Requirements are sorted by (kind, name, exact_pin).
    let names: Vec<&str> = first.bindings[0]
        .requirements
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(names, vec!["torch", "torchvision"]);

    // Binding order follows (binding_kind, ..., binding_id).
    let ids: Vec<&str> = first.bindings.iter().map(|b| b.binding_id.as_str()).collect();
    assert_eq!(ids, vec!["b1", "b9"]);

    // env_id carries every identity component.
    let env_id = first.bindings[0].env_id.as_deref().unwrap();
    assert!(env_id.starts_with("python-venv:torch-core:1:"));
    assert!(env_id.ends_with(&format!("{}:pytorch", PLATFORM)));
}

#[test]
fn unknown_model_is_a_transport_error() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp);
    let err = resolve_dependency_requirements(&index, "llm/none/none", PLATFORM, None, None);
    assert!(err.is_err());
}
