//! End-to-end tests over the `ModelLibrary` facade.

use ocelot_library::cancel::CancellationToken;
use ocelot_library::context::LibraryContext;
use ocelot_library::importer::ImportHints;
use ocelot_library::index::{ModelFilter, ModelSort};
use ocelot_library::io_queue::IoQueue;
use ocelot_library::library::ModelLibrary;
use ocelot_library::mapper::{ModelRule, RuleMatch, TranslationConfig};
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn gguf_bytes(arch: &str, payload: &[u8]) -> Vec<u8> {
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
    bytes
}

async fn library(tmp: &TempDir) -> ModelLibrary {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ocelot_library=debug")
        .with_test_writer()
        .try_init();
    let context =
        LibraryContext::with_io_queue(tmp.path().join("root"), IoQueue::with_uniform_slots(2))
            .unwrap();
    ModelLibrary::new(context).await.unwrap()
}

fn drop_gguf(dir: &Path, name: &str, payload: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, gguf_bytes("llama", payload)).unwrap();
    path
}

#[tokio::test]
async fn import_search_and_status() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;
    let inbox = tmp.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();

    let source = drop_gguf(&inbox, "llama-2-7b.gguf", b"weights");
    let report = lib
        .import_model(&[source], &ImportHints::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.model_ids, vec!["llm/llama/llama-2-7b"]);

    let results = lib
        .search_models_fts("llama", 10, 0, None, &[])
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].model_id, "llm/llama/llama-2-7b");
    assert_eq!(results[0].model_type, "llm");

    let status = lib.get_library_status().unwrap();
    assert_eq!(status.model_count, 1);
    assert!(status.total_size_bytes > 0);
    assert_eq!(status.active_downloads, 0);

    let listed = lib
        .list_models(&ModelFilter::default(), ModelSort::ModelId, 10, 0)
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn overlay_lifecycle_restores_baseline() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;
    let inbox = tmp.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    let source = drop_gguf(&inbox, "llama.gguf", b"weights");
    let report = lib
        .import_model(&[source], &ImportHints::default(), &CancellationToken::new())
        .await
        .unwrap();
    let model_id = &report.model_ids[0];

    let before = lib.get_library_model_metadata(model_id).unwrap();
    assert!(before.active_overlay.is_none());

    lib.submit_model_review(
        model_id,
        &json!({"tags": ["reviewed"], "metadata_needs_review": false}),
        "alice",
        Some("triage"),
    )
    .unwrap();

    let during = lib.get_library_model_metadata(model_id).unwrap();
    assert!(during.active_overlay.is_some());
    assert_eq!(during.effective_metadata["tags"], json!(["reviewed"]));
    assert_ne!(during.baseline["tags"], json!(["reviewed"]));

    assert!(lib.reset_model_review(model_id, "alice", None).unwrap());
    let after = lib.get_library_model_metadata(model_id).unwrap();
    assert!(after.active_overlay.is_none());
    assert_eq!(after.effective_metadata, after.baseline);
}

#[tokio::test]
async fn rebuild_from_filesystem_is_equivalent() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;
    let inbox = tmp.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();

    for (name, payload) in [("llama-2-7b.gguf", b"one".as_slice()), ("llama-chat.gguf", b"two")] {
        let source = drop_gguf(&inbox, name, payload);
        lib.import_model(&[source], &ImportHints::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    let before = lib.search_models_fts("llama", 10, 0, None, &[]).unwrap();
    lib.rebuild_index().unwrap();
    let after = lib.search_models_fts("llama", 10, 0, None, &[]).unwrap();

    let snapshot = |s: &ocelot_library::index::ModelSummary| {
        (
            s.model_id.clone(),
            s.effective_metadata.clone(),
            s.dependency_bindings.clone(),
        )
    };
    assert_eq!(
        before.iter().map(snapshot).collect::<Vec<_>>(),
        after.iter().map(snapshot).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn delete_cascades_links_and_index() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;

    // Install a translation config so mapping fan-out runs on import.
    let app_root = tmp.path().join("apps").join("comfyui");
    std::fs::create_dir_all(&app_root).unwrap();
    let config_dir = lib.context().paths.translation_config_dir();
    std::fs::create_dir_all(&config_dir).unwrap();
    let config = TranslationConfig {
        schema_version: 1,
        app_id: "comfyui".into(),
        version: "*".into(),
        app_root: app_root.clone(),
        model_rules: vec![ModelRule {
            match_clause: RuleMatch {
                model_types: Some(vec!["llm".into()]),
                ..Default::default()
            },
            target_path_template: "models/llm/{filename}".into(),
            link_preference: None,
        }],
        overrides: vec![],
        app_directories: vec![],
    };
    std::fs::write(
        config_dir.join("comfyui_any_default.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let inbox = tmp.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    let source = drop_gguf(&inbox, "llama.gguf", b"weights");
    let report = lib
        .import_model(&[source], &ImportHints::default(), &CancellationToken::new())
        .await
        .unwrap();
    let model_id = report.model_ids[0].clone();

    // Import fan-out materialized the link.
    let target = app_root.join("models/llm/llama.gguf");
    assert!(target.exists());

    let health = lib.get_link_health(None).unwrap();
    assert_eq!(health.total, 1);
    assert_eq!(health.healthy, 1);

    let delete = lib.delete_model(&model_id).unwrap();
    assert!(delete.is_clean());
    assert!(!target.exists());
    assert!(lib.search_models_fts("llama", 10, 0, None, &[]).unwrap().is_empty());
    assert_eq!(lib.get_link_health(None).unwrap().total, 0);
    assert!(lib.get_library_model_metadata(&model_id).is_err());
}

#[tokio::test]
async fn scan_shared_storage_adopts_stray_models() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;

    let stray = lib.layout().model_dir("llm/llama/stray");
    std::fs::create_dir_all(&stray).unwrap();
    std::fs::write(stray.join("weights.gguf"), gguf_bytes("llama", b"x")).unwrap();

    let report = lib.scan_shared_storage(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.model_ids, vec!["llm/llama/stray"]);
    assert_eq!(
        lib.search_models_fts("stray", 10, 0, None, &[]).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn validate_file_type_reads_magic_bytes() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;
    let inbox = tmp.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();

    let gguf = drop_gguf(&inbox, "a.gguf", b"w");
    let report = lib.validate_file_type(&gguf).unwrap();
    assert_eq!(report.format, "gguf");
    assert!(report.supported);

    let junk = inbox.join("junk.xyz");
    std::fs::write(&junk, b"not a model").unwrap();
    let report = lib.validate_file_type(&junk).unwrap();
    assert_eq!(report.format, "unknown");
    assert!(!report.supported);
}

#[tokio::test]
async fn network_status_starts_online() {
    let tmp = TempDir::new().unwrap();
    let lib = library(&tmp).await;
    let status = lib.get_network_status();
    assert!(status.online);
    assert!(!status.offline_mode);
}

#[tokio::test]
async fn watcher_reindexes_external_changes() {
    let tmp = TempDir::new().unwrap();
    let lib = std::sync::Arc::new(library(&tmp).await);
    let watcher = std::sync::Arc::clone(&lib).start_watcher().unwrap();

    // Drop a model into the tree behind the library's back.
    let dir = lib.layout().model_dir("llm/llama/external");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("model.gguf"), gguf_bytes("llama", b"w")).unwrap();
    let metadata = json!({
        "schema_version": 1,
        "model_id": "llm/llama/external",
        "model_type": "llm",
        "family": "llama",
        "name": "external",
        "layout": "single_file",
        "files": [],
        "total_size_bytes": 0,
        "created_at": "2025-01-01T00:00:00Z"
    });
    std::fs::write(
        dir.join("metadata.json"),
        serde_json::to_string_pretty(&metadata).unwrap(),
    )
    .unwrap();

    // Give the debounce window time to flush.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    watcher.stop();

    assert!(lib.index().contains_model("llm/llama/external").unwrap());
}
