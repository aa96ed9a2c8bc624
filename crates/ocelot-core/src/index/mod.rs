//! SQLite index: a rebuildable search/projection layer over the canonical
//! tree.
//!
//! The filesystem (`metadata.json` per model) stays authoritative for model
//! content; the index is derived and can always be rebuilt from disk. Overlay,
//! history, profile, and binding tables are authoritative in the index itself
//! and survive rebuilds.

pub mod dependencies;
pub mod fts;
pub mod metadata;

pub use dependencies::{
    BindingProjection, DependencyBindingRecord, DependencyProfileRecord, ResolvedBindingRow,
};
pub use metadata::{EffectiveMetadata, OverlayRecord};

use crate::classify::model_type::{ArchRule, ConfigRule};
use crate::error::{LibraryError, Result};
use crate::types::{BaselineMetadata, ModelFileEntry};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Search/list projection of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelSummary {
    pub model_id: String,
    pub model_type: String,
    pub family: String,
    pub name: String,
    pub layout: String,
    pub total_size_bytes: u64,
    pub metadata_needs_review: bool,
    /// Baseline + active overlay (JSON merge-patch)
    pub effective_metadata: Value,
    /// Projection of current authoritative binding rows
    pub dependency_bindings: Vec<BindingProjection>,
    pub updated_at: String,
}

/// Sort keys accepted by `list_models`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelSort {
    #[default]
    ModelId,
    TotalSize,
    UpdatedAt,
}

impl ModelSort {
    fn sql(&self) -> &'static str {
        // model_id tie-break keeps every ordering deterministic.
        match self {
            ModelSort::ModelId => "m.model_id ASC",
            ModelSort::TotalSize => "m.total_size DESC, m.model_id ASC",
            ModelSort::UpdatedAt => "m.updated_at DESC, m.model_id ASC",
        }
    }
}

/// Filters for model listing.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub model_type: Option<String>,
    pub tags: Vec<String>,
}

/// SQLite model index with FTS5 search.
pub struct ModelIndex {
    db_path: PathBuf,
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl ModelIndex {
    /// Open or create the index database (WAL mode).
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LibraryError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        Self::seed_rules(&conn)?;

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LibraryError::Index {
            message: "Failed to acquire index connection lock".to_string(),
            source: None,
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS models (
              model_id TEXT PRIMARY KEY,
              canonical_path TEXT NOT NULL,
              model_type TEXT NOT NULL,
              total_size INTEGER NOT NULL,
              metadata_blob TEXT NOT NULL CHECK (json_valid(metadata_blob)),
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_models_type ON models(model_type);
            CREATE INDEX IF NOT EXISTS idx_models_updated ON models(updated_at);

            CREATE TABLE IF NOT EXISTS model_files (
              model_id TEXT NOT NULL,
              rel_path TEXT NOT NULL,
              size INTEGER NOT NULL,
              sha256 TEXT NOT NULL,
              blake3 TEXT NOT NULL,
              PRIMARY KEY (model_id, rel_path),
              FOREIGN KEY (model_id) REFERENCES models(model_id)
            );

            CREATE INDEX IF NOT EXISTS idx_model_files_sha256 ON model_files(sha256);

            CREATE VIRTUAL TABLE IF NOT EXISTS models_fts USING fts5(
              model_id UNINDEXED,
              name,
              family,
              tags,
              architecture,
              tokenize='unicode61 remove_diacritics 2',
              prefix='2 3 4'
            );

            CREATE TABLE IF NOT EXISTS model_metadata_baselines (
              model_id TEXT PRIMARY KEY,
              schema_version INTEGER NOT NULL,
              baseline_json TEXT NOT NULL CHECK (json_valid(baseline_json)),
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              created_by TEXT NOT NULL DEFAULT 'ocelot-library'
            );

            CREATE TRIGGER IF NOT EXISTS trg_model_metadata_baselines_no_update
            BEFORE UPDATE ON model_metadata_baselines
            FOR EACH ROW
            BEGIN
              SELECT RAISE(ABORT, 'model_metadata_baselines is immutable');
            END;

            CREATE TABLE IF NOT EXISTS model_metadata_overlays (
              overlay_id TEXT PRIMARY KEY,
              model_id TEXT NOT NULL,
              overlay_json TEXT NOT NULL CHECK (json_valid(overlay_json)),
              status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'superseded', 'reverted')),
              reason TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              created_by TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_model_metadata_overlays_model
              ON model_metadata_overlays(model_id, created_at);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_metadata_overlays_one_active
              ON model_metadata_overlays(model_id)
              WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS model_metadata_history (
              event_id INTEGER PRIMARY KEY AUTOINCREMENT,
              model_id TEXT NOT NULL,
              overlay_id TEXT,
              actor TEXT NOT NULL,
              action TEXT NOT NULL
                CHECK (action IN (
                  'baseline_created',
                  'overlay_created',
                  'overlay_superseded',
                  'overlay_reverted'
                )),
              old_value_json TEXT,
              new_value_json TEXT,
              reason TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );

            CREATE INDEX IF NOT EXISTS idx_model_metadata_history_model
              ON model_metadata_history(model_id, event_id);

            CREATE TABLE IF NOT EXISTS dependency_profiles (
              profile_id TEXT NOT NULL,
              profile_version INTEGER NOT NULL,
              profile_hash TEXT NOT NULL,
              environment_kind TEXT NOT NULL,
              spec_json TEXT NOT NULL CHECK (json_valid(spec_json)),
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              PRIMARY KEY (profile_id, profile_version)
            );

            CREATE INDEX IF NOT EXISTS idx_dependency_profiles_hash
              ON dependency_profiles(profile_hash);

            CREATE TABLE IF NOT EXISTS model_dependency_bindings (
              binding_id TEXT PRIMARY KEY,
              model_id TEXT NOT NULL,
              profile_id TEXT NOT NULL,
              profile_version INTEGER NOT NULL,
              binding_kind TEXT NOT NULL
                CHECK (binding_kind IN
                  ('required_core', 'required_custom', 'optional_feature', 'optional_accel')),
              backend_key TEXT,
              platform_selector TEXT,
              priority INTEGER NOT NULL DEFAULT 100,
              status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'deprecated')),
              attached_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              FOREIGN KEY (profile_id, profile_version)
                REFERENCES dependency_profiles(profile_id, profile_version)
            );

            CREATE INDEX IF NOT EXISTS idx_model_dependency_bindings_model
              ON model_dependency_bindings(model_id, status, binding_kind, backend_key, priority, binding_id);

            CREATE TABLE IF NOT EXISTS task_signature_mappings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              signature_key TEXT NOT NULL,
              mapping_version INTEGER NOT NULL,
              input_modalities_json TEXT NOT NULL,
              output_modalities_json TEXT NOT NULL,
              task_type_primary TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 100,
              status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'pending', 'deprecated')),
              source TEXT NOT NULL DEFAULT 'system',
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              UNIQUE(signature_key, mapping_version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_task_signature_mappings_one_active
              ON task_signature_mappings(signature_key)
              WHERE status = 'active';

            CREATE UNIQUE INDEX IF NOT EXISTS idx_task_signature_mappings_one_pending
              ON task_signature_mappings(signature_key)
              WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS model_type_arch_rules (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              pattern TEXT NOT NULL,
              match_style TEXT NOT NULL CHECK (match_style IN ('exact', 'prefix', 'suffix', 'wildcard')),
              model_type TEXT NOT NULL
                CHECK (model_type IN ('llm', 'diffusion', 'audio', 'vision', 'embedding', 'unknown')),
              priority INTEGER NOT NULL DEFAULT 100,
              status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'pending', 'deprecated')),
              source TEXT NOT NULL DEFAULT 'system'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_type_arch_rules_one_active
              ON model_type_arch_rules(pattern, match_style)
              WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS model_type_config_rules (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              config_model_type TEXT NOT NULL,
              model_type TEXT NOT NULL
                CHECK (model_type IN ('llm', 'diffusion', 'audio', 'vision', 'embedding', 'unknown')),
              priority INTEGER NOT NULL DEFAULT 100,
              status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'pending', 'deprecated')),
              source TEXT NOT NULL DEFAULT 'system'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_type_config_rules_one_active
              ON model_type_config_rules(config_model_type)
              WHERE status = 'active';
            ",
        )?;
        Ok(())
    }

    /// Seed the baseline resolver rule set (idempotent).
    fn seed_rules(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            INSERT OR IGNORE INTO model_type_arch_rules (pattern, match_style, model_type) VALUES
              ('ForCausalLM', 'suffix', 'llm'),
              ('ForMaskedLM', 'suffix', 'llm'),
              ('ForConditionalGeneration', 'suffix', 'llm'),
              ('ForSequenceClassification', 'suffix', 'llm'),
              ('ForQuestionAnswering', 'suffix', 'llm'),
              ('ForSpeechSeq2Seq', 'suffix', 'audio'),
              ('ForAudioClassification', 'suffix', 'audio'),
              ('Whisper', 'prefix', 'audio'),
              ('Encodec', 'prefix', 'audio'),
              ('ForImageClassification', 'suffix', 'vision'),
              ('ForObjectDetection', 'suffix', 'vision'),
              ('ForSemanticSegmentation', 'suffix', 'vision'),
              ('CLIPVisionModel', 'prefix', 'vision'),
              ('UNet2DConditionModel', 'exact', 'diffusion'),
              ('UNet2DModel', 'exact', 'diffusion'),
              ('AutoencoderKL', 'exact', 'diffusion'),
              ('StableDiffusion*Pipeline', 'wildcard', 'diffusion'),
              ('Flux*Pipeline', 'wildcard', 'diffusion'),
              ('DiffusionPipeline', 'exact', 'diffusion');

            INSERT OR IGNORE INTO model_type_config_rules (config_model_type, model_type) VALUES
              ('llama', 'llm'),
              ('mistral', 'llm'),
              ('mixtral', 'llm'),
              ('phi', 'llm'),
              ('phi3', 'llm'),
              ('qwen2', 'llm'),
              ('qwen3', 'llm'),
              ('gemma', 'llm'),
              ('gemma2', 'llm'),
              ('falcon', 'llm'),
              ('deepseek_v2', 'llm'),
              ('deepseek_v3', 'llm'),
              ('mamba', 'llm'),
              ('stable_diffusion', 'diffusion'),
              ('sdxl', 'diffusion'),
              ('flux', 'diffusion'),
              ('pixart', 'diffusion'),
              ('whisper', 'audio'),
              ('wav2vec2', 'audio'),
              ('bark', 'audio'),
              ('musicgen', 'audio'),
              ('vit', 'vision'),
              ('clip', 'vision'),
              ('siglip', 'vision'),
              ('dinov2', 'vision'),
              ('bge', 'embedding'),
              ('e5', 'embedding'),
              ('gte', 'embedding');

            INSERT OR IGNORE INTO task_signature_mappings (
              signature_key, mapping_version, input_modalities_json, output_modalities_json, task_type_primary
            ) VALUES
              ('text->text', 1, '[\"text\"]', '[\"text\"]', 'text-generation'),
              ('text->image', 1, '[\"text\"]', '[\"image\"]', 'text-to-image'),
              ('image->image', 1, '[\"image\"]', '[\"image\"]', 'image-to-image'),
              ('text+image->image', 1, '[\"text\",\"image\"]', '[\"image\"]', 'text-image-to-image'),
              ('text+image->text', 1, '[\"text\",\"image\"]', '[\"text\"]', 'visual-question-answering'),
              ('text->audio', 1, '[\"text\"]', '[\"audio\"]', 'text-to-audio'),
              ('audio->audio', 1, '[\"audio\"]', '[\"audio\"]', 'audio-to-audio'),
              ('audio->text', 1, '[\"audio\"]', '[\"text\"]', 'audio-to-text'),
              ('text->embedding', 1, '[\"text\"]', '[\"embedding\"]', 'text-embedding'),
              ('image->text', 1, '[\"image\"]', '[\"text\"]', 'image-to-text'),
              ('image->mask', 1, '[\"image\"]', '[\"mask\"]', 'image-segmentation'),
              ('text->video', 1, '[\"text\"]', '[\"video\"]', 'text-to-video'),
              ('text->3d', 1, '[\"text\"]', '[\"3d\"]', 'text-to-3d'),
              ('image->3d', 1, '[\"image\"]', '[\"3d\"]', 'image-to-3d');
            ",
        )?;
        Ok(())
    }

    // ========================================
    // Model rows
    // ========================================

    /// Insert or update a model from its baseline metadata.
    ///
    /// One transaction covers the model row, file rows, the immutable
    /// baseline snapshot, the FTS row re-emit, and the binding projection
    /// refresh.
    pub fn upsert_model(&self, baseline: &BaselineMetadata) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let blob = serde_json::to_string_pretty(&serde_json::to_value(baseline)?)?;
        let now = chrono::Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO models (model_id, canonical_path, model_type, total_size, metadata_blob, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(model_id) DO UPDATE SET
                 canonical_path=excluded.canonical_path,
                 model_type=excluded.model_type,
                 total_size=excluded.total_size,
                 metadata_blob=excluded.metadata_blob,
                 updated_at=excluded.updated_at",
            params![
                baseline.model_id,
                baseline.model_id,
                baseline.model_type.as_str(),
                baseline.total_size_bytes as i64,
                blob,
                now,
            ],
        )?;

        tx.execute(
            "DELETE FROM model_files WHERE model_id = ?1",
            params![baseline.model_id],
        )?;
        for file in &baseline.files {
            tx.execute(
                "INSERT INTO model_files (model_id, rel_path, size, sha256, blake3)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    baseline.model_id,
                    file.rel_path,
                    file.size_bytes as i64,
                    file.sha256,
                    file.blake3,
                ],
            )?;
        }

        metadata::record_baseline_tx(&tx, baseline)?;
        Self::emit_fts_row_tx(&tx, baseline)?;
        dependencies::refresh_binding_projection_tx(&tx, &baseline.model_id)?;

        tx.commit()?;
        debug!("Upserted model {}", baseline.model_id);
        Ok(())
    }

    /// Re-emit the FTS row for one model inside an open transaction.
    fn emit_fts_row_tx(tx: &Connection, baseline: &BaselineMetadata) -> Result<()> {
        tx.execute(
            "DELETE FROM models_fts WHERE model_id = ?1",
            params![baseline.model_id],
        )?;
        tx.execute(
            "INSERT INTO models_fts (model_id, name, family, tags, architecture)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                baseline.model_id,
                baseline
                    .official_name
                    .clone()
                    .unwrap_or_else(|| baseline.name.clone()),
                baseline.family,
                baseline.tags.join(" "),
                baseline.architecture_tokens.join(" "),
            ],
        )?;
        Ok(())
    }

    /// Fetch the raw metadata blob (baseline + projection) for one model.
    pub fn get_model_blob(&self, model_id: &str) -> Result<Option<Value>> {
        let conn = self.lock()?;
        let blob: Option<String> = conn
            .query_row(
                "SELECT metadata_blob FROM models WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    /// Whether a model row exists.
    pub fn contains_model(&self, model_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM models WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a model row and its derived rows. Overlay history stays for
    /// audit purposes.
    pub fn delete_model(&self, model_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM models WHERE model_id = ?1", params![model_id])?;
        tx.execute(
            "DELETE FROM model_files WHERE model_id = ?1",
            params![model_id],
        )?;
        tx.execute(
            "DELETE FROM models_fts WHERE model_id = ?1",
            params![model_id],
        )?;
        tx.execute(
            "DELETE FROM model_metadata_baselines WHERE model_id = ?1",
            params![model_id],
        )?;
        tx.execute(
            "UPDATE model_metadata_overlays SET status = 'superseded'
             WHERE model_id = ?1 AND status = 'active'",
            params![model_id],
        )?;
        tx.execute(
            "DELETE FROM model_dependency_bindings WHERE model_id = ?1",
            params![model_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Find an existing model whose file set matches (same SHA-256 and same
    /// relative path set). Used for idempotent import.
    pub fn find_duplicate(&self, files: &[ModelFileEntry]) -> Result<Option<String>> {
        let Some(first) = files.first() else {
            return Ok(None);
        };

        let candidates: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt =
                conn.prepare("SELECT DISTINCT model_id FROM model_files WHERE sha256 = ?1 ORDER BY model_id")?;
            let ids = stmt
                .query_map(params![first.sha256], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let mut wanted: Vec<(String, String)> = files
            .iter()
            .map(|f| (f.rel_path.clone(), f.sha256.clone()))
            .collect();
        wanted.sort();

        for candidate in candidates {
            let mut existing = self.file_set(&candidate)?;
            existing.sort();
            if existing == wanted {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn file_set(&self, model_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT rel_path, sha256 FROM model_files WHERE model_id = ?1")?;
        let files = stmt
            .query_map(params![model_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Models containing a file with the given SHA-256.
    pub fn models_with_sha256(&self, sha256: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, rel_path FROM model_files WHERE sha256 = ?1 ORDER BY model_id, rel_path",
        )?;
        let rows = stmt
            .query_map(params![sha256], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================
    // Listing and search
    // ========================================

    /// List models with filters, deterministic ordering, and pagination.
    pub fn list_models(
        &self,
        filter: &ModelFilter,
        sort: ModelSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ModelSummary>> {
        let ids: Vec<String> = {
            let conn = self.lock()?;
            let mut sql = String::from("SELECT m.model_id FROM models m WHERE 1=1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref model_type) = filter.model_type {
                sql.push_str(" AND m.model_type = ?");
                params_vec.push(Box::new(model_type.clone()));
            }
            for tag in &filter.tags {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM json_each(json_extract(m.metadata_blob, '$.tags'))
                       WHERE json_each.value = ?)",
                );
                params_vec.push(Box::new(tag.clone()));
            }
            sql.push_str(&format!(
                " ORDER BY {} LIMIT ? OFFSET ?",
                sort.sql()
            ));
            params_vec.push(Box::new(limit as i64));
            params_vec.push(Box::new(offset as i64));

            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(
                    rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
                    |row| row.get::<_, String>(0),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        ids.iter().map(|id| self.summarize(id)).collect()
    }

    /// FTS5 search over name/family/tags/architecture.
    ///
    /// Results are ordered `(rank ASC, model_id ASC)` for determinism. An
    /// empty query degrades to a plain listing.
    pub fn search(
        &self,
        query: &str,
        model_type: Option<&str>,
        tags: &[String],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ModelSummary>> {
        let match_query = fts::build_match_query(query);
        if match_query.is_empty() {
            return self.list_models(
                &ModelFilter {
                    model_type: model_type.map(String::from),
                    tags: tags.to_vec(),
                },
                ModelSort::ModelId,
                limit,
                offset,
            );
        }

        let ids: Vec<String> = {
            let conn = self.lock()?;
            let mut sql = String::from(
                "SELECT m.model_id
                 FROM models_fts
                 JOIN models m ON m.model_id = models_fts.model_id
                 WHERE models_fts MATCH ?",
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_query)];

            if let Some(model_type) = model_type {
                sql.push_str(" AND m.model_type = ?");
                params_vec.push(Box::new(model_type.to_string()));
            }
            for tag in tags {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM json_each(json_extract(m.metadata_blob, '$.tags'))
                       WHERE json_each.value = ?)",
                );
                params_vec.push(Box::new(tag.clone()));
            }
            sql.push_str(" ORDER BY models_fts.rank ASC, m.model_id ASC LIMIT ? OFFSET ?");
            params_vec.push(Box::new(limit as i64));
            params_vec.push(Box::new(offset as i64));

            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(
                    rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
                    |row| row.get::<_, String>(0),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        ids.iter().map(|id| self.summarize(id)).collect()
    }

    /// Build the projection for one model, repairing a stale binding
    /// projection if the blob disagrees with authoritative rows.
    pub fn summarize(&self, model_id: &str) -> Result<ModelSummary> {
        let mut blob = self
            .get_model_blob(model_id)?
            .ok_or_else(|| LibraryError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;

        let live = dependencies::binding_projection(self, model_id)?;
        let projected: Vec<BindingProjection> = blob
            .get("dependency_bindings")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if projected != live {
            warn!(
                "Repairing stale dependency binding projection for {}",
                model_id
            );
            dependencies::refresh_binding_projection(self, model_id)?;
            blob["dependency_bindings"] = serde_json::to_value(&live)?;
        }

        let overlay = metadata::active_overlay(self, model_id)?;
        let effective = match overlay {
            Some(ref record) => crate::overlay::merge_patch(&blob, &record.overlay_json),
            None => blob.clone(),
        };

        let updated_at: String = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT updated_at FROM models WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )?
        };

        Ok(ModelSummary {
            model_id: model_id.to_string(),
            model_type: string_field(&effective, "model_type"),
            family: string_field(&effective, "family"),
            name: string_field(&effective, "name"),
            layout: string_field(&effective, "layout"),
            total_size_bytes: effective
                .get("total_size_bytes")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            metadata_needs_review: effective
                .get("metadata_needs_review")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            effective_metadata: effective,
            dependency_bindings: live,
            updated_at,
        })
    }

    /// All model ids, ordered.
    pub fn all_model_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT model_id FROM models ORDER BY model_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Rebuild all derived rows from baseline documents read off disk.
    ///
    /// Overlays, history, profiles, and bindings are authoritative here and
    /// are left untouched; only the projection tables are recreated, so the
    /// operation is idempotent.
    pub fn rebuild_from_filesystem(&self, baselines: &[BaselineMetadata]) -> Result<()> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(
                "DELETE FROM models;
                 DELETE FROM model_files;
                 DELETE FROM models_fts;",
            )?;
            tx.commit()?;
        }

        for baseline in baselines {
            self.upsert_model(baseline)?;
        }

        info!("Rebuilt index from {} baseline documents", baselines.len());
        Ok(())
    }

    // ========================================
    // Classification rule rows
    // ========================================

    /// Active architecture rules, priority order.
    pub fn list_active_arch_rules(&self) -> Result<Vec<ArchRule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT pattern, match_style, model_type, priority
             FROM model_type_arch_rules WHERE status = 'active'
             ORDER BY priority, pattern",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(ArchRule {
                    pattern: row.get(0)?,
                    match_style: row.get(1)?,
                    model_type: row.get(2)?,
                    priority: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Active config.model_type rules, priority order.
    pub fn list_active_config_rules(&self) -> Result<Vec<ConfigRule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT config_model_type, model_type, priority
             FROM model_type_config_rules WHERE status = 'active'
             ORDER BY priority, config_model_type",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(ConfigRule {
                    config_model_type: row.get(0)?,
                    model_type: row.get(1)?,
                    priority: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Look up the active task-signature mapping for a signature key.
    pub fn active_task_mapping(&self, signature_key: &str) -> Result<Option<(String, Vec<String>, Vec<String>)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT task_type_primary, input_modalities_json, output_modalities_json
                 FROM task_signature_mappings
                 WHERE signature_key = ?1 AND status = 'active'",
                params![signature_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(task, inputs, outputs)| {
            Ok((
                task,
                serde_json::from_str(&inputs)?,
                serde_json::from_str(&outputs)?,
            ))
        })
        .transpose()
    }

    /// Record a pending mapping row for an unrecognized signature key.
    ///
    /// Import does not block on it; the row queues the signature for
    /// operator review.
    pub fn record_pending_task_signature(&self, signature_key: &str) -> Result<()> {
        let conn = self.lock()?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_signature_mappings
             WHERE signature_key = ?1 AND status IN ('active', 'pending')",
            params![signature_key],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Ok(());
        }

        let next_version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(mapping_version), 0) + 1 FROM task_signature_mappings
             WHERE signature_key = ?1",
            params![signature_key],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO task_signature_mappings (
                 signature_key, mapping_version, input_modalities_json,
                 output_modalities_json, task_type_primary, status, source
             ) VALUES (?1, ?2, '[\"unknown\"]', '[\"unknown\"]', 'unknown', 'pending', 'import')",
            params![signature_key, next_version],
        )?;
        Ok(())
    }

    /// Status of the mapping row for a signature key, if any.
    pub fn task_signature_status(&self, signature_key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let status = conn
            .query_row(
                "SELECT status FROM task_signature_mappings
                 WHERE signature_key = ?1
                 ORDER BY mapping_version DESC LIMIT 1",
                params![signature_key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(status)
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelLayout, ModelType, METADATA_SCHEMA_VERSION};
    use tempfile::TempDir;

    pub(crate) fn baseline(model_id: &str, name: &str, sha: &str) -> BaselineMetadata {
        let (model_type, family) = {
            let mut parts = model_id.split('/');
            (
                parts.next().unwrap().parse::<ModelType>().unwrap(),
                parts.next().unwrap().to_string(),
            )
        };
        BaselineMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            model_id: model_id.to_string(),
            model_type,
            family,
            name: name.to_string(),
            official_name: None,
            layout: ModelLayout::SingleFile,
            files: vec![ModelFileEntry {
                rel_path: format!("{}.gguf", name),
                size_bytes: 4,
                sha256: sha.to_string(),
                blake3: format!("b3-{}", sha),
            }],
            total_size_bytes: 4,
            task_type_primary: None,
            input_modalities: vec!["text".into()],
            output_modalities: vec!["text".into()],
            architecture_tokens: vec!["LlamaForCausalLM".into()],
            tags: vec!["chat".into()],
            metadata_needs_review: false,
            review_reasons: vec![],
            source_repo_id: None,
            dependency_bindings: vec![],
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn open_index() -> (TempDir, ModelIndex) {
        let tmp = TempDir::new().unwrap();
        let index = ModelIndex::open(tmp.path().join("models.db")).unwrap();
        (tmp, index)
    }

    #[test]
    fn upsert_and_summarize() {
        let (_tmp, index) = open_index();
        index
            .upsert_model(&baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11"))
            .unwrap();

        let summary = index.summarize("llm/llama/llama-2-7b").unwrap();
        assert_eq!(summary.model_type, "llm");
        assert_eq!(summary.family, "llama");
        assert!(!summary.metadata_needs_review);
        assert!(summary.dependency_bindings.is_empty());
    }

    #[test]
    fn fts_search_finds_by_prefix() {
        let (_tmp, index) = open_index();
        index
            .upsert_model(&baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11"))
            .unwrap();
        index
            .upsert_model(&baseline("llm/qwen/qwen-7b", "qwen-7b", "bb22"))
            .unwrap();

        let results = index.search("llam", None, &[], 10, 0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].model_id, "llm/llama/llama-2-7b");

        // Architecture tokens are searchable too.
        let by_arch = index.search("LlamaForCausalLM", None, &[], 10, 0).unwrap();
        assert_eq!(by_arch.len(), 2);
    }

    #[test]
    fn search_filters_by_type_and_tag() {
        let (_tmp, index) = open_index();
        index
            .upsert_model(&baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11"))
            .unwrap();
        let mut diff = baseline("diffusion/sdxl/base", "base", "cc33");
        diff.tags = vec!["image".into()];
        index.upsert_model(&diff).unwrap();

        let llm_only = index
            .list_models(
                &ModelFilter {
                    model_type: Some("llm".into()),
                    tags: vec![],
                },
                ModelSort::ModelId,
                10,
                0,
            )
            .unwrap();
        assert_eq!(llm_only.len(), 1);

        let tagged = index
            .list_models(
                &ModelFilter {
                    model_type: None,
                    tags: vec!["image".into()],
                },
                ModelSort::ModelId,
                10,
                0,
            )
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].model_id, "diffusion/sdxl/base");
    }

    #[test]
    fn duplicate_detection_matches_full_file_set() {
        let (_tmp, index) = open_index();
        let original = baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11");
        index.upsert_model(&original).unwrap();

        assert_eq!(
            index.find_duplicate(&original.files).unwrap(),
            Some("llm/llama/llama-2-7b".to_string())
        );

        // Same hash, different relative path: not a duplicate.
        let mut renamed = original.files.clone();
        renamed[0].rel_path = "other-name.gguf".into();
        assert_eq!(index.find_duplicate(&renamed).unwrap(), None);
    }

    #[test]
    fn rebuild_preserves_search_results() {
        let (_tmp, index) = open_index();
        let a = baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11");
        let b = baseline("llm/qwen/qwen-7b", "qwen-7b", "bb22");
        index.upsert_model(&a).unwrap();
        index.upsert_model(&b).unwrap();

        let before = index.search("7b", None, &[], 10, 0).unwrap();
        index.rebuild_from_filesystem(&[a, b]).unwrap();
        let after = index.search("7b", None, &[], 10, 0).unwrap();

        let key = |s: &ModelSummary| (s.model_id.clone(), s.effective_metadata.clone());
        assert_eq!(
            before.iter().map(key).collect::<Vec<_>>(),
            after.iter().map(key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn delete_removes_derived_rows() {
        let (_tmp, index) = open_index();
        index
            .upsert_model(&baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11"))
            .unwrap();
        assert!(index.delete_model("llm/llama/llama-2-7b").unwrap());
        assert!(!index.contains_model("llm/llama/llama-2-7b").unwrap());
        assert!(index.search("llama", None, &[], 10, 0).unwrap().is_empty());
    }

    #[test]
    fn pending_task_signature_rows() {
        let (_tmp, index) = open_index();
        index
            .record_pending_task_signature("unknown->unknown")
            .unwrap();
        index
            .record_pending_task_signature("unknown->unknown")
            .unwrap();
        assert_eq!(
            index.task_signature_status("unknown->unknown").unwrap(),
            Some("pending".to_string())
        );
        // Seeded mappings stay active.
        assert_eq!(
            index.task_signature_status("text->image").unwrap(),
            Some("active".to_string())
        );
    }

    #[test]
    fn seeded_rules_are_listed() {
        let (_tmp, index) = open_index();
        assert!(!index.list_active_arch_rules().unwrap().is_empty());
        assert!(!index.list_active_config_rules().unwrap().is_empty());
        assert!(index
            .active_task_mapping("text->image")
            .unwrap()
            .is_some());
    }
}
