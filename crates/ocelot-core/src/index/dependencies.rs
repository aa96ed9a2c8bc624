//! Dependency profiles, bindings, and the binding projection.
//!
//! Profiles are content-hashed and immutable per `(profile_id,
//! profile_version)`: re-inserting identical content is a no-op, differing
//! content fails closed. Binding rows are authoritative; the
//! `dependency_bindings` array inside `models.metadata_blob` is a projection
//! refreshed transactionally on every binding write and repaired on stale
//! reads.

use super::ModelIndex;
use crate::error::{LibraryError, Result};
use crate::resolver::pins::parse_and_canonicalize_profile_spec;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One dependency profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DependencyProfileRecord {
    pub profile_id: String,
    pub profile_version: i64,
    pub profile_hash: String,
    pub environment_kind: String,
    /// Canonicalized spec JSON (sorted keys, normalized pins)
    pub spec_json: String,
    pub created_at: String,
}

/// One binding row as written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DependencyBindingRecord {
    pub binding_id: String,
    pub model_id: String,
    pub profile_id: String,
    pub profile_version: i64,
    pub binding_kind: String,
    pub backend_key: Option<String>,
    pub platform_selector: Option<String>,
    pub priority: i64,
    pub status: String,
}

/// Binding joined with its profile for the resolver.
#[derive(Debug, Clone)]
pub struct ResolvedBindingRow {
    pub binding: DependencyBindingRecord,
    /// Absent when the referenced profile row is missing
    pub profile_hash: Option<String>,
    pub environment_kind: Option<String>,
    pub spec_json: Option<String>,
}

/// Row shape of the `dependency_bindings` projection inside metadata blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BindingProjection {
    pub binding_id: String,
    pub profile_id: String,
    pub profile_version: i64,
    pub binding_kind: String,
    pub backend_key: Option<String>,
    pub platform_selector: Option<String>,
    pub priority: i64,
    pub status: String,
}

/// Deterministic ordering shared by the projection and the resolver.
const BINDING_ORDER: &str =
    "binding_kind, backend_key, platform_selector, profile_id, profile_version, priority, binding_id";

impl ModelIndex {
    /// Insert a dependency profile, enforcing content immutability.
    ///
    /// The spec is parsed and canonicalized first; the profile hash is the
    /// SHA-256 of the canonical JSON. Same `(id, version)` with the same hash
    /// is a no-op; a differing hash is rejected with `ProfileImmutable`.
    pub fn upsert_dependency_profile(
        &self,
        profile_id: &str,
        profile_version: i64,
        environment_kind: &str,
        spec_json: &str,
    ) -> Result<DependencyProfileRecord> {
        let field_context = format!("dependency_profiles.{}:{}", profile_id, profile_version);
        let parsed =
            parse_and_canonicalize_profile_spec(spec_json, environment_kind, &field_context)?;

        let conn = self.lock()?;
        let existing: Option<(String, String, String)> = conn
            .query_row(
                "SELECT profile_hash, spec_json, created_at FROM dependency_profiles
                 WHERE profile_id = ?1 AND profile_version = ?2",
                params![profile_id, profile_version],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((hash, spec, created_at)) = existing {
            if hash == parsed.profile_hash {
                return Ok(DependencyProfileRecord {
                    profile_id: profile_id.to_string(),
                    profile_version,
                    profile_hash: hash,
                    environment_kind: environment_kind.to_string(),
                    spec_json: spec,
                    created_at,
                });
            }
            return Err(LibraryError::ProfileImmutable {
                profile_id: profile_id.to_string(),
                profile_version,
            });
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO dependency_profiles
                 (profile_id, profile_version, profile_hash, environment_kind, spec_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile_id,
                profile_version,
                parsed.profile_hash,
                environment_kind,
                parsed.canonical_json,
                created_at,
            ],
        )?;
        debug!(
            "Registered dependency profile {}:{} ({})",
            profile_id, profile_version, parsed.profile_hash
        );

        Ok(DependencyProfileRecord {
            profile_id: profile_id.to_string(),
            profile_version,
            profile_hash: parsed.profile_hash,
            environment_kind: environment_kind.to_string(),
            spec_json: parsed.canonical_json,
            created_at,
        })
    }

    /// Attach a binding to a model and refresh its projection in the same
    /// transaction.
    pub fn attach_dependency_binding(&self, record: &DependencyBindingRecord) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let profile_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM dependency_profiles
             WHERE profile_id = ?1 AND profile_version = ?2",
            params![record.profile_id, record.profile_version],
            |row| row.get(0),
        )?;
        if profile_exists == 0 {
            return Err(LibraryError::Validation {
                field: "binding.profile".to_string(),
                message: format!(
                    "profile {}:{} does not exist",
                    record.profile_id, record.profile_version
                ),
            });
        }

        tx.execute(
            "INSERT INTO model_dependency_bindings
                 (binding_id, model_id, profile_id, profile_version, binding_kind,
                  backend_key, platform_selector, priority, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(binding_id) DO UPDATE SET
                 model_id=excluded.model_id,
                 profile_id=excluded.profile_id,
                 profile_version=excluded.profile_version,
                 binding_kind=excluded.binding_kind,
                 backend_key=excluded.backend_key,
                 platform_selector=excluded.platform_selector,
                 priority=excluded.priority,
                 status=excluded.status",
            params![
                record.binding_id,
                record.model_id,
                record.profile_id,
                record.profile_version,
                record.binding_kind,
                record.backend_key,
                record.platform_selector,
                record.priority,
                record.status,
            ],
        )?;

        refresh_binding_projection_tx(&tx, &record.model_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Deprecate a binding and refresh the model's projection.
    pub fn deprecate_dependency_binding(&self, binding_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let model_id: Option<String> = tx
            .query_row(
                "SELECT model_id FROM model_dependency_bindings WHERE binding_id = ?1",
                params![binding_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(model_id) = model_id else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE model_dependency_bindings SET status = 'deprecated' WHERE binding_id = ?1",
            params![binding_id],
        )?;
        refresh_binding_projection_tx(&tx, &model_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Active bindings for a model joined with their profiles, in the
    /// deterministic resolver order.
    pub fn list_active_bindings(
        &self,
        model_id: &str,
        backend_key: Option<&str>,
    ) -> Result<Vec<ResolvedBindingRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT b.binding_id, b.model_id, b.profile_id, b.profile_version,
                    b.binding_kind, b.backend_key, b.platform_selector, b.priority, b.status,
                    p.profile_hash, p.environment_kind, p.spec_json
             FROM model_dependency_bindings b
             LEFT JOIN dependency_profiles p
               ON p.profile_id = b.profile_id AND p.profile_version = b.profile_version
             WHERE b.model_id = ?1
               AND b.status = 'active'
               AND (?2 IS NULL OR b.backend_key IS NULL OR b.backend_key = ?2)
             ORDER BY {}",
            BINDING_ORDER
        ))?;

        let rows = stmt
            .query_map(params![model_id, backend_key], |row| {
                Ok(ResolvedBindingRow {
                    binding: DependencyBindingRecord {
                        binding_id: row.get(0)?,
                        model_id: row.get(1)?,
                        profile_id: row.get(2)?,
                        profile_version: row.get(3)?,
                        binding_kind: row.get(4)?,
                        backend_key: row.get(5)?,
                        platform_selector: row.get(6)?,
                        priority: row.get(7)?,
                        status: row.get(8)?,
                    },
                    profile_hash: row.get(9)?,
                    environment_kind: row.get(10)?,
                    spec_json: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Refresh the denormalized `dependency_bindings` projection for a model.
    pub fn refresh_binding_projection(&self, model_id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        refresh_binding_projection_tx(&tx, model_id)?;
        tx.commit()?;
        Ok(())
    }
}

/// Public wrapper used by `summarize` for repair-on-read.
pub(super) fn refresh_binding_projection(index: &ModelIndex, model_id: &str) -> Result<()> {
    index.refresh_binding_projection(model_id)
}

/// Current projection rows straight from the authoritative tables.
pub(super) fn binding_projection(
    index: &ModelIndex,
    model_id: &str,
) -> Result<Vec<BindingProjection>> {
    let conn = index.lock()?;
    projection_rows(&conn, model_id)
}

fn projection_rows(conn: &Connection, model_id: &str) -> Result<Vec<BindingProjection>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT binding_id, profile_id, profile_version, binding_kind,
                backend_key, platform_selector, priority, status
         FROM model_dependency_bindings
         WHERE model_id = ?1 AND status = 'active'
         ORDER BY {}",
        BINDING_ORDER
    ))?;
    let rows = stmt
        .query_map(params![model_id], |row| {
            Ok(BindingProjection {
                binding_id: row.get(0)?,
                profile_id: row.get(1)?,
                profile_version: row.get(2)?,
                binding_kind: row.get(3)?,
                backend_key: row.get(4)?,
                platform_selector: row.get(5)?,
                priority: row.get(6)?,
                status: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Re-emit the projection inside an open transaction.
pub(super) fn refresh_binding_projection_tx(tx: &Connection, model_id: &str) -> Result<()> {
    let blob: Option<String> = tx
        .query_row(
            "SELECT metadata_blob FROM models WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(blob) = blob else {
        // Binding writes may precede the model row during import; the final
        // upsert emits the projection then.
        return Ok(());
    };

    let mut value: Value = serde_json::from_str(&blob)?;
    let projection = projection_rows(tx, model_id)?;
    value["dependency_bindings"] = serde_json::to_value(&projection)?;

    tx.execute(
        "UPDATE models SET metadata_blob = ?2 WHERE model_id = ?1",
        params![model_id, serde_json::to_string_pretty(&value)?],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::baseline;
    use super::*;
    use tempfile::TempDir;

    fn pinned_spec(name: &str, version: &str) -> String {
        serde_json::json!({
            "python_packages": [{"name": name, "version": version}]
        })
        .to_string()
    }

    fn binding(binding_id: &str, model_id: &str, profile_id: &str) -> DependencyBindingRecord {
        DependencyBindingRecord {
            binding_id: binding_id.to_string(),
            model_id: model_id.to_string(),
            profile_id: profile_id.to_string(),
            profile_version: 1,
            binding_kind: "required_core".to_string(),
            backend_key: Some("pytorch".to_string()),
            platform_selector: Some("linux-x86_64".to_string()),
            priority: 100,
            status: "active".to_string(),
        }
    }

    fn open_with_model() -> (TempDir, ModelIndex) {
        let tmp = TempDir::new().unwrap();
        let index = ModelIndex::open(tmp.path().join("models.db")).unwrap();
        index
            .upsert_model(&baseline("llm/llama/llama-2-7b", "llama-2-7b", "aa11"))
            .unwrap();
        (tmp, index)
    }

    #[test]
    fn profile_immutability() {
        let (_tmp, index) = open_with_model();

        let first = index
            .upsert_dependency_profile("torch-core", 1, "python-venv", &pinned_spec("torch", "==2.5.1"))
            .unwrap();

        // Same content (different key order still canonicalizes equal): no-op.
        let again = index
            .upsert_dependency_profile("torch-core", 1, "python-venv", &pinned_spec("torch", "==2.5.1"))
            .unwrap();
        assert_eq!(first.profile_hash, again.profile_hash);

        // Different content fails closed.
        let err = index.upsert_dependency_profile(
            "torch-core",
            1,
            "python-venv",
            &pinned_spec("torch", "==2.6.0"),
        );
        assert!(matches!(err, Err(LibraryError::ProfileImmutable { .. })));
    }

    #[test]
    fn binding_requires_existing_profile() {
        let (_tmp, index) = open_with_model();
        let err = index.attach_dependency_binding(&binding("b1", "llm/llama/llama-2-7b", "ghost"));
        assert!(matches!(err, Err(LibraryError::Validation { .. })));
    }

    #[test]
    fn projection_refreshes_on_binding_writes() {
        let (_tmp, index) = open_with_model();
        let model_id = "llm/llama/llama-2-7b";
        index
            .upsert_dependency_profile("torch-core", 1, "python-venv", &pinned_spec("torch", "==2.5.1"))
            .unwrap();
        index
            .attach_dependency_binding(&binding("b1", model_id, "torch-core"))
            .unwrap();

        let blob = index.get_model_blob(model_id).unwrap().unwrap();
        let projected: Vec<BindingProjection> =
            serde_json::from_value(blob["dependency_bindings"].clone()).unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].binding_id, "b1");

        index.deprecate_dependency_binding("b1").unwrap();
        let blob = index.get_model_blob(model_id).unwrap().unwrap();
        let projected: Vec<BindingProjection> =
            serde_json::from_value(blob["dependency_bindings"].clone()).unwrap();
        assert!(projected.is_empty());
    }

    #[test]
    fn stale_projection_repairs_on_read() {
        let (_tmp, index) = open_with_model();
        let model_id = "llm/llama/llama-2-7b";
        index
            .upsert_dependency_profile("torch-core", 1, "python-venv", &pinned_spec("torch", "==2.5.1"))
            .unwrap();
        index
            .attach_dependency_binding(&binding("b1", model_id, "torch-core"))
            .unwrap();

        // Corrupt the projection behind the API's back.
        {
            let conn = index.lock().unwrap();
            conn.execute(
                "UPDATE models SET metadata_blob = json_set(metadata_blob, '$.dependency_bindings', json('[]'))
                 WHERE model_id = ?1",
                params![model_id],
            )
            .unwrap();
        }

        let summary = index.summarize(model_id).unwrap();
        assert_eq!(summary.dependency_bindings.len(), 1);

        let blob = index.get_model_blob(model_id).unwrap().unwrap();
        let repaired: Vec<BindingProjection> =
            serde_json::from_value(blob["dependency_bindings"].clone()).unwrap();
        assert_eq!(repaired.len(), 1);
    }

    #[test]
    fn bindings_are_listed_deterministically() {
        let (_tmp, index) = open_with_model();
        let model_id = "llm/llama/llama-2-7b";
        index
            .upsert_dependency_profile("torch-core", 1, "python-venv", &pinned_spec("torch", "==2.5.1"))
            .unwrap();

        let mut b2 = binding("b2", model_id, "torch-core");
        b2.binding_kind = "optional_feature".to_string();
        index.attach_dependency_binding(&b2).unwrap();
        index
            .attach_dependency_binding(&binding("b1", model_id, "torch-core"))
            .unwrap();

        let rows = index.list_active_bindings(model_id, None).unwrap();
        // Lexicographic on binding_kind: optional_feature < required_core.
        assert_eq!(rows[0].binding.binding_id, "b2");
        assert_eq!(rows[1].binding.binding_id, "b1");
    }
}
