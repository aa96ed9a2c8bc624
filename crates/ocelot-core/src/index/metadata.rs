//! Baseline snapshots, metadata overlays, and the append-only history log.
//!
//! Baselines are immutable (enforced by a pre-update abort trigger); edits
//! append overlays. At most one overlay is `active` per model (partial unique
//! index); supersession and the creation of the replacement happen in one
//! transaction.

use super::ModelIndex;
use crate::error::{LibraryError, Result};
use crate::overlay::{compose_patches, merge_patch};
use crate::types::BaselineMetadata;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One overlay row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OverlayRecord {
    pub overlay_id: String,
    pub model_id: String,
    pub overlay_json: Value,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: String,
    pub created_by: String,
}

/// Baseline + overlay view returned by metadata reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EffectiveMetadata {
    pub baseline: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_overlay: Option<OverlayRecord>,
    pub effective_metadata: Value,
}

/// Record the immutable baseline snapshot inside an open transaction.
///
/// Re-imports that genuinely change content (a completing shard set) replace
/// the snapshot wholesale; the update trigger still blocks in-place edits.
pub(super) fn record_baseline_tx(tx: &Connection, baseline: &BaselineMetadata) -> Result<()> {
    let baseline_json = serde_json::to_string_pretty(&serde_json::to_value(baseline)?)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT baseline_json FROM model_metadata_baselines WHERE model_id = ?1",
            params![baseline.model_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(current) if current == baseline_json => Ok(()),
        Some(_) => {
            tx.execute(
                "DELETE FROM model_metadata_baselines WHERE model_id = ?1",
                params![baseline.model_id],
            )?;
            insert_baseline_row(tx, baseline, &baseline_json, "reimport")
        }
        None => insert_baseline_row(tx, baseline, &baseline_json, "import"),
    }
}

fn insert_baseline_row(
    tx: &Connection,
    baseline: &BaselineMetadata,
    baseline_json: &str,
    reason: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO model_metadata_baselines (model_id, schema_version, baseline_json)
         VALUES (?1, ?2, ?3)",
        params![baseline.model_id, baseline.schema_version, baseline_json],
    )?;
    tx.execute(
        "INSERT INTO model_metadata_history (model_id, actor, action, new_value_json, reason)
         VALUES (?1, 'ocelot-library', 'baseline_created', ?2, ?3)",
        params![baseline.model_id, baseline_json, reason],
    )?;
    Ok(())
}

/// Fetch the active overlay for a model, if any.
pub(super) fn active_overlay(index: &ModelIndex, model_id: &str) -> Result<Option<OverlayRecord>> {
    let conn = index.lock()?;
    active_overlay_conn(&conn, model_id)
}

fn active_overlay_conn(conn: &Connection, model_id: &str) -> Result<Option<OverlayRecord>> {
    let row = conn
        .query_row(
            "SELECT overlay_id, model_id, overlay_json, status, reason, created_at, created_by
             FROM model_metadata_overlays
             WHERE model_id = ?1 AND status = 'active'",
            params![model_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(overlay_id, model_id, overlay_json, status, reason, created_at, created_by)| {
            Ok(OverlayRecord {
                overlay_id,
                model_id,
                overlay_json: serde_json::from_str(&overlay_json)?,
                status,
                reason,
                created_at,
                created_by,
            })
        },
    )
    .transpose()
}

impl ModelIndex {
    /// Submit a metadata review patch, producing the new active overlay.
    ///
    /// The previous active overlay (if any) is superseded in the same
    /// transaction; its content is composed into the new overlay so the edit
    /// history accumulates rather than resets.
    pub fn submit_overlay(
        &self,
        model_id: &str,
        patch: &Value,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<OverlayRecord> {
        if !patch.is_object() {
            return Err(LibraryError::Validation {
                field: "patch".to_string(),
                message: "overlay patch must be a JSON object".to_string(),
            });
        }
        if !self.contains_model(model_id)? {
            return Err(LibraryError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = active_overlay_conn(&tx, model_id)?;
        let overlay_json = match previous {
            Some(ref prev) => {
                tx.execute(
                    "UPDATE model_metadata_overlays SET status = 'superseded'
                     WHERE overlay_id = ?1",
                    params![prev.overlay_id],
                )?;
                tx.execute(
                    "INSERT INTO model_metadata_history
                         (model_id, overlay_id, actor, action, old_value_json, reason)
                     VALUES (?1, ?2, ?3, 'overlay_superseded', ?4, ?5)",
                    params![
                        model_id,
                        prev.overlay_id,
                        reviewer,
                        serde_json::to_string(&prev.overlay_json)?,
                        reason,
                    ],
                )?;
                compose_patches(&prev.overlay_json, patch)
            }
            None => patch.clone(),
        };

        let overlay_id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO model_metadata_overlays
                 (overlay_id, model_id, overlay_json, status, reason, created_at, created_by)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
            params![
                overlay_id,
                model_id,
                serde_json::to_string(&overlay_json)?,
                reason,
                created_at,
                reviewer,
            ],
        )?;
        tx.execute(
            "INSERT INTO model_metadata_history
                 (model_id, overlay_id, actor, action, new_value_json, reason)
             VALUES (?1, ?2, ?3, 'overlay_created', ?4, ?5)",
            params![
                model_id,
                overlay_id,
                reviewer,
                serde_json::to_string(&overlay_json)?,
                reason,
            ],
        )?;
        tx.commit()?;

        debug!("Overlay {} now active for {}", overlay_id, model_id);
        Ok(OverlayRecord {
            overlay_id,
            model_id: model_id.to_string(),
            overlay_json,
            status: "active".to_string(),
            reason: reason.map(String::from),
            created_at,
            created_by: reviewer.to_string(),
        })
    }

    /// Revert the active overlay so the baseline becomes effective again.
    ///
    /// Returns `false` when there was nothing to revert.
    pub fn revert_overlay(
        &self,
        model_id: &str,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(active) = active_overlay_conn(&tx, model_id)? else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE model_metadata_overlays SET status = 'reverted' WHERE overlay_id = ?1",
            params![active.overlay_id],
        )?;
        tx.execute(
            "INSERT INTO model_metadata_history
                 (model_id, overlay_id, actor, action, old_value_json, reason)
             VALUES (?1, ?2, ?3, 'overlay_reverted', ?4, ?5)",
            params![
                model_id,
                active.overlay_id,
                reviewer,
                serde_json::to_string(&active.overlay_json)?,
                reason,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Baseline, active overlay, and the merged effective document.
    pub fn effective_metadata(&self, model_id: &str) -> Result<EffectiveMetadata> {
        let baseline: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT baseline_json FROM model_metadata_baselines WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let baseline: Value = match baseline {
            Some(json) => serde_json::from_str(&json)?,
            None => {
                return Err(LibraryError::ModelNotFound {
                    model_id: model_id.to_string(),
                })
            }
        };

        let overlay = active_overlay(self, model_id)?;
        let effective = match overlay {
            Some(ref record) => merge_patch(&baseline, &record.overlay_json),
            None => baseline.clone(),
        };

        Ok(EffectiveMetadata {
            baseline,
            active_overlay: overlay,
            effective_metadata: effective,
        })
    }

    /// Models whose effective metadata is flagged for review.
    pub fn models_needing_review(&self, model_type: Option<&str>) -> Result<Vec<super::ModelSummary>> {
        let mut flagged = Vec::new();
        for model_id in self.all_model_ids()? {
            let summary = self.summarize(&model_id)?;
            if !summary.metadata_needs_review {
                continue;
            }
            if let Some(model_type) = model_type {
                if summary.model_type != model_type {
                    continue;
                }
            }
            flagged.push(summary);
        }
        Ok(flagged)
    }

    /// Count overlays per status for a model (diagnostics and tests).
    pub fn overlay_status_counts(&self, model_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM model_metadata_overlays
             WHERE model_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map(params![model_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}
