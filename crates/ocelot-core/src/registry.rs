//! Link registry: persistent record of every link the mapper materialized.
//!
//! Stored in its own SQLite database (`registry.db`) next to the index so
//! cascade delete and self-healing survive restarts independently of the
//! rebuildable model index.

use crate::error::{LibraryError, Result};
use crate::types::{LinkKind, LinkRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// SQLite-backed registry of materialized links.
pub struct LinkRegistry {
    conn: Mutex<Connection>,
}

impl LinkRegistry {
    /// Open or create the registry database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LibraryError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS link_records (
              link_id INTEGER PRIMARY KEY AUTOINCREMENT,
              model_id TEXT NOT NULL,
              source_canonical_path TEXT NOT NULL,
              target_app_path TEXT NOT NULL UNIQUE,
              link_kind TEXT NOT NULL
                CHECK (link_kind IN ('symlink_relative', 'symlink_absolute', 'hardlink')),
              app_id TEXT NOT NULL,
              version_tag TEXT,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_link_records_model
              ON link_records(model_id);
            CREATE INDEX IF NOT EXISTS idx_link_records_app
              ON link_records(app_id, version_tag);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LibraryError::Index {
            message: "Failed to acquire registry connection lock".to_string(),
            source: None,
        })
    }

    /// Record one materialized link. Upserts on target path.
    pub fn register(&self, record: &LinkRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO link_records (
                 model_id, source_canonical_path, target_app_path,
                 link_kind, app_id, version_tag, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(target_app_path) DO UPDATE SET
                 model_id=excluded.model_id,
                 source_canonical_path=excluded.source_canonical_path,
                 link_kind=excluded.link_kind,
                 app_id=excluded.app_id,
                 version_tag=excluded.version_tag,
                 created_at=excluded.created_at",
            params![
                record.model_id,
                path_str(&record.source_canonical_path),
                path_str(&record.target_app_path),
                record.link_kind.as_str(),
                record.app_id,
                record.version_tag,
                record.created_at,
            ],
        )?;
        debug!(
            "Registered {} link {} -> {}",
            record.link_kind.as_str(),
            record.source_canonical_path.display(),
            record.target_app_path.display()
        );
        Ok(())
    }

    /// Remove a record by target path, returning it if present.
    pub fn unregister(&self, target: &Path) -> Result<Option<LinkRecord>> {
        let conn = self.lock()?;
        let existing = conn
            .query_row(
                "SELECT model_id, source_canonical_path, target_app_path,
                        link_kind, app_id, version_tag, created_at
                 FROM link_records WHERE target_app_path = ?1",
                params![path_str(target)],
                row_to_record,
            )
            .optional()?;
        if existing.is_some() {
            conn.execute(
                "DELETE FROM link_records WHERE target_app_path = ?1",
                params![path_str(target)],
            )?;
        }
        Ok(existing)
    }

    /// Look up a record by target path.
    pub fn get_by_target(&self, target: &Path) -> Result<Option<LinkRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT model_id, source_canonical_path, target_app_path,
                        link_kind, app_id, version_tag, created_at
                 FROM link_records WHERE target_app_path = ?1",
                params![path_str(target)],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All records for one model, ordered by target path.
    pub fn records_for_model(&self, model_id: &str) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, source_canonical_path, target_app_path,
                    link_kind, app_id, version_tag, created_at
             FROM link_records WHERE model_id = ?1 ORDER BY target_app_path",
        )?;
        let records = stmt
            .query_map(params![model_id], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Delete every record for a model; returns the removed records.
    ///
    /// Used by cascade delete: callers unlink each returned target.
    pub fn remove_all_for_model(&self, model_id: &str) -> Result<Vec<LinkRecord>> {
        let records = self.records_for_model(model_id)?;
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM link_records WHERE model_id = ?1",
            params![model_id],
        )?;
        Ok(records)
    }

    /// Records filtered by app and optionally by version tag.
    pub fn records_for_app(
        &self,
        app_id: &str,
        version_tag: Option<&str>,
    ) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, source_canonical_path, target_app_path,
                    link_kind, app_id, version_tag, created_at
             FROM link_records
             WHERE app_id = ?1 AND (?2 IS NULL OR version_tag = ?2)
             ORDER BY target_app_path",
        )?;
        let records = stmt
            .query_map(params![app_id, version_tag], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every record in the registry, ordered by target path.
    pub fn all_records(&self) -> Result<Vec<LinkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT model_id, source_canonical_path, target_app_path,
                    link_kind, app_id, version_tag, created_at
             FROM link_records ORDER BY target_app_path",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: usize = conn.query_row("SELECT COUNT(*) FROM link_records", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LinkRecord> {
    let kind: String = row.get(3)?;
    Ok(LinkRecord {
        model_id: row.get(0)?,
        source_canonical_path: PathBuf::from(row.get::<_, String>(1)?),
        target_app_path: PathBuf::from(row.get::<_, String>(2)?),
        link_kind: kind.parse::<LinkKind>().unwrap_or(LinkKind::SymlinkAbsolute),
        app_id: row.get(4)?,
        version_tag: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(model_id: &str, target: &str) -> LinkRecord {
        LinkRecord {
            model_id: model_id.to_string(),
            source_canonical_path: PathBuf::from("/library/llm/llama/llama/model.gguf"),
            target_app_path: PathBuf::from(target),
            link_kind: LinkKind::SymlinkRelative,
            app_id: "comfyui".to_string(),
            version_tag: Some("0.6.0".to_string()),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let registry = LinkRegistry::open(tmp.path().join("registry.db")).unwrap();

        let rec = record("llm/llama/llama", "/app/models/model.gguf");
        registry.register(&rec).unwrap();

        let found = registry
            .get_by_target(Path::new("/app/models/model.gguf"))
            .unwrap();
        assert_eq!(found, Some(rec));
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[test]
    fn cascade_removal_returns_records() {
        let tmp = TempDir::new().unwrap();
        let registry = LinkRegistry::open(tmp.path().join("registry.db")).unwrap();

        for i in 0..3 {
            registry
                .register(&record("llm/llama/llama", &format!("/app/m{}.gguf", i)))
                .unwrap();
        }
        registry
            .register(&record("llm/qwen/qwen", "/app/other.gguf"))
            .unwrap();

        let removed = registry.remove_all_for_model("llm/llama/llama").unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[test]
    fn unregister_by_target() {
        let tmp = TempDir::new().unwrap();
        let registry = LinkRegistry::open(tmp.path().join("registry.db")).unwrap();
        registry
            .register(&record("llm/llama/llama", "/app/m.gguf"))
            .unwrap();

        let removed = registry.unregister(Path::new("/app/m.gguf")).unwrap();
        assert!(removed.is_some());
        assert_eq!(registry.count().unwrap(), 0);
        assert!(registry.unregister(Path::new("/app/m.gguf")).unwrap().is_none());
    }

    #[test]
    fn app_filter_respects_version() {
        let tmp = TempDir::new().unwrap();
        let registry = LinkRegistry::open(tmp.path().join("registry.db")).unwrap();

        let mut a = record("llm/llama/llama", "/app/a.gguf");
        a.version_tag = Some("0.5.0".to_string());
        let b = record("llm/llama/llama", "/app/b.gguf");
        registry.register(&a).unwrap();
        registry.register(&b).unwrap();

        assert_eq!(registry.records_for_app("comfyui", None).unwrap().len(), 2);
        assert_eq!(
            registry
                .records_for_app("comfyui", Some("0.6.0"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("registry.db");
        {
            let registry = LinkRegistry::open(&db).unwrap();
            registry
                .register(&record("llm/llama/llama", "/app/m.gguf"))
                .unwrap();
        }
        let registry = LinkRegistry::open(&db).unwrap();
        assert_eq!(registry.count().unwrap(), 1);
    }
}
