//! SQLite-backed HuggingFace search cache.
//!
//! Lives at `shared-resources/cache/search.sqlite`. Search rows carry a 24h
//! TTL; repo-detail rows additionally track the upstream `last_modified`
//! stamp so stale entries can be invalidated against a live result instead
//! of being served blindly.

use crate::config::NetworkConfig;
use crate::error::{LibraryError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Cache statistics for diagnostics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchCacheStats {
    pub search_rows: u64,
    pub repo_rows: u64,
}

/// One cached search hit.
#[derive(Debug, Clone)]
pub struct CachedSearch {
    pub results: Value,
    pub age: Duration,
}

/// One cached repository-details row.
#[derive(Debug, Clone)]
pub struct CachedRepo {
    pub repo_id: String,
    pub details: Value,
    pub last_modified: Option<String>,
    pub age: Duration,
}

/// SQLite search cache with TTL and `last_modified` invalidation.
pub struct SearchCache {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SearchCache {
    /// Open or create the cache database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_ttl(db_path, NetworkConfig::SEARCH_CACHE_TTL)
    }

    pub fn open_with_ttl(db_path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
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

            CREATE TABLE IF NOT EXISTS search_cache (
              query_key TEXT PRIMARY KEY,
              results_json TEXT NOT NULL CHECK (json_valid(results_json)),
              cached_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repo_details (
              repo_id TEXT PRIMARY KEY,
              details_json TEXT NOT NULL CHECK (json_valid(details_json)),
              last_modified TEXT,
              cached_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LibraryError::Index {
            message: "Failed to acquire search cache lock".to_string(),
            source: None,
        })
    }

    /// Canonical cache key for a search.
    pub fn query_key(query: &str, kind: Option<&str>) -> String {
        format!(
            "{}|{}",
            query.trim().to_lowercase(),
            kind.map(|k| k.trim().to_lowercase()).unwrap_or_default()
        )
    }

    /// Fetch a cached search. Expired entries are reported with their age so
    /// the caller can decide between refresh and stale-serving (offline).
    pub fn get_search(&self, query_key: &str) -> Result<Option<CachedSearch>> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT results_json, cached_at FROM search_cache WHERE query_key = ?1",
                params![query_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(json, cached_at)| {
            Ok(CachedSearch {
                results: serde_json::from_str(&json)?,
                age: age_from_epoch(cached_at),
            })
        })
        .transpose()
    }

    /// Whether a cached search is still fresh under the TTL.
    pub fn is_fresh(&self, cached: &CachedSearch) -> bool {
        cached.age < self.ttl
    }

    pub fn put_search(&self, query_key: &str, results: &Value) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO search_cache (query_key, results_json, cached_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(query_key) DO UPDATE SET
                 results_json=excluded.results_json,
                 cached_at=excluded.cached_at",
            params![query_key, serde_json::to_string(results)?, epoch_now()],
        )?;
        debug!("Cached search results for {}", query_key);
        Ok(())
    }

    pub fn get_repo(&self, repo_id: &str) -> Result<Option<CachedRepo>> {
        let conn = self.lock()?;
        let row: Option<(String, Option<String>, i64)> = conn
            .query_row(
                "SELECT details_json, last_modified, cached_at FROM repo_details WHERE repo_id = ?1",
                params![repo_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(json, last_modified, cached_at)| {
            Ok(CachedRepo {
                repo_id: repo_id.to_string(),
                details: serde_json::from_str(&json)?,
                last_modified,
                age: age_from_epoch(cached_at),
            })
        })
        .transpose()
    }

    pub fn put_repo(&self, repo_id: &str, details: &Value, last_modified: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO repo_details (repo_id, details_json, last_modified, cached_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id) DO UPDATE SET
                 details_json=excluded.details_json,
                 last_modified=excluded.last_modified,
                 cached_at=excluded.cached_at",
            params![
                repo_id,
                serde_json::to_string(details)?,
                last_modified,
                epoch_now()
            ],
        )?;
        Ok(())
    }

    /// Decide whether a stale repo row may be reused against a live
    /// `last_modified` stamp.
    ///
    /// A stale row with an unchanged stamp is revalidated (its clock resets);
    /// a changed stamp invalidates it.
    pub fn revalidate_repo(&self, repo_id: &str, live_last_modified: Option<&str>) -> Result<bool> {
        let Some(cached) = self.get_repo(repo_id)? else {
            return Ok(false);
        };
        if cached.age < self.ttl {
            return Ok(true);
        }
        match (cached.last_modified.as_deref(), live_last_modified) {
            (Some(cached_stamp), Some(live_stamp)) if cached_stamp == live_stamp => {
                let conn = self.lock()?;
                conn.execute(
                    "UPDATE repo_details SET cached_at = ?2 WHERE repo_id = ?1",
                    params![repo_id, epoch_now()],
                )?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Repo ids currently cached, for the background refresher.
    pub fn cached_repo_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT repo_id FROM repo_details ORDER BY repo_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> Result<SearchCacheStats> {
        let conn = self.lock()?;
        let search_rows: u64 =
            conn.query_row("SELECT COUNT(*) FROM search_cache", [], |row| row.get(0))?;
        let repo_rows: u64 =
            conn.query_row("SELECT COUNT(*) FROM repo_details", [], |row| row.get(0))?;
        Ok(SearchCacheStats {
            search_rows,
            repo_rows,
        })
    }
}

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn age_from_epoch(cached_at: i64) -> Duration {
    let age_secs = (chrono::Utc::now().timestamp() - cached_at).max(0);
    Duration::from_secs(age_secs as u64)
}
