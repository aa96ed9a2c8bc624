//! HuggingFace API client: cached search, repo metadata, ranged file
//! streaming.
//!
//! Every outbound call passes the network gate (circuit breaker + rate-limit
//! blackout). When the gate is closed, cached rows are served instead and
//! the caller sees `offline_mode` through the health surface.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{LibraryError, Result};
use crate::hub::search_cache::SearchCache;
use crate::net::{is_connect_failure, NetworkGate, SourceCapability, WebSource};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// In-memory repo-details TTL (backed further by the SQLite cache).
const REPO_MEMORY_TTL: Duration = Duration::from_secs(5 * 60);

/// One downloadable file in a repository.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RepoFileInfo {
    pub filename: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// SHA-256 from LFS metadata, when the file is LFS-tracked
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Repository file listing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RepoFiles {
    pub repo_id: String,
    pub files: Vec<RepoFileInfo>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// HuggingFace client.
pub struct HfClient {
    http: reqwest::Client,
    gate: Arc<NetworkGate>,
    cache: Arc<SearchCache>,
    repo_memory: mini_moka::sync::Cache<String, RepoFiles>,
    api_base: String,
}

impl HfClient {
    pub fn new(http: reqwest::Client, gate: Arc<NetworkGate>, cache: Arc<SearchCache>) -> Self {
        Self::with_base(http, gate, cache, NetworkConfig::HF_API_BASE.to_string())
    }

    pub fn with_base(
        http: reqwest::Client,
        gate: Arc<NetworkGate>,
        cache: Arc<SearchCache>,
        api_base: String,
    ) -> Self {
        Self {
            http,
            gate,
            cache,
            repo_memory: mini_moka::sync::Cache::builder()
                .time_to_live(REPO_MEMORY_TTL)
                .max_capacity(256)
                .build(),
            api_base,
        }
    }

    /// Search models, consulting the cache first (24h TTL).
    ///
    /// With the gate closed, stale cached rows are served rather than
    /// failing; a true miss propagates the gate error.
    pub async fn search_models(
        &self,
        query: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Value> {
        let key = SearchCache::query_key(query, kind);
        let cached = self.cache.get_search(&key)?;
        if let Some(ref hit) = cached {
            if self.cache.is_fresh(hit) {
                debug!("Search cache hit for {}", key);
                return Ok(hit.results.clone());
            }
        }

        if let Err(gate_err) = self.gate.ensure_allowed() {
            if let Some(hit) = cached {
                warn!("Serving stale search results for {} (offline)", key);
                return Ok(hit.results);
            }
            return Err(gate_err);
        }

        let mut url = format!(
            "{}/api/models?search={}&limit={}&full=true",
            self.api_base,
            urlencoding::encode(query.trim()),
            limit
        );
        if let Some(kind) = kind {
            url.push_str(&format!("&pipeline_tag={}", urlencoding::encode(kind)));
        }

        match self.get_json(&url).await {
            Ok(results) => {
                self.cache.put_search(&key, &results)?;
                Ok(results)
            }
            Err(e) => {
                if let Some(hit) = cached {
                    warn!("Search failed ({}); serving stale cache for {}", e, key);
                    return Ok(hit.results);
                }
                Err(e)
            }
        }
    }

    /// Repository file listing with LFS hashes.
    pub async fn repo_files(&self, repo_id: &str) -> Result<RepoFiles> {
        if let Some(hit) = self.repo_memory.get(&repo_id.to_string()) {
            return Ok(hit);
        }

        let cached = self.cache.get_repo(repo_id)?;
        if let Some(ref hit) = cached {
            if hit.age < NetworkConfig::SEARCH_CACHE_TTL {
                let files = parse_repo_files(repo_id, &hit.details)?;
                self.repo_memory.insert(repo_id.to_string(), files.clone());
                return Ok(files);
            }
        }

        if let Err(gate_err) = self.gate.ensure_allowed() {
            if let Some(hit) = cached {
                warn!("Serving stale repo details for {} (offline)", repo_id);
                return parse_repo_files(repo_id, &hit.details);
            }
            return Err(gate_err);
        }

        let url = format!("{}/api/models/{}?blobs=true", self.api_base, repo_id);
        let details = self.get_json(&url).await?;
        let last_modified = details
            .get("lastModified")
            .and_then(Value::as_str)
            .map(String::from);

        // Stale rows with an unchanged upstream stamp revalidate in place.
        if self
            .cache
            .revalidate_repo(repo_id, last_modified.as_deref())?
        {
            debug!("Repo details for {} revalidated", repo_id);
        }
        self.cache
            .put_repo(repo_id, &details, last_modified.as_deref())?;

        let files = parse_repo_files(repo_id, &details)?;
        self.repo_memory.insert(repo_id.to_string(), files.clone());
        Ok(files)
    }

    /// Stream one file to `dest`, resuming from its current length.
    ///
    /// Appends to `<dest>` directly (callers point this at a `.part` path and
    /// rename on completion). Yields per chunk; cancellation stops at the
    /// next chunk boundary. Returns the total bytes present afterwards.
    pub async fn download_file(
        &self,
        repo_id: &str,
        filename: &str,
        dest: &Path,
        mut on_progress: impl FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.gate.ensure_allowed()?;

        let resume_from = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        let url = format!(
            "{}/{}/resolve/main/{}",
            self.api_base, repo_id, filename
        );

        let mut request = self.http.get(&url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
            info!(
                "Resuming {}/{} from byte {}",
                repo_id, filename, resume_from
            );
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if is_connect_failure(&e) {
                    self.gate.note_connect_failure();
                }
                return Err(e.into());
            }
        };
        self.check_response_status(&response, &url)?;

        // A server ignoring the Range header restarts the payload.
        let mut written = if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            resume_from
        } else {
            0
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(written > 0)
            .truncate(written == 0)
            .write(true)
            .open(dest)
            .map_err(|e| LibraryError::io_with_path(e, dest))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            cancel.check()?;
            let chunk = chunk.map_err(|e| LibraryError::DownloadFailed {
                url: url.clone(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk)
                .map_err(|e| LibraryError::io_with_path(e, dest))?;
            written += chunk.len() as u64;
            on_progress(written);
        }

        file.sync_all()
            .map_err(|e| LibraryError::io_with_path(e, dest))?;
        self.gate.note_success();
        Ok(written)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                if is_connect_failure(&e) {
                    self.gate.note_connect_failure();
                }
                return Err(e.into());
            }
        };
        self.check_response_status(&response, url)?;
        let value = response.json::<Value>().await?;
        self.gate.note_success();
        Ok(value)
    }

    /// Map 429 to a blackout and non-success codes to network errors.
    fn check_response_status(&self, response: &reqwest::Response, url: &str) -> Result<()> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            self.gate.note_rate_limit(retry_after);
            return Err(LibraryError::RateLimited {
                service: "huggingface".to_string(),
                retry_after_secs: retry_after
                    .or(Some(NetworkConfig::RATE_LIMIT_BLACKOUT))
                    .map(|d| d.as_secs()),
            });
        }
        if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(LibraryError::Network {
                message: format!("{} returned HTTP {}", url, status),
                cause: None,
            });
        }
        Ok(())
    }
}

/// Pull the downloadable file list out of an HF model-details document.
fn parse_repo_files(repo_id: &str, details: &Value) -> Result<RepoFiles> {
    let siblings = details
        .get("siblings")
        .and_then(Value::as_array)
        .ok_or_else(|| LibraryError::Network {
            message: format!("repo details for {} carry no file list", repo_id),
            cause: None,
        })?;

    let mut files = Vec::new();
    for sibling in siblings {
        let Some(filename) = sibling.get("rfilename").and_then(Value::as_str) else {
            continue;
        };
        files.push(RepoFileInfo {
            filename: filename.to_string(),
            size_bytes: sibling.get("size").and_then(Value::as_u64),
            sha256: sibling
                .get("lfs")
                .and_then(|lfs| lfs.get("oid"))
                .and_then(Value::as_str)
                .map(|oid| oid.trim_start_matches("sha256:").to_string()),
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(RepoFiles {
        repo_id: repo_id.to_string(),
        files,
        last_modified: details
            .get("lastModified")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

#[async_trait]
impl WebSource for HfClient {
    fn id(&self) -> &'static str {
        "huggingface"
    }

    fn domains(&self) -> &[&'static str] {
        &["huggingface.co"]
    }

    fn capabilities(&self) -> &[SourceCapability] {
        &[
            SourceCapability::Search,
            SourceCapability::Metadata,
            SourceCapability::StreamFile,
        ]
    }

    async fn search(&self, query: &str, kind: Option<&str>, limit: usize) -> Result<Value> {
        self.search_models(query, kind, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn client_with_cache(tmp: &TempDir) -> (HfClient, Arc<SearchCache>) {
        let cache = Arc::new(SearchCache::open(tmp.path().join("search.sqlite")).unwrap());
        let gate = Arc::new(NetworkGate::new("huggingface", "huggingface.co"));
        let client = HfClient::with_base(
            crate::net::build_http_client().unwrap(),
            gate,
            Arc::clone(&cache),
            // Unroutable base: every network attempt fails fast in tests.
            "http://127.0.0.1:1".to_string(),
        );
        (client, cache)
    }

    #[test]
    fn parses_repo_file_listing() {
        let details = json!({
            "lastModified": "2025-03-01T00:00:00Z",
            "siblings": [
                {"rfilename": "model.gguf", "size": 1234,
                 "lfs": {"oid": "sha256:aabb", "size": 1234}},
                {"rfilename": "README.md"}
            ]
        });
        let files = parse_repo_files("org/model", &details).unwrap();
        assert_eq!(files.files.len(), 2);
        let weights = files.files.iter().find(|f| f.filename == "model.gguf").unwrap();
        assert_eq!(weights.sha256.as_deref(), Some("aabb"));
        assert_eq!(weights.size_bytes, Some(1234));
        assert_eq!(files.last_modified.as_deref(), Some("2025-03-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn fresh_cache_short_circuits_network() {
        let tmp = TempDir::new().unwrap();
        let (client, cache) = client_with_cache(&tmp);

        let key = SearchCache::query_key("llama", None);
        cache.put_search(&key, &json!([{"id": "org/llama"}])).unwrap();

        // The base URL is unroutable, so a hit proves no request went out.
        let results = client.search_models("llama", None, 10).await.unwrap();
        assert_eq!(results[0]["id"], "org/llama");
    }

    #[tokio::test]
    async fn search_capability_is_declared() {
        let tmp = TempDir::new().unwrap();
        let (client, _cache) = client_with_cache(&tmp);
        assert!(client.capabilities().contains(&SourceCapability::Search));
        assert!(client.capabilities().contains(&SourceCapability::StreamFile));
    }
}
