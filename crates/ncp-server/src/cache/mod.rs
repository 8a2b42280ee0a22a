// crates/ncp-server/src/cache/mod.rs
// Tool Cache - on-disk snapshots of each downstream server's advertised tools

use crate::error::{NcpError, Result};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use ncp_types::ToolRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One cached `tools/list` result, keyed by the definition hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// `H(def)` of the server definition this snapshot belongs to.
    pub hash: String,
    pub server_name: String,
    pub tools: Vec<ToolRecord>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_healthy: Option<DateTime<Utc>>,
}

/// Content-addressed cache under `<configDir>/cache/`.
///
/// One `<hash>.json` file per server plus `cache-index.json` mapping
/// `hash -> serverName`. Corrupt files are discarded with a warning and
/// treated as misses; the cache is never a source of fatal errors.
pub struct ToolCache {
    dir: PathBuf,
    index: RwLock<HashMap<String, String>>,
}

const INDEX_FILE: &str = "cache-index.json";

impl ToolCache {
    pub fn load(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let index_path = dir.join(INDEX_FILE);

        let index = match std::fs::read_to_string(&index_path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(index) => index,
                Err(e) => {
                    warn!(error = %e, "cache-index.json is corrupt; starting with an empty index");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        info!(entries = index.len(), "Tool cache loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    /// Look up a snapshot by definition hash. A corrupt entry is deleted
    /// and reported as a miss.
    pub async fn lookup(&self, hash: &str) -> Option<CacheEntry> {
        if !self.index.read().await.contains_key(hash) {
            return None;
        }
        let path = self.entry_path(hash);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&contents) {
            Ok(entry) if entry.hash == hash => Some(entry),
            Ok(entry) => {
                warn!(
                    server = %entry.server_name,
                    "Cache entry hash does not match its file name; discarding"
                );
                self.discard(hash).await;
                None
            }
            Err(e) => {
                warn!(hash = %hash, error = %NcpError::CacheCorrupt(e.to_string()), "Discarding cache entry");
                self.discard(hash).await;
                None
            }
        }
    }

    /// Store (or replace) a snapshot after a successful `tools/list`.
    pub async fn store(&self, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_string_pretty(entry)?;
        write_atomic(&self.entry_path(&entry.hash), json.as_bytes())?;

        let mut index = self.index.write().await;
        // A server whose definition changed gets a fresh hash; drop the
        // superseded entry so the index maps each server to one hash.
        let stale: Vec<String> = index
            .iter()
            .filter(|(h, name)| name.as_str() == entry.server_name && h.as_str() != entry.hash)
            .map(|(h, _)| h.clone())
            .collect();
        for hash in stale {
            index.remove(&hash);
            let _ = std::fs::remove_file(self.entry_path(&hash));
        }
        index.insert(entry.hash.clone(), entry.server_name.clone());
        self.persist_index(&index)?;
        debug!(server = %entry.server_name, tools = entry.tools.len(), "Cached tool snapshot");
        Ok(())
    }

    /// Record that a cached server was seen healthy, without replacing tools.
    pub async fn touch_healthy(&self, hash: &str) {
        if let Some(mut entry) = self.lookup(hash).await {
            entry.last_seen_healthy = Some(Utc::now());
            let _ = self.store(&entry).await;
        }
    }

    /// Drop every entry belonging to a server (used by `removeServer`).
    pub async fn invalidate_server(&self, server_name: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let hashes: Vec<String> = index
            .iter()
            .filter(|(_, name)| name.as_str() == server_name)
            .map(|(h, _)| h.clone())
            .collect();
        for hash in &hashes {
            index.remove(hash);
            let _ = std::fs::remove_file(self.entry_path(hash));
        }
        if !hashes.is_empty() {
            self.persist_index(&index)?;
            info!(server = %server_name, entries = hashes.len(), "Cache invalidated");
        }
        Ok(())
    }

    /// Drop a single entry by hash (used on `H(def)` mismatch at startup).
    pub async fn invalidate_hash(&self, hash: &str) -> Result<()> {
        let mut index = self.index.write().await;
        if index.remove(hash).is_some() {
            let _ = std::fs::remove_file(self.entry_path(hash));
            self.persist_index(&index)?;
        }
        Ok(())
    }

    /// Whether any entry exists for a server name.
    pub async fn contains_server(&self, server_name: &str) -> bool {
        self.index
            .read()
            .await
            .values()
            .any(|name| name == server_name)
    }

    async fn discard(&self, hash: &str) {
        let mut index = self.index.write().await;
        index.remove(hash);
        let _ = std::fs::remove_file(self.entry_path(hash));
        let _ = self.persist_index(&index);
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hash))
    }

    fn persist_index(&self, index: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, server: &str) -> CacheEntry {
        CacheEntry {
            hash: hash.to_string(),
            server_name: server.to_string(),
            tools: vec![ToolRecord {
                server_name: server.to_string(),
                tool_name: "do_thing".to_string(),
                description: "does the thing".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            captured_at: Utc::now(),
            last_seen_healthy: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::load(dir.path()).unwrap();
        cache.store(&entry("abc123", "git")).await.unwrap();

        let found = cache.lookup("abc123").await.unwrap();
        assert_eq!(found.server_name, "git");
        assert_eq!(found.tools.len(), 1);
        assert!(cache.lookup("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ToolCache::load(dir.path()).unwrap();
            cache.store(&entry("abc123", "git")).await.unwrap();
        }
        let cache = ToolCache::load(dir.path()).unwrap();
        assert!(cache.lookup("abc123").await.is_some());
        assert!(cache.contains_server("git").await);
    }

    #[tokio::test]
    async fn test_new_hash_supersedes_old_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::load(dir.path()).unwrap();
        cache.store(&entry("old-hash", "git")).await.unwrap();
        cache.store(&entry("new-hash", "git")).await.unwrap();

        assert!(cache.lookup("old-hash").await.is_none());
        assert!(cache.lookup("new-hash").await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::load(dir.path()).unwrap();
        cache.store(&entry("abc123", "git")).await.unwrap();

        std::fs::write(dir.path().join("abc123.json"), "{not json").unwrap();
        assert!(cache.lookup("abc123").await.is_none());
        // Discarded for good.
        assert!(!dir.path().join("abc123.json").exists());
    }

    #[tokio::test]
    async fn test_invalidate_server_removes_files_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::load(dir.path()).unwrap();
        cache.store(&entry("abc123", "git")).await.unwrap();
        cache.invalidate_server("git").await.unwrap();

        assert!(cache.lookup("abc123").await.is_none());
        assert!(!cache.contains_server("git").await);
        assert!(!dir.path().join("abc123.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "][").unwrap();
        let cache = ToolCache::load(dir.path()).unwrap();
        assert!(!cache.contains_server("git").await);
    }
}
