// crates/ncp-server/src/config/profiles.rs
// Profile Store - persistent mapping from profile name to downstream server definitions

use crate::error::{NcpError, Result};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The profile whose server set is the union of every other profile.
pub const ALL_PROFILE: &str = "all";

/// Authentication for an HTTP downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    None,
    Bearer {
        /// Environment variable holding the token. Preferred over `token`
        /// so profiles stay free of secrets.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env_var: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
    Oauth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// A downstream server definition. Immutable once added; replacing a server
/// means removing and re-adding it, which changes its hash and invalidates
/// its cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum ServerDefinition {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
    },
}

impl ServerDefinition {
    pub fn transport_kind(&self) -> &'static str {
        match self {
            ServerDefinition::Stdio { .. } => "stdio",
            ServerDefinition::Http { .. } => "http",
        }
    }

    /// Reject obviously unusable definitions before they reach a connect
    /// attempt (empty command or URL, non-absolute URL scheme).
    pub fn validate(&self) -> Result<()> {
        match self {
            ServerDefinition::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(NcpError::ValidationFailed(
                        "stdio server requires a non-empty command".into(),
                    ));
                }
            }
            ServerDefinition::Http { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(NcpError::ValidationFailed(format!(
                        "http server requires an http(s) URL, got {:?}",
                        url
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Stable digest of a definition's immutable fields; the tool cache key.
pub fn definition_hash(name: &str, def: &ServerDefinition) -> String {
    // serde_json maps are key-sorted, so this serialization is canonical.
    let canonical = serde_json::json!({ "name": name, "definition": def });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// One `profiles/<name>.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerDefinition>,
    pub metadata: ProfileMetadata,
}

impl ProfileDocument {
    fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            description: String::new(),
            mcp_servers: BTreeMap::new(),
            metadata: ProfileMetadata {
                created: now,
                modified: now,
            },
        }
    }
}

/// Persistent profile storage under `<configDir>/profiles/`.
///
/// All documents are buffered in memory after the initial load; reads never
/// touch disk. Writes go through a single writer lock and land atomically.
pub struct ProfileStore {
    dir: PathBuf,
    profiles: RwLock<HashMap<String, ProfileDocument>>,
}

impl ProfileStore {
    /// Load every profile document from `dir`, skipping corrupt files.
    pub fn load(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut profiles = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(NcpError::from)
                .and_then(|s| serde_json::from_str::<ProfileDocument>(&s).map_err(NcpError::from))
            {
                Ok(doc) => {
                    debug!(profile = %doc.name, servers = doc.mcp_servers.len(), "Loaded profile");
                    profiles.insert(doc.name.clone(), doc);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable profile file");
                }
            }
        }

        info!(count = profiles.len(), "Profile store loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            profiles: RwLock::new(profiles),
        })
    }

    /// Names of the stored profile documents (the virtual `all` is not listed
    /// unless a document for it exists).
    pub async fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` resolves to a profile. The `all` profile always does.
    pub async fn exists(&self, name: &str) -> bool {
        name == ALL_PROFILE || self.profiles.read().await.contains_key(name)
    }

    /// Resolve the server set for a profile.
    ///
    /// For `all`, this unions the stored `all` document (if any) with every
    /// other profile's entries; on name collisions the first entry wins, in
    /// stored-`all`-first then alphabetical-profile order.
    pub async fn servers(&self, profile: &str) -> Result<BTreeMap<String, ServerDefinition>> {
        let profiles = self.profiles.read().await;

        if profile == ALL_PROFILE {
            let mut union = profiles
                .get(ALL_PROFILE)
                .map(|doc| doc.mcp_servers.clone())
                .unwrap_or_default();
            let mut names: Vec<&String> =
                profiles.keys().filter(|n| n.as_str() != ALL_PROFILE).collect();
            names.sort();
            for name in names {
                for (server, def) in &profiles[name].mcp_servers {
                    union.entry(server.clone()).or_insert_with(|| def.clone());
                }
            }
            return Ok(union);
        }

        profiles
            .get(profile)
            .map(|doc| doc.mcp_servers.clone())
            .ok_or_else(|| NcpError::ProfileNotFound(profile.to_string()))
    }

    /// Add a server to a profile, creating the profile document on demand.
    /// Fails with `Duplicate` if the name already resolves in that profile.
    pub async fn add_server(
        &self,
        profile: &str,
        server_name: &str,
        def: ServerDefinition,
    ) -> Result<()> {
        def.validate()?;
        if server_name.trim().is_empty() {
            return Err(NcpError::ValidationFailed("server name must not be empty".into()));
        }

        // Duplicate check against the resolved view, so an `all` write cannot
        // shadow an entry contributed by another profile.
        if self.servers(profile).await.unwrap_or_default().contains_key(server_name) {
            return Err(NcpError::Duplicate(format!(
                "server '{}' already exists in profile '{}'",
                server_name, profile
            )));
        }

        let mut profiles = self.profiles.write().await;
        let doc = profiles
            .entry(profile.to_string())
            .or_insert_with(|| ProfileDocument::new(profile));
        doc.mcp_servers.insert(server_name.to_string(), def);
        doc.metadata.modified = Utc::now();
        self.persist(doc)?;
        info!(profile = %profile, server = %server_name, "Server added to profile");
        Ok(())
    }

    /// Remove a server from a profile. Removing via `all` removes the entry
    /// from every document that carries it, so no profile entry survives.
    pub async fn remove_server(&self, profile: &str, server_name: &str) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        let mut removed = false;

        if profile == ALL_PROFILE {
            let names: Vec<String> = profiles.keys().cloned().collect();
            for name in names {
                let doc = match profiles.get_mut(&name) {
                    Some(doc) => doc,
                    None => continue,
                };
                if doc.mcp_servers.remove(server_name).is_some() {
                    doc.metadata.modified = Utc::now();
                    self.persist(doc)?;
                    removed = true;
                }
            }
        } else if let Some(doc) = profiles.get_mut(profile) {
            if doc.mcp_servers.remove(server_name).is_some() {
                doc.metadata.modified = Utc::now();
                self.persist(doc)?;
                removed = true;
            }
        } else {
            return Err(NcpError::ProfileNotFound(profile.to_string()));
        }

        if !removed {
            return Err(NcpError::NotFound(format!(
                "server '{}' not found in profile '{}'",
                server_name, profile
            )));
        }
        info!(profile = %profile, server = %server_name, "Server removed from profile");
        Ok(())
    }

    /// Serialize the whole store for the state manager's snapshots.
    pub async fn capture_state(&self) -> serde_json::Value {
        let profiles = self.profiles.read().await;
        serde_json::to_value(&*profiles).unwrap_or_default()
    }

    /// Replace the store (memory and disk) with a previously captured state.
    pub async fn restore_state(&self, snapshot: serde_json::Value) -> Result<()> {
        let restored: HashMap<String, ProfileDocument> = serde_json::from_value(snapshot)?;
        let mut profiles = self.profiles.write().await;

        // Delete files for profiles that did not exist in the snapshot.
        for name in profiles.keys() {
            if !restored.contains_key(name) {
                let _ = std::fs::remove_file(self.path_for(name));
            }
        }
        for doc in restored.values() {
            self.persist(doc)?;
        }
        *profiles = restored;
        Ok(())
    }

    /// Serialized form of one profile document, as written to disk.
    pub async fn serialized(&self, profile: &str) -> Option<String> {
        let profiles = self.profiles.read().await;
        profiles
            .get(profile)
            .and_then(|doc| serde_json::to_string_pretty(doc).ok())
    }

    fn path_for(&self, profile: &str) -> PathBuf {
        self.dir.join(format!("{}.json", profile))
    }

    fn persist(&self, doc: &ProfileDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;
        write_atomic(&self.path_for(&doc.name), json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_def(command: &str) -> ServerDefinition {
        ServerDefinition::Stdio {
            command: command.to_string(),
            args: vec!["--stdio".into()],
            env: BTreeMap::new(),
        }
    }

    async fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_serialization() {
        let (_dir, store) = store().await;
        store.add_server("dev", "git", stdio_def("git-mcp")).await.unwrap();

        let before = store.serialized("dev").await.unwrap();
        store.add_server("dev", "web", stdio_def("web-mcp")).await.unwrap();
        store.remove_server("dev", "web").await.unwrap();
        let after = store.serialized("dev").await.unwrap();

        // Byte-for-byte modulo the modified timestamp.
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.contains("\"modified\""))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip(&before), strip(&after));
    }

    #[tokio::test]
    async fn test_duplicate_server_rejected() {
        let (_dir, store) = store().await;
        store.add_server("dev", "git", stdio_def("git-mcp")).await.unwrap();
        let err = store.add_server("dev", "git", stdio_def("other")).await.unwrap_err();
        assert_eq!(err.kind(), "Duplicate");
    }

    #[tokio::test]
    async fn test_all_profile_unions_other_profiles() {
        let (_dir, store) = store().await;
        store.add_server("work", "jira", stdio_def("jira-mcp")).await.unwrap();
        store.add_server("home", "music", stdio_def("music-mcp")).await.unwrap();

        let union = store.servers(ALL_PROFILE).await.unwrap();
        assert!(union.contains_key("jira"));
        assert!(union.contains_key("music"));

        // A direct write to `all` is stored and still visible in the union.
        store.add_server(ALL_PROFILE, "shared", stdio_def("shared-mcp")).await.unwrap();
        let union = store.servers(ALL_PROFILE).await.unwrap();
        assert!(union.contains_key("shared"));
        assert_eq!(union.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_via_all_clears_every_document() {
        let (_dir, store) = store().await;
        store.add_server("work", "git", stdio_def("git-mcp")).await.unwrap();
        store.remove_server(ALL_PROFILE, "git").await.unwrap();
        assert!(store.servers("work").await.unwrap().is_empty());
        let err = store.remove_server(ALL_PROFILE, "git").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_unknown_profile_is_profile_not_found() {
        let (_dir, store) = store().await;
        let err = store.servers("nope").await.unwrap_err();
        assert_eq!(err.kind(), "ProfileNotFound");
    }

    #[tokio::test]
    async fn test_store_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ProfileStore::load(dir.path()).unwrap();
            store.add_server("dev", "git", stdio_def("git-mcp")).await.unwrap();
        }
        let reloaded = ProfileStore::load(dir.path()).unwrap();
        let servers = reloaded.servers("dev").await.unwrap();
        assert!(servers.contains_key("git"));
    }

    #[tokio::test]
    async fn test_restore_state_round_trip() {
        let (_dir, store) = store().await;
        store.add_server("dev", "git", stdio_def("git-mcp")).await.unwrap();
        let snapshot = store.capture_state().await;

        store.add_server("dev", "web", stdio_def("web-mcp")).await.unwrap();
        store.restore_state(snapshot).await.unwrap();

        let servers = store.servers("dev").await.unwrap();
        assert!(servers.contains_key("git"));
        assert!(!servers.contains_key("web"));
    }

    #[test]
    fn test_definition_hash_is_stable_and_sensitive() {
        let a = definition_hash("git", &stdio_def("git-mcp"));
        let b = definition_hash("git", &stdio_def("git-mcp"));
        let c = definition_hash("git", &stdio_def("other-mcp"));
        let d = definition_hash("git2", &stdio_def("git-mcp"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_definition_validate() {
        assert!(stdio_def("git-mcp").validate().is_ok());
        assert!(stdio_def("  ").validate().is_err());
        let http = ServerDefinition::Http {
            url: "ftp://example.com".into(),
            auth: None,
        };
        assert_eq!(http.validate().unwrap_err().kind(), "ValidationFailed");
    }

    #[test]
    fn test_server_definition_wire_shape() {
        let json = r#"{
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-github"],
            "env": {"GITHUB_TOKEN": "x"}
        }"#;
        let def: ServerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.transport_kind(), "stdio");

        let json = r#"{"url": "https://mcp.example.com", "auth": {"type": "bearer", "token_env_var": "MCP_TOKEN"}}"#;
        let def: ServerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.transport_kind(), "http");
    }
}
