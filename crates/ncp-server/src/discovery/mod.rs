// crates/ncp-server/src/discovery/mod.rs
// Discovery Engine - ranked semantic queries over every known tool

pub mod index;

use chrono::{DateTime, Utc};
use index::{tokenize, Index, IndexedTool};
use ncp_types::{IndexingProgress, ServerHealth, ToolRecord};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default score floor for non-empty queries. Empty queries are listings
/// and ignore the threshold entirely.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.1;
/// Default page size.
pub const DEFAULT_LIMIT: usize = 20;
/// Usage boost saturates here so popularity never outranks relevance.
const USAGE_BOOST_CAP: f32 = 0.2;
/// Half-life, in days, for the recent-usage boost.
const USAGE_HALF_LIFE_DAYS: f64 = 7.0;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit: usize,
    /// 1-based page number.
    pub page: usize,
    pub confidence_threshold: Option<f32>,
    /// Restrict results to one server.
    pub mcp_filter: Option<String>,
    /// 0 = name+description, 1 = adds parameter names, 2+ = full schema.
    pub depth: u8,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            page: 1,
            confidence_threshold: None,
            mcp_filter: None,
            depth: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct ScoredTool {
    /// `server tool` form; also addressable as `server:tool`.
    pub name: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub confidence: f32,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct Pagination {
    pub page: usize,
    pub total_pages: usize,
    pub total_results: usize,
    pub results_in_page: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    pub tools: Vec<ScoredTool>,
    pub pagination: Pagination,
    /// Present while servers are still being indexed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing_progress: Option<IndexingProgress>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveryStats {
    pub total_tools: usize,
    pub total_servers: usize,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct UsageStat {
    count: f64,
    last_used: DateTime<Utc>,
}

#[derive(Default)]
struct ReindexFlags {
    running: bool,
    queued: bool,
}

/// In-memory index over all known tools.
///
/// The `tools_by_server` map is the source of truth; `index` is an immutable
/// snapshot swapped wholesale on every rebuild, so a query observes one
/// consistent index for its whole duration. Disabled servers are filtered at
/// query time, which is why enable/disable needs no rebuild.
pub struct DiscoveryEngine {
    tools_by_server: RwLock<HashMap<String, Vec<ToolRecord>>>,
    index: RwLock<Arc<Index>>,
    disabled: RwLock<HashSet<String>>,
    usage: RwLock<HashMap<String, UsageStat>>,
    reindex_flags: Mutex<ReindexFlags>,
    /// Servers expected in the active profile, for indexing progress.
    expected_servers: RwLock<usize>,
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryEngine {
    pub fn new() -> Self {
        Self {
            tools_by_server: RwLock::new(HashMap::new()),
            index: RwLock::new(Arc::new(Index::empty())),
            disabled: RwLock::new(HashSet::new()),
            usage: RwLock::new(HashMap::new()),
            reindex_flags: Mutex::new(ReindexFlags::default()),
            expected_servers: RwLock::new(0),
        }
    }

    /// Number of servers the active profile expects, for progress reporting.
    pub async fn set_expected_servers(&self, total: usize) {
        *self.expected_servers.write().await = total;
    }

    /// Full rebuild from a complete tool set.
    pub async fn index(&self, tools_by_server: HashMap<String, Vec<ToolRecord>>) {
        *self.tools_by_server.write().await = tools_by_server;
        self.rebuild_now().await;
    }

    /// Replace one server's tools atomically and refresh the snapshot.
    pub async fn upsert(&self, server_name: &str, tools: Vec<ToolRecord>) {
        self.tools_by_server
            .write()
            .await
            .insert(server_name.to_string(), tools);
        self.rebuild_now().await;
        debug!(server = %server_name, "Discovery index upserted");
    }

    /// Drop a server's tools entirely.
    pub async fn remove_server(&self, server_name: &str) {
        let removed = self
            .tools_by_server
            .write()
            .await
            .remove(server_name)
            .is_some();
        if removed {
            self.rebuild_now().await;
        }
        self.usage
            .write()
            .await
            .retain(|qualified, _| !qualified.starts_with(&format!("{} ", server_name)));
    }

    /// Exclude a server from queries without rebuilding.
    pub async fn set_mcp_disabled(&self, server_name: &str) {
        self.disabled.write().await.insert(server_name.to_string());
        info!(server = %server_name, "Server disabled in discovery");
    }

    pub async fn set_mcp_enabled(&self, server_name: &str) {
        self.disabled.write().await.remove(server_name);
        info!(server = %server_name, "Server enabled in discovery");
    }

    pub async fn is_disabled(&self, server_name: &str) -> bool {
        self.disabled.read().await.contains(server_name)
    }

    /// Serialize the enabled/disabled flags for state-manager snapshots.
    pub async fn disabled_snapshot(&self) -> serde_json::Value {
        let disabled = self.disabled.read().await;
        serde_json::to_value(disabled.iter().collect::<Vec<_>>()).unwrap_or_default()
    }

    pub async fn restore_disabled(&self, snapshot: serde_json::Value) -> crate::error::Result<()> {
        let restored: HashSet<String> = serde_json::from_value(snapshot)?;
        *self.disabled.write().await = restored;
        Ok(())
    }

    /// Coalesce rebuild requests: at most one rebuild in flight and one
    /// queued. A burst of K calls during a rebuild yields exactly one
    /// follow-up rebuild.
    pub fn trigger_background_reindex(self: &Arc<Self>) {
        {
            let mut flags = self.reindex_flags.lock().unwrap_or_else(|e| e.into_inner());
            if flags.running {
                flags.queued = true;
                return;
            }
            flags.running = true;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                engine.rebuild_now().await;
                let mut flags = engine
                    .reindex_flags
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if flags.queued {
                    flags.queued = false;
                    // Loop again: the queued request may cover upserts that
                    // landed mid-rebuild.
                } else {
                    flags.running = false;
                    break;
                }
            }
        });
    }

    /// Bump a tool's recent-usage counter (fed by successful `run`s).
    pub async fn record_usage(&self, qualified_name: &str) {
        let mut usage = self.usage.write().await;
        let stat = usage.entry(qualified_name.to_string()).or_insert(UsageStat {
            count: 0.0,
            last_used: Utc::now(),
        });
        stat.count = decayed_count(stat) + 1.0;
        stat.last_used = Utc::now();
    }

    /// Ranked, paginated query against the current snapshot.
    ///
    /// Never errors: an empty index yields an empty page, and while
    /// downstreams are still connecting the response carries
    /// `indexing_progress` instead of failing.
    pub async fn query(
        &self,
        query: &str,
        opts: &QueryOptions,
        health: &HashMap<String, ServerHealth>,
    ) -> QueryResponse {
        let index = self.index.read().await.clone();
        let disabled = self.disabled.read().await.clone();
        let usage = self.usage.read().await.clone();

        let query_tokens = tokenize(query);
        let is_listing = query_tokens.is_empty();
        let threshold = if is_listing {
            f32::MIN
        } else {
            opts.confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD)
        };

        let candidate_indices: Vec<usize> = if is_listing {
            (0..index.tools.len()).collect()
        } else {
            let mut set = HashSet::new();
            for token in &query_tokens {
                set.extend(index.candidates(token));
            }
            let mut v: Vec<usize> = set.into_iter().collect();
            v.sort_unstable();
            v
        };

        let mut scored: Vec<ScoredTool> = Vec::new();
        for i in candidate_indices {
            let tool = &index.tools[i];
            if disabled.contains(&tool.record.server_name) {
                continue;
            }
            if let Some(filter) = &opts.mcp_filter {
                if &tool.record.server_name != filter {
                    continue;
                }
            }
            let healthy = matches!(
                health.get(&tool.record.server_name).copied(),
                None | Some(ServerHealth::Healthy) | Some(ServerHealth::Degraded)
            );
            let confidence = if is_listing {
                1.0
            } else {
                score(tool, &query_tokens, healthy, usage.get(&tool.qualified))
            };
            if confidence < threshold {
                continue;
            }
            scored.push(self.scored_tool(tool, confidence, healthy, opts.depth));
        }

        // Highest score first; ties break lexicographically on the
        // fully-qualified name so pagination is stable.
        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        let total_results = scored.len();
        let limit = opts.limit;
        let page = opts.page.max(1);
        let total_pages = if limit == 0 {
            0
        } else {
            total_results.div_ceil(limit)
        };
        let tools: Vec<ScoredTool> = if limit == 0 {
            Vec::new()
        } else {
            scored
                .into_iter()
                .skip((page - 1) * limit)
                .take(limit)
                .collect()
        };

        QueryResponse {
            pagination: Pagination {
                page,
                total_pages,
                total_results,
                results_in_page: tools.len(),
            },
            tools,
            indexing_progress: self.progress_if_incomplete(&index).await,
        }
    }

    /// Resolve one tool record by `(server, tool)`.
    pub async fn resolve(&self, server_name: &str, tool_name: &str) -> Option<ToolRecord> {
        let index = self.index.read().await.clone();
        index
            .tools_of(server_name)
            .into_iter()
            .find(|t| t.record.tool_name == tool_name)
            .map(|t| t.record.clone())
    }

    /// All tool names currently indexed for a server.
    pub async fn tool_names_of(&self, server_name: &str) -> Vec<String> {
        let index = self.index.read().await.clone();
        index
            .tools_of(server_name)
            .into_iter()
            .map(|t| t.record.tool_name.clone())
            .collect()
    }

    pub async fn get_stats(&self) -> DiscoveryStats {
        let index = self.index.read().await.clone();
        DiscoveryStats {
            total_tools: index.tools.len(),
            total_servers: index.server_count(),
            indexed_at: index.built_at,
        }
    }

    async fn progress_if_incomplete(&self, index: &Index) -> Option<IndexingProgress> {
        let progress = IndexingProgress {
            current: index.server_count(),
            total: (*self.expected_servers.read().await).max(index.server_count()),
        };
        (!progress.is_complete()).then_some(progress)
    }

    async fn rebuild_now(&self) {
        let source = self.tools_by_server.read().await.clone();
        let rebuilt = Index::build(&source);
        debug!(
            tools = rebuilt.tools.len(),
            servers = rebuilt.server_count(),
            "Discovery index rebuilt"
        );
        *self.index.write().await = Arc::new(rebuilt);
    }

    fn scored_tool(
        &self,
        tool: &IndexedTool,
        confidence: f32,
        healthy: bool,
        depth: u8,
    ) -> ScoredTool {
        let parameters = (depth >= 1).then(|| {
            tool.record
                .input_schema
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default()
        });
        let input_schema = (depth >= 2).then(|| tool.record.input_schema.clone());

        ScoredTool {
            name: tool.qualified.clone(),
            server_name: tool.record.server_name.clone(),
            tool_name: tool.record.tool_name.clone(),
            description: tool.record.description.clone(),
            confidence,
            healthy,
            parameters,
            input_schema,
        }
    }
}

/// Ranking: token overlap over description/name/server, a bonus when the
/// tool name itself matches, a penalty for unhealthy servers, and a small
/// recency-decayed usage boost.
fn score(
    tool: &IndexedTool,
    query_tokens: &[String],
    healthy: bool,
    usage: Option<&UsageStat>,
) -> f32 {
    let matched = query_tokens
        .iter()
        .filter(|q| tool.tokens.iter().any(|t| t.starts_with(q.as_str())))
        .count();
    if matched == 0 {
        return 0.0;
    }
    let overlap = matched as f32 / query_tokens.len() as f32;

    let name_bonus = if query_tokens
        .iter()
        .any(|q| tool.name_tokens.iter().any(|t| t.starts_with(q.as_str())))
    {
        0.2
    } else {
        0.0
    };

    let base = (0.8 * overlap + name_bonus).min(1.0);
    let health_factor = if healthy { 1.0 } else { 0.5 };
    let boost = usage
        .map(|stat| (0.02 * decayed_count(stat) as f32).min(USAGE_BOOST_CAP))
        .unwrap_or(0.0);

    base * health_factor + boost
}

fn decayed_count(stat: &UsageStat) -> f64 {
    let age_days = (Utc::now() - stat.last_used).num_seconds().max(0) as f64 / 86_400.0;
    stat.count * 0.5f64.powf(age_days / USAGE_HALF_LIFE_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(server: &str, tool: &str, description: &str) -> ToolRecord {
        ToolRecord {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn engine_with_tools() -> Arc<DiscoveryEngine> {
        let engine = Arc::new(DiscoveryEngine::new());
        engine
            .upsert(
                "github",
                vec![
                    record("github", "create_issue", "Open a new issue in a repository"),
                    record("github", "merge_pr", "Merge a pull request"),
                ],
            )
            .await;
        engine
            .upsert(
                "files",
                vec![record("files", "read_file", "Read a file from disk")],
            )
            .await;
        engine
    }

    #[tokio::test]
    async fn test_empty_index_returns_empty_results() {
        let engine = DiscoveryEngine::new();
        let response = engine
            .query("anything", &QueryOptions::default(), &HashMap::new())
            .await;
        assert!(response.tools.is_empty());
        assert_eq!(response.pagination.total_results, 0);
    }

    #[tokio::test]
    async fn test_empty_query_lists_everything() {
        let engine = engine_with_tools().await;
        let response = engine
            .query("", &QueryOptions::default(), &HashMap::new())
            .await;
        assert_eq!(response.pagination.total_results, 3);
        // Listing scores are uniform, so ordering is lexicographic.
        assert_eq!(response.tools[0].name, "files read_file");
    }

    #[tokio::test]
    async fn test_ranked_query_prefers_name_matches() {
        let engine = engine_with_tools().await;
        let response = engine
            .query("issue", &QueryOptions::default(), &HashMap::new())
            .await;
        assert_eq!(response.tools[0].tool_name, "create_issue");
        assert!(response.tools[0].confidence > 0.5);
    }

    #[tokio::test]
    async fn test_unhealthy_servers_are_penalized() {
        let engine = engine_with_tools().await;
        let mut health = HashMap::new();
        health.insert("github".to_string(), ServerHealth::Unhealthy);

        let healthy_run = engine
            .query("issue", &QueryOptions::default(), &HashMap::new())
            .await;
        let unhealthy_run = engine.query("issue", &QueryOptions::default(), &health).await;

        assert!(unhealthy_run.tools[0].confidence < healthy_run.tools[0].confidence);
        assert!(!unhealthy_run.tools[0].healthy);
    }

    #[tokio::test]
    async fn test_usage_boost_breaks_score_ties() {
        let engine = Arc::new(DiscoveryEngine::new());
        engine
            .upsert(
                "a",
                vec![record("a", "search", "search the web for answers")],
            )
            .await;
        engine
            .upsert(
                "b",
                vec![record("b", "search", "search the web for answers")],
            )
            .await;

        engine.record_usage("b search").await;
        engine.record_usage("b search").await;

        let response = engine
            .query("search", &QueryOptions::default(), &HashMap::new())
            .await;
        assert_eq!(response.tools[0].name, "b search");
    }

    #[tokio::test]
    async fn test_mcp_filter_and_threshold() {
        let engine = engine_with_tools().await;
        let opts = QueryOptions {
            mcp_filter: Some("github".to_string()),
            ..Default::default()
        };
        let response = engine.query("", &opts, &HashMap::new()).await;
        assert_eq!(response.pagination.total_results, 2);

        let opts = QueryOptions {
            confidence_threshold: Some(0.99),
            ..Default::default()
        };
        let response = engine.query("merge", &opts, &HashMap::new()).await;
        assert!(response.tools.is_empty());
    }

    #[tokio::test]
    async fn test_limit_zero_returns_count_only() {
        let engine = engine_with_tools().await;
        let opts = QueryOptions {
            limit: 0,
            ..Default::default()
        };
        let response = engine.query("", &opts, &HashMap::new()).await;
        assert!(response.tools.is_empty());
        assert_eq!(response.pagination.total_results, 3);
        assert_eq!(response.pagination.results_in_page, 0);
    }

    #[tokio::test]
    async fn test_pagination_is_stable() {
        let engine = engine_with_tools().await;
        let opts = QueryOptions {
            limit: 2,
            page: 2,
            ..Default::default()
        };
        let response = engine.query("", &opts, &HashMap::new()).await;
        assert_eq!(response.pagination.total_pages, 2);
        assert_eq!(response.tools.len(), 1);
    }

    #[tokio::test]
    async fn test_disable_enable_round_trip() {
        let engine = engine_with_tools().await;
        engine.set_mcp_disabled("github").await;

        let response = engine
            .query("issue", &QueryOptions::default(), &HashMap::new())
            .await;
        assert!(response.tools.is_empty());

        engine.set_mcp_enabled("github").await;
        let response = engine
            .query("issue", &QueryOptions::default(), &HashMap::new())
            .await;
        assert_eq!(response.tools[0].tool_name, "create_issue");
    }

    #[tokio::test]
    async fn test_depth_controls_detail() {
        let engine = engine_with_tools().await;
        let shallow = engine
            .query("read", &QueryOptions::default(), &HashMap::new())
            .await;
        assert!(shallow.tools[0].parameters.is_none());
        assert!(shallow.tools[0].input_schema.is_none());

        let opts = QueryOptions {
            depth: 2,
            ..Default::default()
        };
        let deep = engine.query("read", &opts, &HashMap::new()).await;
        assert_eq!(
            deep.tools[0].parameters.as_deref(),
            Some(&["path".to_string()][..])
        );
        assert!(deep.tools[0].input_schema.is_some());
    }

    #[tokio::test]
    async fn test_indexing_progress_while_incomplete() {
        let engine = engine_with_tools().await;
        engine.set_expected_servers(5).await;
        let response = engine
            .query("", &QueryOptions::default(), &HashMap::new())
            .await;
        let progress = response.indexing_progress.expect("progress expected");
        assert_eq!(progress.current, 2);
        assert_eq!(progress.total, 5);

        engine.set_expected_servers(2).await;
        let response = engine
            .query("", &QueryOptions::default(), &HashMap::new())
            .await;
        assert!(response.indexing_progress.is_none());
    }

    #[tokio::test]
    async fn test_remove_server_clears_entries() {
        let engine = engine_with_tools().await;
        engine.remove_server("github").await;
        let response = engine
            .query("", &QueryOptions::default(), &HashMap::new())
            .await;
        assert_eq!(response.pagination.total_results, 1);
        assert!(engine.resolve("github", "merge_pr").await.is_none());
    }

    #[tokio::test]
    async fn test_background_reindex_coalesces() {
        let engine = engine_with_tools().await;
        for _ in 0..10 {
            engine.trigger_background_reindex();
        }
        // Let the spawned rebuild(s) finish.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let flags = engine.reindex_flags.lock().unwrap();
        assert!(!flags.running);
        assert!(!flags.queued);

        let stats = engine.get_stats().await;
        assert_eq!(stats.total_tools, 3);
    }

    #[tokio::test]
    async fn test_resolve_by_composite_key() {
        let engine = engine_with_tools().await;
        let record = engine.resolve("github", "create_issue").await.unwrap();
        assert_eq!(record.qualified_name(), "github create_issue");
        assert!(engine.resolve("github", "missing").await.is_none());
    }
}
