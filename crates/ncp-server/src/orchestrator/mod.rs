// crates/ncp-server/src/orchestrator/mod.rs
// Orchestrator Core - owns every component and exposes the public contract

use crate::cache::ToolCache;
use crate::config::{definition_hash, EnvConfig, ProfileStore, ServerDefinition};
use crate::discovery::{DiscoveryEngine, QueryOptions, QueryResponse};
use crate::downstream::{
    DispatchError, DownstreamEvent, DownstreamManager, DEFAULT_CALL_TIMEOUT_MS,
};
use crate::error::{NcpError, Result};
use crate::health::HealthSupervisor;
use crate::internal;
use crate::scheduler::{Scheduler, ToolInvoker};
use crate::state::{AtomicResource, ResourceType, StateManager};
use ncp_types::{parse_qualified_name, ClientIdentity, ServerHealth};
use rmcp::model::CallToolResult;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default retry budget for transport errors and timeouts.
pub const DEFAULT_RETRY: u32 = 1;

/// Options for a single `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first, for transport errors and timeouts
    /// only. Defaults to 1.
    pub retry: Option<u32>,
}

/// Result of a successful `run`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    /// Fully-qualified tool name that was invoked.
    pub name: String,
    pub server_name: String,
    pub content: String,
}

/// One row of `mcp.list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub transport: String,
    pub health: String,
    pub enabled: bool,
    pub tool_count: usize,
}

/// Owns the profile store, tool cache, health supervisor, discovery engine,
/// state manager, downstream connections, and scheduler, and coordinates
/// startup, dispatch, and shutdown across them.
pub struct Orchestrator {
    env: EnvConfig,
    profiles: Arc<ProfileStore>,
    cache: Arc<ToolCache>,
    health: Arc<HealthSupervisor>,
    discovery: Arc<DiscoveryEngine>,
    state: Arc<StateManager>,
    downstreams: Arc<DownstreamManager>,
    scheduler: Arc<Scheduler>,
    identity: Arc<RwLock<Option<ClientIdentity>>>,
    active_profile: RwLock<String>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DownstreamEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(env: EnvConfig) -> Result<Self> {
        let profiles = Arc::new(ProfileStore::load(&env.profiles_dir())?);
        let cache = Arc::new(ToolCache::load(&env.cache_dir())?);
        let health = Arc::new(HealthSupervisor::new());
        let discovery = Arc::new(DiscoveryEngine::new());
        let state = Arc::new(StateManager::new());
        let identity = Arc::new(RwLock::new(None));
        let scheduler = Arc::new(Scheduler::load(&env.schedule_path(), &env.executions_path())?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (downstreams, events_rx) = DownstreamManager::new(
            identity.clone(),
            health.clone(),
            cache.clone(),
            discovery.clone(),
            shutdown_rx,
        );

        Ok(Self {
            env,
            profiles,
            cache,
            health,
            discovery,
            state,
            downstreams: Arc::new(downstreams),
            scheduler,
            identity,
            active_profile: RwLock::new(String::new()),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        })
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthSupervisor> {
        &self.health
    }

    pub async fn active_profile(&self) -> String {
        self.active_profile.read().await.clone()
    }

    /// Capture the upstream client identity. Applies to future downstream
    /// connects only; already-connected servers are never reinitialized.
    pub async fn set_client_info(&self, name: &str, version: &str) {
        let mut identity = self.identity.write().await;
        let new = ClientIdentity::new(name, version);
        if identity.as_ref() != Some(&new) {
            info!(client = %name, version = %version, "Upstream client identity captured");
            *identity = Some(new);
        }
    }

    pub async fn client_identity(&self) -> Option<ClientIdentity> {
        self.identity.read().await.clone()
    }

    /// Bring the orchestrator up on a profile: seed discovery from the tool
    /// cache so `find` answers immediately, then connect downstreams and
    /// start the scheduler in the background.
    pub async fn initialize(self: &Arc<Self>, profile: &str) -> Result<()> {
        if !self.profiles.exists(profile).await {
            return Err(NcpError::ProfileNotFound(profile.to_string()));
        }
        *self.active_profile.write().await = profile.to_string();

        let servers = self.profiles.servers(profile).await?;
        // Internal hosts count toward indexing progress alongside downstreams.
        self.discovery
            .set_expected_servers(servers.len() + internal::HOSTS.len())
            .await;

        // Internal management tools are indexed like any other server.
        for host in internal::HOSTS {
            self.discovery
                .upsert(host, internal::tool_records(host))
                .await;
        }

        // Seed from cache before any network work.
        for (name, def) in &servers {
            self.health.register(name).await;
            let hash = definition_hash(name, def);
            match self.cache.lookup(&hash).await {
                Some(entry) => {
                    debug!(server = %name, tools = entry.tools.len(), "Seeded tools from cache");
                    self.discovery.upsert(name, entry.tools).await;
                }
                None => {
                    // A stale entry under an old hash means the definition
                    // changed; drop it rather than serving wrong tools.
                    if self.cache.contains_server(name).await {
                        self.cache.invalidate_server(name).await?;
                    }
                }
            }
        }

        info!(
            profile = %profile,
            servers = servers.len(),
            "Orchestrator initialized"
        );

        self.spawn_event_pump();

        if self.env.disable_background_init {
            info!("Background initialization disabled; downstreams not connected");
            return Ok(());
        }

        for (name, def) in servers {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = orchestrator
                    .downstreams
                    .connect_and_index(&name, &def)
                    .await
                {
                    warn!(server = %name, error = %e, "Initial connect failed; entering backoff");
                    orchestrator
                        .downstreams
                        .handle_connection_lost(&name, &def, &e.to_string())
                        .await;
                }
            });
        }

        self.scheduler
            .start(Arc::clone(self) as Arc<dyn ToolInvoker>)
            .await;
        Ok(())
    }

    /// Semantic tool discovery. Never fails; while downstreams are still
    /// connecting the response carries `indexing_progress`.
    pub async fn find(&self, query: &str, opts: &QueryOptions) -> QueryResponse {
        let health = self.health.snapshot().await;
        self.discovery.query(query, opts, &health).await
    }

    /// Invoke one tool on one downstream (or in-process host).
    pub async fn run(&self, qualified: &str, args: Value, opts: &RunOptions) -> Result<RunResult> {
        let (server, tool) = parse_qualified_name(qualified).ok_or_else(|| {
            NcpError::ValidationFailed(format!(
                "tool must be fully qualified ('server tool' or 'server:tool'), got {:?}",
                qualified
            ))
        })?;

        let record = self
            .discovery
            .resolve(server, tool)
            .await
            .ok_or_else(|| NcpError::NotFound(format!("tool '{}' not found", qualified)))?;
        if self.discovery.is_disabled(server).await {
            return Err(NcpError::NotFound(format!(
                "server '{}' is disabled",
                server
            )));
        }
        validate_args(&record.input_schema, &args)?;

        // In-process hosts bypass transports and health entirely.
        if internal::is_internal_host(server) {
            let content = internal::dispatch(self, server, tool, args).await?;
            return Ok(RunResult {
                name: record.qualified_name(),
                server_name: server.to_string(),
                content,
            });
        }

        let timeout = Duration::from_millis(opts.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS));

        // Health gate: unhealthy fails fast without a connect attempt;
        // starting waits for the supervisor up to the caller's deadline.
        match self.health.health_of(server).await {
            Some(ServerHealth::Unhealthy) => {
                let reason = self
                    .health
                    .last_error(server)
                    .await
                    .unwrap_or_else(|| "connection failed".to_string());
                return Err(NcpError::Unhealthy {
                    server: server.to_string(),
                    reason,
                });
            }
            Some(ServerHealth::Starting) => {
                match self.health.wait_while_starting(server, timeout).await {
                    Some(ServerHealth::Healthy) | Some(ServerHealth::Degraded) => {}
                    Some(ServerHealth::Starting) => {
                        return Err(NcpError::Timeout(timeout.as_millis() as u64))
                    }
                    Some(ServerHealth::Unhealthy) | None => {
                        let reason = self
                            .health
                            .last_error(server)
                            .await
                            .unwrap_or_else(|| "initialize failed".to_string());
                        return Err(NcpError::Unhealthy {
                            server: server.to_string(),
                            reason,
                        });
                    }
                }
            }
            Some(ServerHealth::Healthy) | Some(ServerHealth::Degraded) => {}
            None => {
                return Err(NcpError::NotFound(format!(
                    "server '{}' is not part of the active profile",
                    server
                )))
            }
        }

        let def = {
            let profile = self.active_profile().await;
            self.profiles
                .servers(&profile)
                .await?
                .get(server)
                .cloned()
                .ok_or_else(|| {
                    NcpError::NotFound(format!(
                        "server '{}' is not part of the active profile",
                        server
                    ))
                })?
        };

        let retries = opts.retry.unwrap_or(DEFAULT_RETRY);
        let mut attempt = 0;
        loop {
            attempt += 1;

            if !self.downstreams.is_connected(server).await {
                if let Err(e) = self.downstreams.connect_and_index(server, &def).await {
                    if attempt > retries {
                        return Err(e);
                    }
                    continue;
                }
            }

            match self
                .downstreams
                .call_tool(server, tool, args.clone(), timeout)
                .await
            {
                Ok(result) => {
                    self.health.record_call_success(server).await;
                    let content = flatten_result(&result);
                    if result.is_error == Some(true) {
                        // Tool-reported errors are surfaced as-is, never retried.
                        return Err(NcpError::InvocationFailed(content));
                    }
                    self.discovery.record_usage(&record.qualified_name()).await;
                    return Ok(RunResult {
                        name: record.qualified_name(),
                        server_name: server.to_string(),
                        content,
                    });
                }
                Err(DispatchError::Downstream(message)) => {
                    return Err(NcpError::InvocationFailed(message));
                }
                Err(error @ DispatchError::Timeout(_)) => {
                    self.health.record_call_timeout(server).await;
                    if attempt > retries {
                        return Err(error.into_ncp_error());
                    }
                    debug!(server = %server, tool = %tool, attempt, "Retrying after timeout");
                }
                Err(error @ DispatchError::Transport(_)) => {
                    let message = match &error {
                        DispatchError::Transport(m) => m.clone(),
                        _ => unreachable!(),
                    };
                    self.downstreams
                        .handle_connection_lost(server, &def, &message)
                        .await;
                    if attempt > retries {
                        return Err(error.into_ncp_error());
                    }
                    debug!(server = %server, tool = %tool, attempt, "Retrying after transport error");
                }
            }
        }
    }

    /// Add a server to the active profile. The profile write and the probe
    /// connect run under the state manager; any failure rolls the profile
    /// back and scrubs every partial trace of the server.
    pub async fn add_server(&self, name: &str, def: ServerDefinition) -> Result<()> {
        def.validate()?;
        let profile = self.active_profile().await;

        let probe = !self.env.disable_background_init;
        let result = self
            .state
            .execute_atomic(ResourceType::Server, name, self.profiles.as_ref(), async {
                self.profiles.add_server(&profile, name, def.clone()).await?;
                if probe {
                    self.downstreams.connect_and_index(name, &def).await?;
                }
                Ok(())
            })
            .await;

        if result.is_err() {
            self.downstreams.disconnect(name).await;
            let _ = self.cache.invalidate_server(name).await;
            self.discovery.remove_server(name).await;
            self.health.remove(name).await;
        } else {
            self.refresh_expected_servers().await;
        }
        result
    }

    /// Remove a server: profile entry, connection, cache files, discovery
    /// entries, and health tracking are all gone when this returns.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let profile = self.active_profile().await;

        self.state
            .execute_atomic(ResourceType::Server, name, self.profiles.as_ref(), async {
                self.profiles.remove_server(&profile, name).await
            })
            .await?;

        self.downstreams.disconnect(name).await;
        self.health.remove(name).await;
        self.cache.invalidate_server(name).await?;
        self.discovery.remove_server(name).await;
        self.refresh_expected_servers().await;
        Ok(())
    }

    /// Flip a server's enabled flag in discovery, serialized and rolled back
    /// through the state manager like any other mutation.
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let resource = DisabledFlags {
            discovery: self.discovery.clone(),
        };
        self.state
            .execute_atomic(ResourceType::InternalMcp, name, &resource, async {
                if enabled {
                    self.discovery.set_mcp_enabled(name).await;
                } else {
                    self.discovery.set_mcp_disabled(name).await;
                }
                Ok(())
            })
            .await?;
        self.discovery.trigger_background_reindex();
        Ok(())
    }

    /// Per-server summaries for `mcp.list`: health, transport, tool counts.
    pub async fn server_summaries(&self) -> Result<Vec<ServerSummary>> {
        let profile = self.active_profile().await;
        let servers = self.profiles.servers(&profile).await?;
        let health = self.health.snapshot().await;

        let mut summaries = Vec::new();
        for host in internal::HOSTS {
            summaries.push(ServerSummary {
                name: host.to_string(),
                transport: "internal".to_string(),
                health: ServerHealth::Healthy.to_string(),
                enabled: !self.discovery.is_disabled(host).await,
                tool_count: self.discovery.tool_names_of(host).await.len(),
            });
        }
        for (name, def) in servers {
            summaries.push(ServerSummary {
                transport: def.transport_kind().to_string(),
                health: health
                    .get(&name)
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "starting".to_string()),
                enabled: !self.discovery.is_disabled(&name).await,
                tool_count: self.discovery.tool_names_of(&name).await.len(),
                name,
            });
        }
        Ok(summaries)
    }

    /// Stop timers, cancel outstanding calls, and close every downstream in
    /// parallel under the shutdown ceiling. Idempotent.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.stop().await;
        self.downstreams.shutdown_all().await;
        self.state.cleanup().await;
    }

    async fn refresh_expected_servers(&self) {
        let profile = self.active_profile().await;
        if let Ok(servers) = self.profiles.servers(&profile).await {
            self.discovery
                .set_expected_servers(servers.len() + internal::HOSTS.len())
                .await;
        }
    }

    /// Relay downstream notifications: a tool-list change re-lists that
    /// server and coalesces an index rebuild.
    fn spawn_event_pump(self: &Arc<Self>) {
        let Some(mut events_rx) = self.events_rx.try_lock().ok().and_then(|mut g| g.take())
        else {
            return;
        };
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    DownstreamEvent::ToolListChanged { server } => {
                        if let Err(e) = orchestrator.downstreams.refresh_tools(&server).await {
                            warn!(server = %server, error = %e, "Tool refresh after notification failed");
                        }
                        orchestrator.discovery.trigger_background_reindex();
                    }
                }
            }
        });
    }
}

/// Scheduled tasks invoke tools through this capability interface rather
/// than holding the orchestrator directly.
#[async_trait::async_trait]
impl ToolInvoker for Orchestrator {
    async fn invoke_tool(
        &self,
        qualified_name: &str,
        args: Value,
        timeout_ms: u64,
    ) -> Result<Value> {
        let opts = RunOptions {
            timeout_ms: Some(timeout_ms),
            retry: None,
        };
        let result = self.run(qualified_name, args, &opts).await?;
        // Execution records keep a bounded summary, not the full payload.
        Ok(serde_json::json!({
            "tool": result.name,
            "content": crate::utils::truncate_with_ellipsis(&result.content, 2000),
        }))
    }
}

/// Adapter exposing the discovery enabled flags to the state manager.
struct DisabledFlags {
    discovery: Arc<DiscoveryEngine>,
}

#[async_trait::async_trait]
impl AtomicResource for DisabledFlags {
    async fn capture(&self) -> Result<Value> {
        Ok(self.discovery.disabled_snapshot().await)
    }

    async fn restore(&self, snapshot: Value) -> Result<()> {
        self.discovery.restore_disabled(snapshot).await
    }
}

/// Flatten a tool result to text the way the protocol intends: text blocks
/// joined by newlines.
fn flatten_result(result: &CallToolResult) -> String {
    let text: String = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        "(empty result)".to_string()
    } else {
        text
    }
}

/// Minimal schema-driven validation: required properties must be present
/// and declared primitive types must match. Anything deeper is passed
/// through for the downstream to judge.
pub fn validate_args(schema: &Value, args: &Value) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    let empty = serde_json::Map::new();
    let args = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(NcpError::ValidationFailed(format!(
                "arguments must be an object, got {}",
                type_name(other)
            )))
        }
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !args.contains_key(key) {
                return Err(NcpError::ValidationFailed(format!(
                    "missing required argument '{}'",
                    key
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in args {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !matches_type(value, expected) {
                return Err(NcpError::ValidationFailed(format!(
                    "argument '{}' must be of type {}, got {}",
                    key,
                    expected,
                    type_name(value)
                )));
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_args_required_and_types() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer"}
            },
            "required": ["path"]
        });

        assert!(validate_args(&schema, &serde_json::json!({"path": "/tmp"})).is_ok());
        assert!(
            validate_args(&schema, &serde_json::json!({"path": "/tmp", "limit": 3})).is_ok()
        );

        let err = validate_args(&schema, &serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind(), "ValidationFailed");
        assert!(err.to_string().contains("path"));

        let err =
            validate_args(&schema, &serde_json::json!({"path": 42})).unwrap_err();
        assert!(err.to_string().contains("string"));

        let err = validate_args(&schema, &serde_json::json!("not an object")).unwrap_err();
        assert_eq!(err.kind(), "ValidationFailed");
    }

    #[test]
    fn test_validate_args_without_schema_passes_through() {
        assert!(validate_args(&Value::Null, &serde_json::json!({"any": 1})).is_ok());
        // Unknown keys are passed through for the downstream to judge.
        let schema = serde_json::json!({"type": "object", "properties": {}});
        assert!(validate_args(&schema, &serde_json::json!({"extra": true})).is_ok());
    }

    #[test]
    fn test_validate_args_null_args_with_requirements() {
        let schema = serde_json::json!({"required": ["q"], "properties": {"q": {"type": "string"}}});
        let err = validate_args(&schema, &Value::Null).unwrap_err();
        assert_eq!(err.kind(), "ValidationFailed");
    }
}
