// crates/ncp-server/src/downstream.rs
// MCP Client Transport - connections to downstream MCP servers

use crate::cache::{CacheEntry, ToolCache};
use crate::config::{definition_hash, AuthConfig, ServerDefinition};
use crate::discovery::DiscoveryEngine;
use crate::error::{NcpError, Result};
use crate::health::HealthSupervisor;
use chrono::Utc;
use ncp_types::{ClientIdentity, ToolRecord};
use rmcp::model::{CallToolRequestParams, CallToolResult, ClientInfo};
use rmcp::service::{NotificationContext, Peer, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{serve_client, ClientHandler, RoleClient};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Grace period for a downstream to exit before its transport is dropped.
pub const GRACEFUL_MS: u64 = 2_000;
/// Ceiling for closing all downstreams in parallel at shutdown.
pub const SHUTDOWN_MS: u64 = 10_000;
/// Default per-call timeout when the caller does not supply one.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Notifications surfaced from downstream connections.
#[derive(Debug, Clone)]
pub enum DownstreamEvent {
    ToolListChanged { server: String },
}

/// How a dispatched call failed. Kept separate from `NcpError` because the
/// retry policy needs to distinguish transport failures (retryable) from
/// errors the downstream tool itself reported (never retried).
#[derive(Debug)]
pub enum DispatchError {
    Timeout(u64),
    /// JSON-RPC error response from the downstream.
    Downstream(String),
    /// Transport-level failure (pipe closed, connection reset, not connected).
    Transport(String),
}

impl DispatchError {
    pub fn into_ncp_error(self) -> NcpError {
        match self {
            DispatchError::Timeout(ms) => NcpError::Timeout(ms),
            DispatchError::Downstream(msg) | DispatchError::Transport(msg) => {
                NcpError::InvocationFailed(msg)
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Timeout(_) | DispatchError::Transport(_))
    }
}

/// Client handler passed to every downstream connection. Reports the
/// forwarded upstream identity and relays tool-list-changed notifications.
#[derive(Clone)]
struct NcpClientHandler {
    info: ClientInfo,
    server_name: String,
    events: mpsc::UnboundedSender<DownstreamEvent>,
}

impl ClientHandler for NcpClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            info!(server = %self.server_name, "Downstream tool list changed");
            let _ = self.events.send(DownstreamEvent::ToolListChanged {
                server: self.server_name.clone(),
            });
        }
    }

    fn on_logging_message(
        &self,
        params: rmcp::model::LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            debug!(
                server = %self.server_name,
                level = ?params.level,
                "Downstream log: {:?}",
                params.data
            );
        }
    }
}

/// A connected downstream with its peer handle.
struct ConnectedServer {
    peer: Peer<RoleClient>,
    hash: String,
    /// Keeps the transport alive; cancelling it closes pipes and reaps the
    /// child process.
    service: RunningService<RoleClient, NcpClientHandler>,
}

/// The `initialize.clientInfo` NCP sends downstream: the upstream-captured
/// identity bit-identical when present, otherwise NCP's own.
pub fn forwarded_client_info(identity: Option<&ClientIdentity>) -> ClientInfo {
    let mut info = ClientInfo::default();
    match identity {
        Some(identity) => {
            info.client_info.name = identity.name.clone().into();
            info.client_info.version = identity.version.clone().into();
        }
        None => {
            info.client_info.name = "ncp".into();
            info.client_info.version = env!("CARGO_PKG_VERSION").into();
        }
    }
    info
}

/// Convert an advertised rmcp tool into our record form.
fn tool_record(server_name: &str, tool: &rmcp::model::Tool) -> ToolRecord {
    ToolRecord {
        server_name: server_name.to_string(),
        tool_name: tool.name.to_string(),
        description: tool.description.as_deref().unwrap_or("").to_string(),
        input_schema: serde_json::to_value(tool.input_schema.as_ref()).unwrap_or_default(),
    }
}

/// Manages connections to downstream MCP servers.
///
/// Each downstream is connected lazily or by the startup sweep, guarded
/// per-server against double-connect races, and reported to the health
/// supervisor, tool cache, and discovery index as it comes and goes.
pub struct DownstreamManager {
    identity: Arc<RwLock<Option<ClientIdentity>>>,
    health: Arc<HealthSupervisor>,
    cache: Arc<ToolCache>,
    discovery: Arc<DiscoveryEngine>,
    clients: RwLock<HashMap<String, ConnectedServer>>,
    /// Per-server connection guards. A `Notify` present means a connection
    /// attempt is in progress; waiters await it instead of polling.
    connecting: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Notify>>>,
    /// Servers with an active reconnect loop, so loss seen from several
    /// callers spawns one loop.
    reconnecting: tokio::sync::Mutex<std::collections::HashSet<String>>,
    events_tx: mpsc::UnboundedSender<DownstreamEvent>,
    shutdown: watch::Receiver<bool>,
}

impl DownstreamManager {
    pub fn new(
        identity: Arc<RwLock<Option<ClientIdentity>>>,
        health: Arc<HealthSupervisor>,
        cache: Arc<ToolCache>,
        discovery: Arc<DiscoveryEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<DownstreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                health,
                cache,
                discovery,
                clients: RwLock::new(HashMap::new()),
                connecting: tokio::sync::Mutex::new(HashMap::new()),
                reconnecting: tokio::sync::Mutex::new(std::collections::HashSet::new()),
                events_tx,
                shutdown,
            },
            events_rx,
        )
    }

    pub async fn is_connected(&self, server_name: &str) -> bool {
        self.clients.read().await.contains_key(server_name)
    }

    /// Connect a downstream, list its tools, and publish them to the cache
    /// and discovery index. Safe to call concurrently; the per-server guard
    /// collapses racing attempts into one.
    pub async fn connect_and_index(&self, server_name: &str, def: &ServerDefinition) -> Result<()> {
        // Fast path: already connected.
        if self.is_connected(server_name).await {
            return Ok(());
        }

        // Acquire the connecting guard to prevent concurrent connection attempts.
        {
            let mut connecting = self.connecting.lock().await;
            if let Some(notify) = connecting.get(server_name) {
                let notify = notify.clone();
                drop(connecting);
                let waited =
                    tokio::time::timeout(Duration::from_secs(30), notify.notified()).await;
                if waited.is_err() {
                    return Err(NcpError::Timeout(30_000));
                }
                if self.is_connected(server_name).await {
                    return Ok(());
                }
                return Err(NcpError::InvocationFailed(format!(
                    "concurrent connection to '{}' failed",
                    server_name
                )));
            }
            connecting.insert(
                server_name.to_string(),
                Arc::new(tokio::sync::Notify::new()),
            );
        }

        let result = self.do_connect(server_name, def).await;

        let mut connecting = self.connecting.lock().await;
        if let Some(notify) = connecting.remove(server_name) {
            notify.notify_waiters();
        }
        result
    }

    async fn do_connect(&self, server_name: &str, def: &ServerDefinition) -> Result<()> {
        self.health.register(server_name).await;

        let identity = self.identity.read().await.clone();
        let handler = NcpClientHandler {
            info: forwarded_client_info(identity.as_ref()),
            server_name: server_name.to_string(),
            events: self.events_tx.clone(),
        };

        let service = match def {
            ServerDefinition::Stdio { command, args, env } => {
                debug!(
                    server = %server_name,
                    command = %command,
                    args = ?args,
                    "Spawning downstream MCP server"
                );
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null());

                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    NcpError::InvocationFailed(format!(
                        "failed to spawn '{}': {}",
                        server_name, e
                    ))
                })?;

                serve_client(handler, transport).await.map_err(|e| {
                    NcpError::InvocationFailed(format!(
                        "initialize failed for '{}': {}",
                        server_name, e
                    ))
                })?
            }
            ServerDefinition::Http { url, auth } => {
                info!(server = %server_name, url = %url, "Connecting to downstream MCP HTTP server");
                let mut config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                if let Some(token) = resolve_bearer_token(server_name, auth.as_ref()) {
                    config = config.auth_header(token);
                }
                let transport = StreamableHttpClientTransport::from_config(config);
                serve_client(handler, transport).await.map_err(|e| {
                    NcpError::InvocationFailed(format!(
                        "initialize failed for '{}': {}",
                        server_name, e
                    ))
                })?
            }
        };

        let peer = service.peer().clone();
        let tools = peer.list_all_tools().await.map_err(|e| {
            NcpError::Protocol {
                server: server_name.to_string(),
                message: format!("tools/list failed: {}", e),
            }
        })?;

        let records: Vec<ToolRecord> = tools.iter().map(|t| tool_record(server_name, t)).collect();
        let hash = definition_hash(server_name, def);

        info!(
            server = %server_name,
            tools = records.len(),
            "Connected to downstream MCP server"
        );

        self.cache
            .store(&CacheEntry {
                hash: hash.clone(),
                server_name: server_name.to_string(),
                tools: records.clone(),
                captured_at: Utc::now(),
                last_seen_healthy: Some(Utc::now()),
            })
            .await?;
        self.discovery.upsert(server_name, records).await;
        self.health.record_initialize_ok(server_name).await;

        self.clients.write().await.insert(
            server_name.to_string(),
            ConnectedServer {
                peer,
                hash,
                service,
            },
        );
        Ok(())
    }

    /// Call a tool on a connected downstream with a deadline. On expiry the
    /// response is discarded; the child keeps running but this call fails
    /// with `Timeout`.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> std::result::Result<CallToolResult, DispatchError> {
        let peer = {
            let clients = self.clients.read().await;
            match clients.get(server_name) {
                Some(server) => server.peer.clone(),
                None => {
                    return Err(DispatchError::Transport(format!(
                        "server '{}' is not connected",
                        server_name
                    )))
                }
            }
        };

        debug!(server = %server_name, tool = %tool_name, "Calling downstream tool");

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(DispatchError::Downstream(format!(
                    "tool arguments must be an object, got {}",
                    other
                )))
            }
        };

        let call = peer.call_tool(CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments,
            task: None,
        });

        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(DispatchError::Timeout(timeout.as_millis() as u64)),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rmcp::ServiceError::McpError(e))) => Err(DispatchError::Downstream(e.to_string())),
            Ok(Err(other)) => Err(DispatchError::Transport(other.to_string())),
        }
    }

    /// Re-list a downstream's tools after a change notification.
    pub async fn refresh_tools(&self, server_name: &str) -> Result<()> {
        let (peer, hash) = {
            let clients = self.clients.read().await;
            match clients.get(server_name) {
                Some(server) => (server.peer.clone(), server.hash.clone()),
                None => return Ok(()),
            }
        };

        let tools = peer.list_all_tools().await.map_err(|e| NcpError::Protocol {
            server: server_name.to_string(),
            message: format!("tools/list failed: {}", e),
        })?;
        let records: Vec<ToolRecord> = tools.iter().map(|t| tool_record(server_name, t)).collect();

        self.cache
            .store(&CacheEntry {
                hash,
                server_name: server_name.to_string(),
                tools: records.clone(),
                captured_at: Utc::now(),
                last_seen_healthy: Some(Utc::now()),
            })
            .await?;
        self.discovery.upsert(server_name, records).await;
        Ok(())
    }

    /// Record a lost connection and start one reconnect loop with backoff.
    /// The loop halts on shutdown or when the server is removed.
    pub async fn handle_connection_lost(self: &Arc<Self>, server_name: &str, def: &ServerDefinition, reason: &str) {
        self.health.record_connection_lost(server_name, reason).await;
        self.drop_connection(server_name).await;

        {
            let mut reconnecting = self.reconnecting.lock().await;
            if !reconnecting.insert(server_name.to_string()) {
                return;
            }
        }

        let manager = Arc::clone(self);
        let server = server_name.to_string();
        let def = def.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                // Removed servers stop being tracked; halt the loop.
                if manager.health.health_of(&server).await.is_none() {
                    break;
                }
                let backoff = manager.health.next_backoff(&server).await;
                debug!(server = %server, backoff_ms = backoff.as_millis() as u64, "Reconnect backoff");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                match manager.connect_and_index(&server, &def).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(server = %server, error = %e, "Reconnect attempt failed");
                    }
                }
            }
            manager.reconnecting.lock().await.remove(&server);
        });
    }

    /// Disconnect one downstream, waiting up to `GRACEFUL_MS` for a clean
    /// close before the transport is dropped (which kills stdio children).
    pub async fn disconnect(&self, server_name: &str) {
        let server = self.clients.write().await.remove(server_name);
        if let Some(server) = server {
            info!(server = %server_name, "Disconnecting downstream MCP server");
            let cancel = server.service.cancel();
            if tokio::time::timeout(Duration::from_millis(GRACEFUL_MS), cancel)
                .await
                .is_err()
            {
                warn!(server = %server_name, "Graceful close timed out; transport dropped");
            }
        }
    }

    async fn drop_connection(&self, server_name: &str) {
        self.clients.write().await.remove(server_name);
    }

    /// Close every downstream in parallel under the global shutdown ceiling.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        let closing = names.iter().map(|name| self.disconnect(name));
        if tokio::time::timeout(
            Duration::from_millis(SHUTDOWN_MS),
            futures::future::join_all(closing),
        )
        .await
        .is_err()
        {
            warn!("Downstream shutdown exceeded ceiling; remaining transports dropped");
        }
    }
}

/// Resolve a bearer token from the profile's auth configuration. Basic auth
/// is not supported by the streamable HTTP transport; it is reported once
/// and the connection proceeds unauthenticated.
fn resolve_bearer_token(server_name: &str, auth: Option<&AuthConfig>) -> Option<String> {
    match auth? {
        AuthConfig::None => None,
        AuthConfig::Bearer {
            token_env_var,
            token,
        } => {
            if let Some(env_var) = token_env_var {
                match std::env::var(env_var) {
                    Ok(token) => return Some(token),
                    Err(_) => {
                        warn!(
                            server = %server_name,
                            env_var = %env_var,
                            "Missing bearer token env var for MCP HTTP server"
                        );
                    }
                }
            }
            token.clone()
        }
        AuthConfig::Oauth { token } => token.clone(),
        AuthConfig::Basic { .. } => {
            warn!(
                server = %server_name,
                "basic auth is not supported for MCP HTTP transport; only bearer tokens are used"
            );
            None
        }
    }
}
