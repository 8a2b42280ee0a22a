// crates/ncp-types/src/lib.rs

//! Shared data contracts between the NCP server and its clients.
//!
//! This crate provides the core domain model for:
//! - **Client identity**: the upstream `clientInfo` forwarded to downstreams
//! - **Tool records**: the `(server, tool)` pairs the discovery index serves
//! - **Server health**: the supervisor's per-downstream state
//! - **Scheduler documents**: tasks, timing groups, and execution records
//!
//! Everything here is plain serde data with no native-only dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ===================================================
// CLIENT IDENTITY
// ===================================================

/// The upstream client's identity, captured from its `initialize` request.
///
/// NCP forwards this verbatim in its own `initialize` to every downstream
/// server, so downstreams see the real client rather than the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

// ===================================================
// SERVER HEALTH
// ===================================================

/// Health state of a downstream server as tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    /// Connection attempt in progress; tools may be served from cache.
    Starting,
    Healthy,
    /// Connected but recent calls have been timing out.
    Degraded,
    /// Initialize failed or the connection was lost past the backoff ceiling.
    Unhealthy,
}

impl ServerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerHealth::Starting => "starting",
            ServerHealth::Healthy => "healthy",
            ServerHealth::Degraded => "degraded",
            ServerHealth::Unhealthy => "unhealthy",
        }
    }

}

impl std::fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===================================================
// TOOL RECORDS
// ===================================================

/// A tool advertised by a downstream (or internal) server.
///
/// The composite `(server_name, tool_name)` is the identity; both the legacy
/// `server:tool` form and the current `server tool` form address it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments, as advertised by the server.
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolRecord {
    /// Fully-qualified name in the current `server tool` form.
    pub fn qualified_name(&self) -> String {
        format!("{} {}", self.server_name, self.tool_name)
    }
}

/// Split a fully-qualified tool name into `(server, tool)`.
///
/// Accepts `server:tool` (legacy) and `server tool` (current). The first
/// separator wins, so tool names may themselves contain either character.
pub fn parse_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    let qualified = qualified.trim();
    let idx = qualified.find([':', ' '])?;
    let (server, tool) = qualified.split_at(idx);
    let tool = &tool[1..];
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool.trim_start()))
}

// ===================================================
// DISCOVERY
// ===================================================

/// Progress of the discovery index while downstreams are still connecting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexingProgress {
    /// Servers whose tools are indexed so far.
    pub current: usize,
    /// Servers in the active profile.
    pub total: usize,
}

impl IndexingProgress {
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

// ===================================================
// SCHEDULER DOCUMENTS
// ===================================================

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Error,
}

/// A persistent tool invocation driven by a timing group's cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    /// The timing group whose cron expression fires this task.
    pub timing_id: String,
    /// Fully-qualified tool name to invoke.
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub fire_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
    /// Exclusive upper bound; the task never fires at or after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Fire once on restart for slots missed while the process was down.
    #[serde(default)]
    pub catchup_missed: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A shared cron expression fanning out to one or more tasks.
///
/// Groups with no remaining tasks are garbage-collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingGroup {
    pub id: String,
    pub cron_expression: String,
    /// IANA timezone name, e.g. `America/New_York`. UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
}

/// The persisted scheduler state (`schedule.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDocument {
    pub version: String,
    #[serde(default)]
    pub tasks: HashMap<String, ScheduledTask>,
    #[serde(default)]
    pub timings: HashMap<String, TimingGroup>,
}

impl Default for ScheduleDocument {
    fn default() -> Self {
        Self {
            version: SCHEDULE_DOCUMENT_VERSION.to_string(),
            tasks: HashMap::new(),
            timings: HashMap::new(),
        }
    }
}

/// On-disk format version for `schedule.json`.
pub const SCHEDULE_DOCUMENT_VERSION: &str = "2.0.0";

/// Outcome of a single scheduled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure,
    Timeout,
}

/// One record per scheduled invocation, kept under the retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Slots that arrived while this execution was still running.
    #[serde(default)]
    pub skipped_slots: u32,
}
