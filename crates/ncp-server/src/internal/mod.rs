// crates/ncp-server/src/internal/mod.rs
// Internal MCP hosts - in-process management tools indexed like downstreams

use crate::config::{AuthConfig, ServerDefinition};
use crate::error::{NcpError, Result};
use crate::orchestrator::Orchestrator;
use crate::scheduler::{CreateTaskParams, TaskPatch};
use chrono::{DateTime, Utc};
use ncp_types::{TaskStatus, ToolRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The in-process hosts. Their tools live in the discovery index under
/// these server names and dispatch without a transport.
pub const HOSTS: [&str; 2] = ["mcp", "schedule"];

pub fn is_internal_host(server: &str) -> bool {
    HOSTS.contains(&server)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct McpAddRequest {
    #[schemars(description = "Server name, unique within the profile")]
    pub name: String,
    #[schemars(description = "Command to spawn for a stdio server")]
    pub command: Option<String>,
    #[schemars(description = "Command arguments")]
    #[serde(default)]
    pub args: Vec<String>,
    #[schemars(description = "Environment variables for the child process")]
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[schemars(description = "URL of an HTTP server (used when no command is given)")]
    pub url: Option<String>,
    #[schemars(description = "Authentication for HTTP servers")]
    pub auth: Option<AuthConfig>,
}

impl McpAddRequest {
    /// `command` takes precedence over `url` when both are present.
    fn into_definition(self) -> Result<(String, ServerDefinition)> {
        let definition = if let Some(command) = self.command {
            ServerDefinition::Stdio {
                command,
                args: self.args,
                env: self.env,
            }
        } else if let Some(url) = self.url {
            ServerDefinition::Http {
                url,
                auth: self.auth,
            }
        } else {
            return Err(NcpError::ValidationFailed(
                "a server needs either a command (stdio) or a url (http)".into(),
            ));
        };
        Ok((self.name, definition))
    }
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct McpNameRequest {
    #[schemars(description = "Server name")]
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ScheduleCreateRequest {
    #[schemars(description = "Human-readable task name")]
    pub name: String,
    #[schemars(description = "Fully-qualified tool to invoke ('server tool')")]
    pub tool: String,
    #[schemars(description = "Cron expression (five or six fields)")]
    pub schedule: String,
    #[schemars(description = "IANA timezone, e.g. America/New_York (default UTC)")]
    pub timezone: Option<String>,
    #[schemars(description = "Arguments passed to the tool on every firing")]
    pub parameters: Option<Value>,
    #[schemars(description = "Complete the task after its first execution")]
    #[serde(default)]
    pub fire_once: bool,
    #[schemars(description = "Maximum number of executions")]
    pub max_executions: Option<u32>,
    #[schemars(description = "Exclusive end date, RFC 3339")]
    pub end_date: Option<String>,
    #[schemars(description = "Fire once on restart for slots missed while down")]
    #[serde(default)]
    pub catchup_missed: bool,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ScheduleRetrieveRequest {
    #[schemars(description = "What to retrieve: tasks (default) or executions")]
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[schemars(description = "Filter tasks by status: active/paused/completed/error")]
    pub status: Option<String>,
    #[schemars(description = "Filter executions by task ID")]
    pub task_id: Option<String>,
    #[schemars(description = "Max results")]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ScheduleUpdateRequest {
    #[schemars(description = "Task ID")]
    pub task_id: String,
    #[schemars(description = "New task name")]
    pub name: Option<String>,
    #[schemars(description = "New cron expression")]
    pub schedule: Option<String>,
    #[schemars(description = "New IANA timezone")]
    pub timezone: Option<String>,
    #[schemars(description = "New tool arguments")]
    pub parameters: Option<Value>,
    #[schemars(description = "New status: active/paused/completed/error")]
    pub status: Option<String>,
    #[schemars(description = "Complete after the next execution")]
    pub fire_once: Option<bool>,
    #[schemars(description = "Maximum number of executions")]
    pub max_executions: Option<u32>,
    #[schemars(description = "Exclusive end date, RFC 3339")]
    pub end_date: Option<String>,
    #[schemars(description = "Fire once on restart for missed slots")]
    pub catchup_missed: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ScheduleDeleteRequest {
    #[schemars(description = "Task ID")]
    pub task_id: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ScheduleValidateRequest {
    #[schemars(description = "Cron expression to validate")]
    pub schedule: String,
    #[schemars(description = "IANA timezone (default UTC)")]
    pub timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// Tool records
// ---------------------------------------------------------------------------

fn schema_of<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn record(host: &str, tool: &str, description: &str, input_schema: Value) -> ToolRecord {
    ToolRecord {
        server_name: host.to_string(),
        tool_name: tool.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// The tool records one internal host contributes to the discovery index.
pub fn tool_records(host: &str) -> Vec<ToolRecord> {
    match host {
        "mcp" => vec![
            record(
                "mcp",
                "add",
                "Add a downstream MCP server (stdio command or HTTP URL) to the active profile.",
                schema_of::<McpAddRequest>(),
            ),
            record(
                "mcp",
                "remove",
                "Remove a downstream MCP server and every trace of it (profile, cache, index).",
                schema_of::<McpNameRequest>(),
            ),
            record(
                "mcp",
                "list",
                "List configured MCP servers with health, transport, and tool counts.",
                empty_schema(),
            ),
            record(
                "mcp",
                "enable",
                "Re-enable a disabled server so its tools appear in discovery again.",
                schema_of::<McpNameRequest>(),
            ),
            record(
                "mcp",
                "disable",
                "Hide a server's tools from discovery without disconnecting it.",
                schema_of::<McpNameRequest>(),
            ),
        ],
        "schedule" => vec![
            record(
                "schedule",
                "create",
                "Create a scheduled task that invokes a tool on a cron schedule.",
                schema_of::<ScheduleCreateRequest>(),
            ),
            record(
                "schedule",
                "retrieve",
                "Retrieve scheduled tasks or execution records.",
                schema_of::<ScheduleRetrieveRequest>(),
            ),
            record(
                "schedule",
                "update",
                "Update a scheduled task; changing its cron expression regroups its timer.",
                schema_of::<ScheduleUpdateRequest>(),
            ),
            record(
                "schedule",
                "delete",
                "Delete a scheduled task; an emptied timing group is removed.",
                schema_of::<ScheduleDeleteRequest>(),
            ),
            record(
                "schedule",
                "validate",
                "Validate a cron expression and preview its next fire times.",
                schema_of::<ScheduleValidateRequest>(),
            ),
        ],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| NcpError::ValidationFailed(format!("invalid arguments: {}", e)))
}

fn parse_status(status: &str) -> Result<TaskStatus> {
    serde_json::from_value(Value::String(status.to_string()))
        .map_err(|_| NcpError::ValidationFailed(format!("unknown status {:?}", status)))
}

fn parse_end_date(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| NcpError::ValidationFailed(format!("invalid end_date: {}", e)))
    })
    .transpose()
}

fn to_pretty(value: &impl serde::Serialize) -> Result<String> {
    Ok(serde_json::to_string_pretty(&serde_json::to_value(value)?)?)
}

/// Execute one internal tool in-process. Routing mirrors the discovery
/// index: `server` is one of `HOSTS`, `tool` the record's tool name.
pub async fn dispatch(
    orchestrator: &Orchestrator,
    server: &str,
    tool: &str,
    args: Value,
) -> Result<String> {
    match (server, tool) {
        ("mcp", "add") => {
            let request: McpAddRequest = parse(args)?;
            let (name, definition) = request.into_definition()?;
            orchestrator.add_server(&name, definition).await?;
            to_pretty(&serde_json::json!({
                "action": "add",
                "message": format!("Server '{}' added and indexed", name),
            }))
        }
        ("mcp", "remove") => {
            let request: McpNameRequest = parse(args)?;
            orchestrator.remove_server(&request.name).await?;
            to_pretty(&serde_json::json!({
                "action": "remove",
                "message": format!("Server '{}' removed", request.name),
            }))
        }
        ("mcp", "list") => {
            let servers = orchestrator.server_summaries().await?;
            to_pretty(&serde_json::json!({
                "action": "list",
                "servers": servers,
            }))
        }
        ("mcp", "enable") => {
            let request: McpNameRequest = parse(args)?;
            orchestrator.set_server_enabled(&request.name, true).await?;
            to_pretty(&serde_json::json!({
                "action": "enable",
                "message": format!("Server '{}' enabled", request.name),
            }))
        }
        ("mcp", "disable") => {
            let request: McpNameRequest = parse(args)?;
            orchestrator.set_server_enabled(&request.name, false).await?;
            to_pretty(&serde_json::json!({
                "action": "disable",
                "message": format!("Server '{}' disabled", request.name),
            }))
        }
        ("schedule", "create") => {
            let request: ScheduleCreateRequest = parse(args)?;
            let task = orchestrator
                .scheduler()
                .create(CreateTaskParams {
                    name: request.name,
                    tool: request.tool,
                    schedule: request.schedule,
                    timezone: request.timezone,
                    parameters: request.parameters.unwrap_or(Value::Null),
                    fire_once: request.fire_once,
                    max_executions: request.max_executions,
                    end_date: parse_end_date(request.end_date)?,
                    catchup_missed: request.catchup_missed,
                })
                .await?;
            to_pretty(&serde_json::json!({
                "action": "create",
                "message": format!("Task '{}' scheduled", task.name),
                "task": task,
            }))
        }
        ("schedule", "retrieve") => {
            let request: ScheduleRetrieveRequest = parse(args)?;
            let limit = request.limit.unwrap_or(20) as usize;
            match request.kind.as_deref().unwrap_or("tasks") {
                "tasks" => {
                    let status = request.status.as_deref().map(parse_status).transpose()?;
                    let tasks = orchestrator.scheduler().list_tasks(status).await;
                    to_pretty(&serde_json::json!({
                        "action": "retrieve",
                        "tasks": tasks,
                    }))
                }
                "executions" => {
                    let executions = orchestrator
                        .scheduler()
                        .list_executions(request.task_id.as_deref(), limit)
                        .await;
                    to_pretty(&serde_json::json!({
                        "action": "retrieve",
                        "executions": executions,
                    }))
                }
                other => Err(NcpError::ValidationFailed(format!(
                    "type must be 'tasks' or 'executions', got {:?}",
                    other
                ))),
            }
        }
        ("schedule", "update") => {
            let request: ScheduleUpdateRequest = parse(args)?;
            let status = request.status.as_deref().map(parse_status).transpose()?;
            let task = orchestrator
                .scheduler()
                .update(
                    &request.task_id,
                    TaskPatch {
                        name: request.name,
                        schedule: request.schedule,
                        timezone: request.timezone,
                        parameters: request.parameters,
                        status,
                        fire_once: request.fire_once,
                        max_executions: request.max_executions,
                        end_date: parse_end_date(request.end_date)?,
                        catchup_missed: request.catchup_missed,
                    },
                )
                .await?;
            to_pretty(&serde_json::json!({
                "action": "update",
                "message": format!("Task '{}' updated", task.name),
                "task": task,
            }))
        }
        ("schedule", "delete") => {
            let request: ScheduleDeleteRequest = parse(args)?;
            orchestrator.scheduler().delete(&request.task_id).await?;
            to_pretty(&serde_json::json!({
                "action": "delete",
                "message": format!("Task '{}' deleted", request.task_id),
            }))
        }
        ("schedule", "validate") => {
            let request: ScheduleValidateRequest = parse(args)?;
            let report = orchestrator
                .scheduler()
                .validate(&request.schedule, request.timezone.as_deref())?;
            to_pretty(&serde_json::json!({
                "action": "validate",
                "report": report,
            }))
        }
        _ => Err(NcpError::NotFound(format!(
            "internal tool '{} {}' not found",
            server, tool
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_names() {
        assert!(is_internal_host("mcp"));
        assert!(is_internal_host("schedule"));
        assert!(!is_internal_host("github"));
    }

    #[test]
    fn test_tool_records_have_schemas() {
        let records = tool_records("mcp");
        assert_eq!(records.len(), 5);
        let add = records.iter().find(|r| r.tool_name == "add").unwrap();
        let required = add.input_schema.get("required").and_then(|r| r.as_array());
        assert!(required.is_some_and(|r| r.iter().any(|k| k == "name")));

        let records = tool_records("schedule");
        assert_eq!(records.len(), 5);
        assert!(tool_records("nope").is_empty());
    }

    #[test]
    fn test_add_request_transport_selection() {
        let request = McpAddRequest {
            name: "git".into(),
            command: Some("git-mcp".into()),
            args: vec![],
            env: BTreeMap::new(),
            url: Some("https://ignored.example".into()),
            auth: None,
        };
        let (_, definition) = request.into_definition().unwrap();
        assert_eq!(definition.transport_kind(), "stdio");

        let request = McpAddRequest {
            name: "web".into(),
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            auth: None,
        };
        assert_eq!(
            request.into_definition().unwrap_err().kind(),
            "ValidationFailed"
        );
    }

    #[test]
    fn test_parse_status_and_end_date() {
        assert_eq!(parse_status("active").unwrap(), TaskStatus::Active);
        assert!(parse_status("sometimes").is_err());

        assert!(parse_end_date(Some("2026-09-01T00:00:00Z".into())).unwrap().is_some());
        assert!(parse_end_date(Some("next tuesday".into())).is_err());
        assert!(parse_end_date(None).unwrap().is_none());
    }
}
