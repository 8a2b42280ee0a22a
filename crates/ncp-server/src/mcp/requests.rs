// crates/ncp-server/src/mcp/requests.rs
// MCP tool request types

use rmcp::schemars;
use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FindRequest {
    #[schemars(description = "What you want to do, in plain words. Empty lists every tool.")]
    pub query: Option<String>,
    #[schemars(description = "Max results per page (default 20)")]
    pub limit: Option<u32>,
    #[schemars(description = "Page number, 1-based")]
    pub page: Option<u32>,
    #[schemars(description = "Drop results scoring below this (0.0-1.0)")]
    pub confidence_threshold: Option<f32>,
    #[schemars(description = "Only return tools from this server")]
    pub mcp_filter: Option<String>,
    #[schemars(description = "Detail level: 0 name+description, 1 adds parameters, 2 full schema")]
    pub depth: Option<u8>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunRequest {
    #[schemars(description = "Fully-qualified tool name: 'server tool' or 'server:tool'")]
    pub tool: String,
    #[schemars(description = "Arguments for the tool, matching its input schema")]
    pub parameters: Option<serde_json::Value>,
    #[schemars(description = "Per-call timeout in milliseconds (default 30000)")]
    pub timeout_ms: Option<u64>,
    #[schemars(description = "Extra attempts for transport errors and timeouts (default 1)")]
    pub retry: Option<u32>,
}
