//! Structured output types for the virtual tools.
//!
//! `find` and `run` return typed outputs through the `Json<T>` wrapper, so
//! rmcp advertises an `outputSchema` for them while the human-readable
//! `message` stays in plain MCP content. The root type is always an object
//! (MCP requirement).

use crate::discovery::{Pagination, ScoredTool};
use rmcp::handler::server::tool::IntoCallToolResult;
use rmcp::model::{CallToolResult, Content};
use rmcp::ErrorData;
use schemars::JsonSchema;
use serde::Serialize;
use std::borrow::Cow;

/// Trait for outputs that expose a human-readable message.
pub trait HasMessage {
    fn message(&self) -> &str;
}

/// Indexing progress mirrored into the wire shape.
#[derive(Debug, Clone, Copy, Serialize, JsonSchema)]
pub struct IndexingProgressOut {
    /// Servers indexed so far.
    pub current: usize,
    /// Servers expected in the active profile.
    pub total: usize,
}

/// Per-server health as attached to `find` responses.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ServerHealthOut {
    pub server: String,
    pub health: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct FindOutput {
    pub message: String,
    pub tools: Vec<ScoredTool>,
    pub pagination: Pagination,
    /// Present while downstreams are still being indexed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing_progress: Option<IndexingProgressOut>,
    /// Health of every tracked server, so degraded results are explainable.
    pub servers: Vec<ServerHealthOut>,
}

impl HasMessage for FindOutput {
    fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct RunOutput {
    /// The invoked tool's text output.
    pub message: String,
    /// Fully-qualified tool name that was invoked.
    pub name: String,
    pub server_name: String,
}

impl HasMessage for RunOutput {
    fn message(&self) -> &str {
        &self.message
    }
}

/// JSON wrapper that preserves the human-readable `message` in MCP content
/// while shipping the full value as structured content.
pub struct Json<T>(pub T);

impl<T: JsonSchema> JsonSchema for Json<T> {
    fn schema_name() -> Cow<'static, str> {
        T::schema_name()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        T::json_schema(generator)
    }
}

impl<T: Serialize + JsonSchema + HasMessage + 'static> IntoCallToolResult for Json<T> {
    fn into_call_tool_result(self) -> Result<CallToolResult, ErrorData> {
        let message = self.0.message().to_string();
        let value = serde_json::to_value(&self.0).map_err(|e| {
            ErrorData::internal_error(
                format!("Failed to serialize structured content: {}", e),
                None,
            )
        })?;

        Ok(CallToolResult {
            content: vec![Content::text(message)],
            structured_content: Some(value),
            is_error: Some(false),
            meta: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::handler::server::tool::schema_for_output;

    #[test]
    fn all_schemas_are_valid_mcp_output() {
        // Each output type must produce a root type "object" schema.
        assert!(schema_for_output::<FindOutput>().is_ok(), "FindOutput");
        assert!(schema_for_output::<RunOutput>().is_ok(), "RunOutput");
    }
}
