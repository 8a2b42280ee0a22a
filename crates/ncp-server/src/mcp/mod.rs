// crates/ncp-server/src/mcp/mod.rs
// Upstream MCP surface - the server the AI client talks to

pub mod requests;
pub mod responses;

use crate::discovery::QueryOptions;
use crate::internal;
use crate::orchestrator::{Orchestrator, RunOptions};
use requests::{FindRequest, RunRequest};
use responses::{
    FindOutput, HasMessage, IndexingProgressOut, Json, RunOutput, ServerHealthOut,
};
use rmcp::{
    handler::server::{
        router::tool::ToolRouter,
        tool::{IntoCallToolResult, ToolCallContext},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router, ErrorData, ServerHandler,
};
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

fn tool_result<T>(result: Result<Json<T>, String>) -> Result<CallToolResult, ErrorData>
where
    T: Serialize + JsonSchema + HasMessage + 'static,
{
    match result {
        Ok(json) => json.into_call_tool_result(),
        Err(e) => Ok(CallToolResult::error(vec![Content::text(e)])),
    }
}

/// The MCP server NCP presents upstream. Only the two virtual tools and the
/// management tools are advertised; downstream tools are reached through
/// `find` and `run`, never enumerated at `tools/list` time.
#[derive(Clone)]
pub struct NcpServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

impl NcpServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    async fn dispatch_internal(
        &self,
        host: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<String, String> {
        internal::dispatch(&self.orchestrator, host, tool, args)
            .await
            .map_err(|e| e.to_user_string())
    }
}

#[allow(clippy::expect_used)] // schema_for_output on derived JsonSchema types is infallible
#[tool_router]
impl NcpServer {
    #[tool(
        description = "Discover tools across all connected MCP servers by describing what you want to do. Returns ranked matches; call with an empty query to list everything.",
        output_schema = rmcp::handler::server::tool::schema_for_output::<responses::FindOutput>()
            .expect("FindOutput schema")
    )]
    async fn find(
        &self,
        Parameters(req): Parameters<FindRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let opts = QueryOptions {
            limit: req
                .limit
                .map(|l| l as usize)
                .unwrap_or(crate::discovery::DEFAULT_LIMIT),
            page: req.page.map(|p| p as usize).unwrap_or(1),
            confidence_threshold: req.confidence_threshold,
            mcp_filter: req.mcp_filter,
            depth: req.depth.unwrap_or(0),
        };
        let response = self
            .orchestrator
            .find(req.query.as_deref().unwrap_or(""), &opts)
            .await;

        let mut servers: Vec<ServerHealthOut> = self
            .orchestrator
            .health()
            .snapshot()
            .await
            .into_iter()
            .map(|(server, health)| ServerHealthOut {
                server,
                health: health.to_string(),
            })
            .collect();
        servers.sort_by(|a, b| a.server.cmp(&b.server));

        let message = match response.indexing_progress {
            Some(progress) => format!(
                "Found {} tools ({} of {} servers indexed)",
                response.pagination.total_results, progress.current, progress.total
            ),
            None => format!("Found {} tools", response.pagination.total_results),
        };

        tool_result(Ok(Json(FindOutput {
            message,
            tools: response.tools,
            pagination: response.pagination,
            indexing_progress: response.indexing_progress.map(|p| IndexingProgressOut {
                current: p.current,
                total: p.total,
            }),
            servers,
        })))
    }

    #[tool(
        description = "Run any discovered tool by its fully-qualified name ('server tool'). Arguments are validated against the tool's schema before dispatch.",
        output_schema = rmcp::handler::server::tool::schema_for_output::<responses::RunOutput>()
            .expect("RunOutput schema")
    )]
    async fn run(
        &self,
        Parameters(req): Parameters<RunRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let opts = RunOptions {
            timeout_ms: req.timeout_ms,
            retry: req.retry,
        };
        let result = self
            .orchestrator
            .run(
                &req.tool,
                req.parameters.unwrap_or(serde_json::Value::Null),
                &opts,
            )
            .await
            .map(|result| {
                Json(RunOutput {
                    message: result.content,
                    name: result.name,
                    server_name: result.server_name,
                })
            })
            .map_err(|e| e.to_user_string());
        tool_result(result)
    }

    #[tool(description = "Add a downstream MCP server (stdio command or HTTP URL) to the active profile.")]
    async fn mcp_add(
        &self,
        Parameters(req): Parameters<internal::McpAddRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("mcp", "add", args).await
    }

    #[tool(description = "Remove a downstream MCP server and every trace of it.")]
    async fn mcp_remove(
        &self,
        Parameters(req): Parameters<internal::McpNameRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("mcp", "remove", args).await
    }

    #[tool(description = "List configured MCP servers with health and tool counts.")]
    async fn mcp_list(&self) -> Result<String, String> {
        self.dispatch_internal("mcp", "list", serde_json::json!({})).await
    }

    #[tool(description = "Re-enable a disabled server in discovery.")]
    async fn mcp_enable(
        &self,
        Parameters(req): Parameters<internal::McpNameRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("mcp", "enable", args).await
    }

    #[tool(description = "Hide a server's tools from discovery without disconnecting it.")]
    async fn mcp_disable(
        &self,
        Parameters(req): Parameters<internal::McpNameRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("mcp", "disable", args).await
    }

    #[tool(description = "Create a scheduled task that invokes a tool on a cron schedule.")]
    async fn schedule_create(
        &self,
        Parameters(req): Parameters<internal::ScheduleCreateRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("schedule", "create", args).await
    }

    #[tool(description = "Retrieve scheduled tasks or execution records.")]
    async fn schedule_retrieve(
        &self,
        Parameters(req): Parameters<internal::ScheduleRetrieveRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("schedule", "retrieve", args).await
    }

    #[tool(description = "Update a scheduled task (name, schedule, status, limits).")]
    async fn schedule_update(
        &self,
        Parameters(req): Parameters<internal::ScheduleUpdateRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("schedule", "update", args).await
    }

    #[tool(description = "Delete a scheduled task; an emptied timing group is removed.")]
    async fn schedule_delete(
        &self,
        Parameters(req): Parameters<internal::ScheduleDeleteRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("schedule", "delete", args).await
    }

    #[tool(description = "Validate a cron expression and preview its next fire times.")]
    async fn schedule_validate(
        &self,
        Parameters(req): Parameters<internal::ScheduleValidateRequest>,
    ) -> Result<String, String> {
        let args = serde_json::to_value(&req).map_err(|e| e.to_string())?;
        self.dispatch_internal("schedule", "validate", args).await
    }
}

impl ServerHandler for NcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "ncp".into(),
                title: Some("NCP - one MCP server for all of them".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "NCP multiplexes your MCP servers behind two tools: use find to discover tools \
                 by describing what you want, then run to invoke one by its qualified name."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            // Capture the upstream identity from the session's initialize so
            // downstream connects forward it verbatim. Re-initialize is the
            // only thing that changes it.
            if let Some(info) = context.peer.peer_info() {
                self.orchestrator
                    .set_client_info(
                        info.client_info.name.as_ref(),
                        info.client_info.version.as_ref(),
                    )
                    .await;
            }

            debug!(tool = %request.name, "Upstream tool call");
            let ctx = ToolCallContext::new(self, request, context);
            self.tool_router.call(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_tools_are_only_virtual_and_management() {
        let router: ToolRouter<NcpServer> = NcpServer::tool_router();
        let names: Vec<String> = router
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();

        assert!(names.contains(&"find".to_string()));
        assert!(names.contains(&"run".to_string()));
        assert!(names.contains(&"mcp_add".to_string()));
        assert!(names.contains(&"schedule_create".to_string()));
        // Exactly the virtual + management surface, nothing downstream.
        assert_eq!(names.len(), 12);
    }
}
