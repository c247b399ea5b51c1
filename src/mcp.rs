//! MCP server implementation using rmcp.
//!
//! Exposes snippet execution as a single `execute` tool.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::service::{ExecuteRequest, ExecuteService};

/// MCP server for sandboxed snippet execution.
#[derive(Clone)]
pub struct SandboxServer {
    service: Arc<ExecuteService>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Slug of the published snippet to run")]
    pub slug: String,

    #[schemars(description = "Opaque session token; executions are rate limited per session")]
    pub session_token: String,
}

#[tool_router]
impl SandboxServer {
    pub fn new(service: Arc<ExecuteService>) -> Self {
        Self {
            service,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a verified snippet in the sandbox.
    #[tool(description = "Run a verified, published Perl snippet in an isolated container")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let reply = self
            .service
            .handle(ExecuteRequest {
                slug: Some(params.slug),
                session_token: Some(params.session_token),
            })
            .await;

        info!(status = reply.status, "Execute tool finished");

        let body = Content::text(reply.body.to_string());
        if reply.is_success() {
            Ok(CallToolResult::success(vec![body]))
        } else {
            Ok(CallToolResult::error(vec![body]))
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "perlcode-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Run published Perl snippets in a locked-down container.\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - slug: the snippet to run\n\
                 - session_token: identifies the caller for daily limits\n\
                 \n\
                 The reply is JSON with stdout, stderr, exitCode, runtimeMs, \
                 perlVersion and the remaining daily executions."
                    .into(),
            ),
        }
    }
}

/// Serve the execute tool over stdio.
pub async fn serve_stdio(service: Arc<ExecuteService>) -> anyhow::Result<()> {
    let server = SandboxServer::new(service);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
