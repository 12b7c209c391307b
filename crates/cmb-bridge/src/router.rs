use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{Value, json};

use crate::tools::BridgeTools;

/// rmcp-facing handler for one downstream connection.
///
/// Each HTTP connection gets its own router with a fresh session id; the
/// stdio transport uses a single router with no session id, which resolves
/// to the protected singleton.
#[derive(Clone)]
pub struct BridgeRouter {
    tools: Arc<BridgeTools>,
    session_id: Option<String>,
}

impl BridgeRouter {
    pub fn new(tools: Arc<BridgeTools>, session_id: Option<String>) -> Self {
        Self { tools, session_id }
    }
}

impl ServerHandler for BridgeRouter {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = BridgeTools::tool_definitions()
            .into_iter()
            .map(serde_json::from_value::<Tool>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| {
                McpError::internal_error(format!("invalid tool definition: {error}"), None)
            })?;
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.clone().map(Value::Object).unwrap_or_else(|| json!({}));
        let output = self
            .tools
            .call(request.name.as_ref(), args, self.session_id.as_deref())
            .await;
        serde_json::from_value(output.to_wire()).map_err(|error| {
            McpError::internal_error(format!("failed to encode tool result: {error}"), None)
        })
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "code-mode-bridge".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}
