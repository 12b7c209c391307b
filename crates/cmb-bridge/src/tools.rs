//! The five downstream bridge tools.

use std::sync::Arc;

use anyhow::Result;
use cmb_config::BridgeConfig;
use cmb_protocol::{EvalBlock, split_qualified, validate_eval_return};
use cmb_sandbox::select_executor;
use cmb_search::{ToolSearchIndex, render_declaration};
use cmb_session::{ExecutorFactory, SessionResolver};
use cmb_upstream::UpstreamManager;
use serde_json::{Value, json};

use crate::sandbox_manager::{RegistrySync, SandboxManager};
use crate::utils_tools::{UTILS_NAMESPACE, utils_descriptors};

pub const TOOL_EVAL: &str = "sandbox_eval_js";
pub const TOOL_SEARCH: &str = "sandbox_search_functions";
pub const TOOL_LIST: &str = "sandbox_get_functions";
pub const TOOL_SCHEMA: &str = "sandbox_get_function_schema";
pub const TOOL_STATUS: &str = "bridge_status";

const DEFAULT_SEARCH_LIMIT: usize = 10;

/// MCP-wire-shaped tool output: content blocks plus the error flag.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolOutput {
    fn text(text: impl Into<String>) -> Self {
        Self { content: vec![json!({"type": "text", "text": text.into()})], is_error: false }
    }

    fn error(text: impl Into<String>) -> Self {
        Self { content: vec![json!({"type": "text", "text": text.into()})], is_error: true }
    }

    fn pretty_json(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self::text(text)
    }

    /// Wire form consumed by both downstream transports.
    pub fn to_wire(&self) -> Value {
        json!({"content": self.content, "isError": self.is_error})
    }
}

/// Façade over the sandbox registry, session resolver, search index, and
/// upstream manager.
pub struct BridgeTools {
    sandbox: SandboxManager,
    upstream: UpstreamManager,
    search: Arc<ToolSearchIndex>,
    sessions: SessionResolver,
}

/// Wire the whole bridge together from configuration.
///
/// Under a single-connection transport (stdio) the singleton session is
/// protected from idle eviction; under HTTP it participates normally.
pub fn build_bridge(config: &BridgeConfig, singleton_protected: bool) -> Result<Arc<BridgeTools>> {
    let sandbox = SandboxManager::new();
    let search = Arc::new(ToolSearchIndex::new());
    let upstream = UpstreamManager::new();
    upstream.add_sink(Arc::new(RegistrySync { sandbox: sandbox.clone(), search: search.clone() }));
    upstream.register_server(UTILS_NAMESPACE, utils_descriptors());

    for server in &config.servers {
        upstream.connect_server_in_background(&server.name, server.clone(), None);
    }

    let executor_config = config.executor.clone();
    let factory: ExecutorFactory = Arc::new(move || {
        let executor_config = executor_config.clone();
        Box::pin(async move {
            let selection = select_executor(&executor_config)?;
            Ok((selection.backend, selection.info))
        })
    });
    let sessions =
        SessionResolver::new(factory, config.session.idle_timeout(), singleton_protected);

    Ok(Arc::new(BridgeTools { sandbox, upstream, search, sessions }))
}

impl BridgeTools {
    #[cfg(test)]
    pub(crate) fn with_parts(
        sandbox: SandboxManager,
        upstream: UpstreamManager,
        search: Arc<ToolSearchIndex>,
        sessions: SessionResolver,
    ) -> Self {
        Self { sandbox, upstream, search, sessions }
    }

    pub fn sessions(&self) -> &SessionResolver {
        &self.sessions
    }

    pub fn upstream(&self) -> &UpstreamManager {
        &self.upstream
    }

    /// Tool definitions in MCP wire shape (`name`, `description`,
    /// `inputSchema`).
    pub fn tool_definitions() -> Vec<Value> {
        vec![
            json!({
                "name": TOOL_EVAL,
                "description": "Evaluate a JavaScript snippet in an isolated sandbox. Upstream tools \
                    are exposed as async callables on the frozen `host` object \
                    (host.namespace__tool(args)). The script must return a content block: \
                    {type:'text'|'image'|'audio'|'json', ...} or an array of blocks.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Script source: an async callable expression or raw statements"}
                    },
                    "required": ["code"]
                }
            }),
            json!({
                "name": TOOL_SEARCH,
                "description": "Search the available sandbox functions by keyword (BM25 over names and descriptions).",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search keywords"},
                        "limit": {"type": "number", "description": "Maximum results (default 10)"}
                    },
                    "required": ["query"]
                }
            }),
            json!({
                "name": TOOL_LIST,
                "description": "List available sandbox functions with their descriptions.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "namespace": {"type": "string", "description": "Restrict to one upstream namespace"}
                    }
                }
            }),
            json!({
                "name": TOOL_SCHEMA,
                "description": "Type declaration for a single sandbox function.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Qualified function name (namespace__tool)"}
                    },
                    "required": ["name"]
                }
            }),
            json!({
                "name": TOOL_STATUS,
                "description": "Bridge status: executor info, per-namespace tool counts, and upstream connection states.",
                "inputSchema": {"type": "object", "properties": {}}
            }),
        ]
    }

    /// Dispatch one downstream tool call.
    pub async fn call(&self, name: &str, args: Value, session_id: Option<&str>) -> ToolOutput {
        match name {
            TOOL_EVAL => self.eval_js(&args, session_id).await,
            TOOL_SEARCH => self.search_functions(&args),
            TOOL_LIST => self.get_functions(&args),
            TOOL_SCHEMA => self.get_function_schema(&args),
            TOOL_STATUS => self.status(),
            other => ToolOutput::error(format!("Unknown tool: {other}")),
        }
    }

    async fn eval_js(&self, args: &Value, session_id: Option<&str>) -> ToolOutput {
        let Some(code) = args.get("code").and_then(Value::as_str) else {
            return ToolOutput::error("missing required argument: code");
        };

        let executor = match self.sessions.resolve(session_id).await {
            Ok(executor) => executor,
            Err(error) => return ToolOutput::error(format!("{error:#}")),
        };

        let outcome = self.sandbox.run_code_with_executor(executor.as_ref(), code).await;
        if let Some(error) = outcome.error {
            let mut output = ToolOutput::error(error);
            append_logs(&mut output, &outcome.logs);
            return output;
        }

        let returned = outcome.result.unwrap_or(Value::Null);
        let blocks = match validate_eval_return(&returned) {
            Ok(blocks) => blocks,
            Err(error) => {
                let mut output = ToolOutput::error(error.to_string());
                append_logs(&mut output, &outcome.logs);
                return output;
            }
        };

        let mut output = ToolOutput {
            content: blocks.iter().map(block_to_content).collect(),
            is_error: false,
        };
        append_logs(&mut output, &outcome.logs);
        output
    }

    fn search_functions(&self, args: &Value) -> ToolOutput {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return ToolOutput::error("missing required argument: query");
        };
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|limit| limit as usize)
            .unwrap_or(DEFAULT_SEARCH_LIMIT);

        let results = self.search.search(query, limit);
        ToolOutput::pretty_json(&json!({"query": query, "results": results}))
    }

    fn get_functions(&self, args: &Value) -> ToolOutput {
        let namespace = args.get("namespace").and_then(Value::as_str);
        let functions = self.sandbox.get_tool_list(namespace);
        ToolOutput::pretty_json(&json!({"functions": functions}))
    }

    fn get_function_schema(&self, args: &Value) -> ToolOutput {
        let Some(name) = args.get("name").and_then(Value::as_str) else {
            return ToolOutput::error("missing required argument: name");
        };
        let Some((namespace, tool)) = split_qualified(name) else {
            return ToolOutput::error(format!(
                "'{name}' is not a qualified function name (expected namespace__tool)"
            ));
        };
        let Some(descriptor) = self.sandbox.get_registered_tool(namespace, tool) else {
            return ToolOutput::error(format!("Unknown function: {name}"));
        };
        ToolOutput::text(render_declaration(name, &descriptor.raw_schema))
    }

    fn status(&self) -> ToolOutput {
        let payload = json!({
            "executor": self.sessions.singleton_info(),
            "sessions": self.sessions.session_count(),
            "namespaces": self.sandbox.get_namespace_info(),
            "servers": self.upstream.get_connection_states(),
        });
        ToolOutput::pretty_json(&payload)
    }
}

fn block_to_content(block: &EvalBlock) -> Value {
    match block {
        EvalBlock::Text { text } => json!({"type": "text", "text": text}),
        EvalBlock::Image { data, mime_type } => {
            json!({"type": "image", "data": data, "mimeType": mime_type})
        }
        EvalBlock::Audio { data, mime_type } => {
            json!({"type": "audio", "data": data, "mimeType": mime_type})
        }
        EvalBlock::Json { value } => {
            let text =
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            json!({"type": "text", "text": text})
        }
    }
}

fn append_logs(output: &mut ToolOutput, logs: &[String]) {
    if logs.is_empty() {
        return;
    }
    output.content.push(json!({
        "type": "text",
        "text": format!("Console output:\n{}", logs.join("\n")),
    }));
}

#[cfg(test)]
#[path = "tools_tests.rs"]
mod tests;
