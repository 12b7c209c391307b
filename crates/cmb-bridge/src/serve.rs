//! Downstream transports: a JSON-RPC 2.0 stdio loop for the single-client
//! case and an SSE/HTTP endpoint for multi-client use.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use cmb_config::{BridgeConfig, HttpConfig};
use cmb_session::new_session_id;
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::router::BridgeRouter;
use crate::tools::{BridgeTools, build_bridge};

const SSE_PATH: &str = "/";
const SSE_POST_PATH: &str = "/message";
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Build the bridge from config and serve until shutdown.
pub async fn run_bridge(config: BridgeConfig, http: bool) -> Result<()> {
    // Under stdio there is exactly one client, so the singleton session is
    // protected from idle eviction.
    let tools = build_bridge(&config, !http)?;

    if http {
        let endpoint = HttpEndpoint::start(&config.http, tools.clone()).await?;
        tracing::info!(addr = %endpoint.addr, "bridge listening over HTTP");
        tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
        endpoint.shutdown().await;
    } else {
        tracing::info!("bridge serving on stdio");
        tokio::select! {
            result = serve_stdio(tools.clone()) => result?,
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    tools.sessions().dispose_all().await;
    tools.upstream().disconnect_all().await;
    Ok(())
}

/// JSON-RPC 2.0 request.
#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
    id: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", result: Some(result), error: None, id }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0", result: None, error: Some(JsonRpcError { code, message }), id }
    }
}

/// Serve MCP over stdin/stdout. Returns when stdin closes.
pub async fn serve_stdio(tools: Arc<BridgeTools>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(error) => {
                let response = JsonRpcResponse::error(None, -32700, format!("Parse error: {error}"));
                write_response(&mut stdout, &response).await?;
                continue;
            }
        };

        // Notifications get no response.
        if request.method.starts_with("notifications/") {
            continue;
        }

        let response = handle_request(&tools, request).await;
        write_response(&mut stdout, &response).await?;
    }

    tracing::info!("stdin closed, stdio server shutting down");
    Ok(())
}

async fn handle_request(tools: &Arc<BridgeTools>, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "code-mode-bridge",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "ping" => JsonRpcResponse::result(id, json!({})),
        "tools/list" => {
            JsonRpcResponse::result(id, json!({"tools": BridgeTools::tool_definitions()}))
        }
        "tools/call" => {
            let params = request.params.unwrap_or_else(|| json!({}));
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return JsonRpcResponse::error(id, -32602, "Missing tool name".to_string());
            };
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            // No session id on stdio: every call lands on the singleton.
            let output = tools.call(name, arguments, None).await;
            JsonRpcResponse::result(id, output.to_wire())
        }
        "shutdown" => JsonRpcResponse::result(id, json!({})),
        other => {
            JsonRpcResponse::error(id, -32601, format!("Method not found: {other}"))
        }
    }
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> Result<()> {
    let line = serde_json::to_string(response).context("failed to serialize response")?;
    stdout.write_all(line.as_bytes()).await.context("failed to write response")?;
    stdout.write_all(b"\n").await.context("failed to write newline")?;
    stdout.flush().await.context("failed to flush stdout")?;
    Ok(())
}

/// SSE/HTTP endpoint; each connection gets its own bridge session.
pub struct HttpEndpoint {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl HttpEndpoint {
    pub async fn start(config: &HttpConfig, tools: Arc<BridgeTools>) -> Result<Self> {
        let bind_addr = format!("{}:{}", config.bind, config.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!("invalid HTTP bind address '{}:{}'", config.bind, config.port)
            })?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind HTTP endpoint at {bind_addr}"))?;
        let local_addr =
            listener.local_addr().context("failed to resolve local HTTP address")?;

        let shutdown = CancellationToken::new();
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: local_addr,
            sse_path: SSE_PATH.to_string(),
            post_path: SSE_POST_PATH.to_string(),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });
        let _server_ct = sse_server.with_service_directly(move || {
            BridgeRouter::new(tools.clone(), Some(new_session_id()))
        });

        let app = sse_router.layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES));
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "HTTP server stopped with error");
            }
        });

        Ok(Self { addr: local_addr, shutdown, server_task })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "HTTP server join failed");
        }
    }
}
