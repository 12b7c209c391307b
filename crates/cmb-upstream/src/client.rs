//! One managed MCP client connection, owned by a queue worker task.
//!
//! Commands arrive over an mpsc channel and are served against the rmcp
//! service; the worker owns the transport so no lock is held across an
//! upstream round-trip.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cmb_config::{UpstreamServerConfig, UpstreamTransport};
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use rmcp::service::{RunningService, ServiceExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Cloneable handle to the connection's queue worker.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    server_name: String,
    sender: mpsc::Sender<ClientCommand>,
}

enum ClientCommand {
    CallTool(CallToolRequestParam, oneshot::Sender<Result<CallToolResult>>),
    Shutdown(oneshot::Sender<()>),
}

impl ClientHandle {
    pub(crate) async fn call_tool(&self, request: CallToolRequestParam) -> Result<CallToolResult> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ClientCommand::CallTool(request, tx))
            .await
            .map_err(|_| anyhow!("MCP client queue stopped: {}", self.server_name))?;
        rx.await.context("MCP client worker dropped the response channel")?
    }

    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(ClientCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Connect, list the server's tools, and spawn the owning worker.
pub(crate) async fn connect(config: &UpstreamServerConfig) -> Result<(ClientHandle, Vec<Tool>)> {
    let transport = ClientTransport::connect(config).await?;
    let tools = transport
        .service()
        .list_tools(None)
        .await
        .with_context(|| format!("failed to list tools on MCP server '{}'", config.name))?
        .tools;

    let (sender, mut receiver) = mpsc::channel::<ClientCommand>(COMMAND_QUEUE_CAPACITY);
    let server_name = config.name.clone();
    let worker_name = server_name.clone();
    tokio::spawn(async move {
        let mut transport = Some(transport);
        while let Some(command) = receiver.recv().await {
            match command {
                ClientCommand::CallTool(request, response) => {
                    let result = match transport.as_ref() {
                        Some(transport) => transport
                            .service()
                            .call_tool(request)
                            .await
                            .map_err(|error| anyhow!(error)),
                        None => Err(anyhow!("MCP client already shut down: {worker_name}")),
                    };
                    let _ = response.send(result);
                }
                ClientCommand::Shutdown(response) => {
                    if let Some(transport) = transport.take() {
                        transport.shutdown().await;
                    }
                    let _ = response.send(());
                    break;
                }
            }
        }
        if let Some(transport) = transport.take() {
            transport.shutdown().await;
        }
        tracing::debug!(server = %worker_name, "MCP client worker stopped");
    });

    Ok((ClientHandle { server_name, sender }, tools))
}

/// Unified connection to an upstream MCP server.
enum ClientTransport {
    /// Child process communicating over stdio (JSON-RPC on stdin/stdout).
    Stdio {
        service: RunningService<RoleClient, ()>,
        child: Box<tokio::process::Child>,
    },
    /// Remote server via Streamable HTTP (also serves legacy SSE entries).
    Http {
        service: RunningService<RoleClient, ()>,
    },
}

impl ClientTransport {
    async fn connect(config: &UpstreamServerConfig) -> Result<Self> {
        match &config.transport {
            UpstreamTransport::Stdio { command, args, env } => {
                Self::spawn_stdio(&config.name, command, args, env).await
            }
            UpstreamTransport::Http { url, .. } | UpstreamTransport::Sse { url, .. } => {
                Self::connect_http(&config.name, url).await
            }
        }
    }

    fn service(&self) -> &RunningService<RoleClient, ()> {
        match self {
            Self::Stdio { service, .. } => service,
            Self::Http { service, .. } => service,
        }
    }

    async fn shutdown(self) {
        match self {
            Self::Stdio { service, mut child } => {
                let _ = service.cancel().await;
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(error = %error, "failed to wait MCP child process");
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            Self::Http { service } => {
                let _ = service.cancel().await;
            }
        }
    }

    async fn spawn_stdio(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{name}' (command: {command})"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{name}'"))?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("failed to handshake with MCP server '{name}'"))?;

        Ok(Self::Stdio { service, child: Box::new(child) })
    }

    async fn connect_http(name: &str, url: &str) -> Result<Self> {
        use rmcp::transport::StreamableHttpClientTransport;

        tracing::info!(server = %name, url = %url, "connecting to HTTP MCP server");
        let transport = StreamableHttpClientTransport::from_uri(url);
        let service: RunningService<RoleClient, ()> = ()
            .serve(transport)
            .await
            .with_context(|| format!("failed to connect to HTTP MCP server '{name}' at {url}"))?;

        Ok(Self::Http { service })
    }
}
