use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use cmb_config::UpstreamServerConfig;
use cmb_protocol::{HostCallable, sanitize_name};
use rand::Rng;
use regex::Regex;
use rmcp::model::{CallToolRequestParam, Tool};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::client::{self, ClientHandle};
use crate::descriptor::{ToolDescriptor, ToolListEntry, ToolRegistrySink};
use crate::states::{ServerConnectionInfo, ServerConnectionState};

const DEFAULT_MAX_RETRIES: u32 = 5;
const RETRY_DELAY_BASE_MS: u64 = 1000;
const RETRY_DELAY_CAP_MS: u64 = 30_000;
const RETRY_JITTER_MS: u64 = 1000;
const OAUTH_REQUIRED_ERROR: &str = "OAuth authorization required";

/// Failure messages that indicate a pending OAuth flow rather than a dead
/// server. Policy knob, not a contract.
const OAUTH_ERROR_PATTERN: &str = r"(?i)authorization timeout|oauth";

fn oauth_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(OAUTH_ERROR_PATTERN).expect("static pattern compiles"))
}

/// Runs once after a background connect succeeds; its own failure is logged,
/// never propagated.
pub type ConnectedCallback = Box<dyn FnOnce() -> Result<()> + Send>;

struct ServerEntry {
    config: Option<UpstreamServerConfig>,
    client: Option<ClientHandle>,
    tools: HashMap<String, ToolDescriptor>,
    info: ServerConnectionInfo,
    retry: Option<CancellationToken>,
}

impl ServerEntry {
    fn placeholder(config: Option<UpstreamServerConfig>, max_attempts: u32) -> Self {
        Self {
            config,
            client: None,
            tools: HashMap::new(),
            info: ServerConnectionInfo::new(max_attempts),
            retry: None,
        }
    }
}

struct Inner {
    servers: StdMutex<HashMap<String, ServerEntry>>,
    sinks: StdMutex<Vec<Arc<dyn ToolRegistrySink>>>,
}

/// Registry of upstream MCP clients with background reconnect.
#[derive(Clone)]
pub struct UpstreamManager {
    inner: Arc<Inner>,
}

impl Default for UpstreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                servers: StdMutex::new(HashMap::new()),
                sinks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Register an observer that receives tool-set changes.
    pub fn add_sink(&self, sink: Arc<dyn ToolRegistrySink>) {
        self.inner.sinks.lock().unwrap_or_else(|e| e.into_inner()).push(sink);
    }

    /// Blocking connect. Registers tools on success; logs and returns false
    /// on failure.
    pub async fn connect_server(&self, name: &str, config: UpstreamServerConfig) -> bool {
        self.cancel_retry(name);
        let max_attempts = config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        self.update_info(name, Some(config.clone()), max_attempts, |info| {
            info.state = ServerConnectionState::Connecting;
            info.attempt = 1;
        });

        match self.connect_attempt(name, &config).await {
            Ok(()) => true,
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(server = %name, error = %message, "MCP server connect failed");
                self.record_failure(name, &config, &message, max_attempts);
                false
            }
        }
    }

    /// Fire-and-forget connect with exponential-backoff retry.
    ///
    /// A re-issued call for the same name cancels any pending retry first.
    /// OAuth-classified failures suspend retries and leave the server in
    /// `awaiting-auth` until the user completes the flow.
    pub fn connect_server_in_background(
        &self,
        name: &str,
        config: UpstreamServerConfig,
        on_connected: Option<ConnectedCallback>,
    ) {
        self.cancel_retry(name);
        let max_attempts = config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let token = CancellationToken::new();
        {
            let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            let entry = servers
                .entry(name.to_string())
                .or_insert_with(|| ServerEntry::placeholder(Some(config.clone()), max_attempts));
            entry.config = Some(config.clone());
            entry.info.max_attempts = max_attempts;
            entry.info.state = ServerConnectionState::Connecting;
            entry.retry = Some(token.clone());
        }

        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut callback = on_connected;
            for attempt in 0..max_attempts {
                if token.is_cancelled() {
                    return;
                }
                manager.update_info(&name, None, max_attempts, |info| {
                    info.state = ServerConnectionState::Connecting;
                    info.attempt = attempt + 1;
                    info.next_retry_at = None;
                });

                match manager.connect_attempt(&name, &config).await {
                    Ok(()) => {
                        if let Some(callback) = callback.take() {
                            if let Err(error) = callback() {
                                tracing::warn!(
                                    server = %name,
                                    error = %format!("{error:#}"),
                                    "on-connected callback failed"
                                );
                            }
                        }
                        return;
                    }
                    Err(error) => {
                        let message = format!("{error:#}");
                        if is_oauth_failure(config.oauth, &message) {
                            tracing::warn!(server = %name, "OAuth flow required; suspending retries");
                            manager.update_info(&name, None, max_attempts, |info| {
                                info.state = ServerConnectionState::AwaitingAuth;
                                info.last_error = Some(OAUTH_REQUIRED_ERROR.to_string());
                                info.next_retry_at = None;
                            });
                            return;
                        }
                        if attempt + 1 < max_attempts {
                            let delay = retry_delay(attempt);
                            tracing::warn!(
                                server = %name,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %message,
                                "MCP server connect failed, retrying"
                            );
                            manager.update_info(&name, None, max_attempts, |info| {
                                info.last_error = Some(message.clone());
                                info.next_retry_at =
                                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                            });
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        } else {
                            tracing::warn!(
                                server = %name,
                                attempts = max_attempts,
                                error = %message,
                                "MCP server connect failed permanently"
                            );
                            manager.update_info(&name, None, max_attempts, |info| {
                                info.state = ServerConnectionState::Failed;
                                info.last_error = Some(format!(
                                    "failed after {max_attempts} attempt(s): {message}"
                                ));
                                info.next_retry_at = None;
                            });
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Cancel any pending retry, close the client, and drop the entry.
    pub async fn disconnect_server(&self, name: &str) {
        self.cancel_retry(name);
        let removed = {
            let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            servers.remove(name)
        };
        if let Some(entry) = removed {
            if let Some(client) = entry.client {
                client.shutdown().await;
            }
            self.notify_removed(name);
            tracing::info!(server = %name, "MCP server disconnected");
        }
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = {
            let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            servers.keys().cloned().collect()
        };
        for name in names {
            self.disconnect_server(&name).await;
        }
    }

    /// Install a virtual server with pre-built descriptors (no upstream
    /// client behind it).
    pub fn register_server(&self, name: &str, tools: Vec<ToolDescriptor>) {
        let mut tool_map = HashMap::new();
        for tool in tools {
            if tool_map.insert(tool.name.clone(), tool).is_some() {
                tracing::warn!(server = %name, "duplicate sanitized tool name in virtual server");
            }
        }
        {
            let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            let mut entry = ServerEntry::placeholder(None, 0);
            entry.info.state = ServerConnectionState::Connected;
            entry.tools = tool_map;
            servers.insert(name.to_string(), entry);
        }
        self.notify_changed(name);
        tracing::info!(server = %name, "virtual server registered");
    }

    /// Flat map of qualified tool name to descriptor across all servers.
    pub fn get_all_tool_descriptors(&self) -> HashMap<String, ToolDescriptor> {
        let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = HashMap::new();
        for (server, entry) in servers.iter() {
            for (tool, descriptor) in &entry.tools {
                all.insert(format!("{server}__{tool}"), descriptor.clone());
            }
        }
        all
    }

    /// Point-in-time snapshot of every tracked server's connection info.
    pub fn get_connection_states(&self) -> HashMap<String, ServerConnectionInfo> {
        let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        servers.iter().map(|(name, entry)| (name.clone(), entry.info.clone())).collect()
    }

    pub fn get_tool_list(&self, server_filter: Option<&str>) -> Vec<ToolListEntry> {
        let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ToolListEntry> = servers
            .iter()
            .filter(|(name, _)| server_filter.is_none_or(|filter| filter == name.as_str()))
            .flat_map(|(name, entry)| {
                entry.tools.iter().map(move |(tool, descriptor)| ToolListEntry {
                    server: name.clone(),
                    name: format!("{name}__{tool}"),
                    description: descriptor.description.clone(),
                })
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get_tool_by_name(&self, qualified: &str) -> Option<ToolDescriptor> {
        let (server, tool) = cmb_protocol::split_qualified(qualified)?;
        let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        servers.get(server)?.tools.get(tool).cloned()
    }

    async fn connect_attempt(&self, name: &str, config: &UpstreamServerConfig) -> Result<()> {
        let (handle, tools) = client::connect(config).await?;
        let descriptors = build_descriptors(name, &handle, &tools);
        let count = descriptors.len();
        {
            let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            let max_attempts = config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
            let mut entry = ServerEntry::placeholder(Some(config.clone()), max_attempts);
            entry.client = Some(handle);
            entry.tools = descriptors;
            entry.info.state = ServerConnectionState::Connected;
            // Replaced atomically: readers see the old entry or the new one.
            servers.insert(name.to_string(), entry);
        }
        self.notify_changed(name);
        tracing::info!(server = %name, tools = count, "MCP server connected");
        Ok(())
    }

    fn record_failure(
        &self,
        name: &str,
        config: &UpstreamServerConfig,
        message: &str,
        max_attempts: u32,
    ) {
        if is_oauth_failure(config.oauth, message) {
            self.update_info(name, None, max_attempts, |info| {
                info.state = ServerConnectionState::AwaitingAuth;
                info.last_error = Some(OAUTH_REQUIRED_ERROR.to_string());
            });
        } else {
            self.update_info(name, None, max_attempts, |info| {
                info.state = ServerConnectionState::Failed;
                info.last_error = Some(message.to_string());
            });
        }
    }

    fn cancel_retry(&self, name: &str) {
        let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = servers.get_mut(name) {
            if let Some(token) = entry.retry.take() {
                token.cancel();
            }
        }
    }

    fn update_info(
        &self,
        name: &str,
        config: Option<UpstreamServerConfig>,
        max_attempts: u32,
        apply: impl FnOnce(&mut ServerConnectionInfo),
    ) {
        let mut servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = servers
            .entry(name.to_string())
            .or_insert_with(|| ServerEntry::placeholder(config, max_attempts));
        apply(&mut entry.info);
    }

    fn notify_changed(&self, name: &str) {
        let tools: Vec<ToolDescriptor> = {
            let servers = self.inner.servers.lock().unwrap_or_else(|e| e.into_inner());
            servers.get(name).map(|entry| entry.tools.values().cloned().collect()).unwrap_or_default()
        };
        let sinks: Vec<Arc<dyn ToolRegistrySink>> =
            self.inner.sinks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in sinks {
            sink.tools_changed(name, tools.clone());
        }
    }

    fn notify_removed(&self, name: &str) {
        let sinks: Vec<Arc<dyn ToolRegistrySink>> =
            self.inner.sinks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in sinks {
            sink.namespace_removed(name);
        }
    }
}

/// Wrap every upstream tool as a descriptor whose execute proxies through
/// the managed client.
fn build_descriptors(
    namespace: &str,
    handle: &ClientHandle,
    tools: &[Tool],
) -> HashMap<String, ToolDescriptor> {
    let mut descriptors = HashMap::new();
    for tool in tools {
        // Field access through the serialized form keeps this robust across
        // wire-protocol revisions of the SDK's Tool model.
        let value = serde_json::to_value(tool).unwrap_or_default();
        let upstream_name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_schema = value
            .get("inputSchema")
            .cloned()
            .or_else(|| value.get("input_schema").cloned())
            .unwrap_or_else(|| json!({"type": "object"}));
        let output_schema =
            value.get("outputSchema").cloned().or_else(|| value.get("output_schema").cloned());

        let sanitized = sanitize_name(&upstream_name);
        let qualified = format!("{namespace}__{sanitized}");
        let execute = proxy_callable(handle.clone(), upstream_name.clone(), qualified.clone());

        let descriptor = ToolDescriptor {
            name: sanitized.clone(),
            upstream_name,
            description,
            raw_schema: raw_schema.clone(),
            input_schema: raw_schema,
            output_schema,
            execute,
        };
        if descriptors.insert(sanitized, descriptor).is_some() {
            tracing::warn!(tool = %qualified, "sanitized tool name collision, keeping the last");
        }
    }
    descriptors
}

fn proxy_callable(handle: ClientHandle, upstream_name: String, qualified: String) -> HostCallable {
    Arc::new(move |args: Vec<Value>| {
        let handle = handle.clone();
        let upstream_name = upstream_name.clone();
        let qualified = qualified.clone();
        Box::pin(async move {
            let arguments = args.into_iter().next().unwrap_or(Value::Null);
            let args_bytes = arguments.to_string().len();
            let mut request = CallToolRequestParam::new(upstream_name);
            request.arguments = arguments.as_object().cloned();
            let result = handle.call_tool(request).await?;
            let value = serde_json::to_value(&result)
                .map_err(|error| anyhow!("failed to encode tool result: {error}"))?;
            tracing::debug!(
                tool = %qualified,
                args_bytes,
                result_bytes = value.to_string().len(),
                "proxied tool call"
            );
            if value.get("isError").and_then(Value::as_bool).unwrap_or(false) {
                let message = first_text_content(&value)
                    .unwrap_or_else(|| "tool reported an error".to_string());
                bail!("{message}");
            }
            Ok(value)
        })
    })
}

fn first_text_content(result: &Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::to_string)
}

fn is_oauth_failure(oauth_enabled: bool, message: &str) -> bool {
    oauth_enabled && oauth_pattern().is_match(message)
}

/// Exponential backoff with jitter: `min(1000·2^attempt, 30000)` plus up to
/// one second of uniform noise.
fn retry_delay(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
    Duration::from_millis(retry_delay_base_ms(attempt) + jitter)
}

fn retry_delay_base_ms(attempt: u32) -> u64 {
    RETRY_DELAY_BASE_MS
        .saturating_mul(1u64 << attempt.min(31))
        .min(RETRY_DELAY_CAP_MS)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
