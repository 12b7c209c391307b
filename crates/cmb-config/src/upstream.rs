use std::collections::HashMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

/// Transport used to reach one upstream MCP server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamTransport {
    /// Spawn a child process communicating over stdio (JSON-RPC on
    /// stdin/stdout).
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a remote MCP server via Streamable HTTP.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Connect to a remote MCP server via legacy SSE.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl UpstreamTransport {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }
}

/// One upstream server entry from the config file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpstreamServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: UpstreamTransport,
    /// This server completes an OAuth flow during connect; failures that
    /// look like a pending authorization suspend retries instead of
    /// backing off.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oauth: bool,
    /// Override for the background-connect attempt budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl UpstreamServerConfig {
    pub fn is_stdio(&self) -> bool {
        matches!(&self.transport, UpstreamTransport::Stdio { .. })
    }
}

/// Custom deserializer for backward-compatible server entries.
///
/// Handles three cases:
/// 1. Explicit `type` field → deserialize the matching transport variant.
/// 2. No `type` field + has `command` → auto-detect as `stdio`.
/// 3. Anything else → error naming the missing field.
impl<'de> Deserialize<'de> for UpstreamServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            transport_type: Option<String>,
            // Stdio fields
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            // Http/Sse fields
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            #[serde(default)]
            oauth: bool,
            max_retries: Option<u32>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let name = raw.name;

        let transport = match raw.transport_type.as_deref() {
            Some("stdio") | None if raw.command.is_some() => UpstreamTransport::Stdio {
                command: raw.command.unwrap_or_default(),
                args: raw.args,
                env: raw.env,
            },
            Some("stdio") => {
                return Err(D::Error::custom(format!(
                    "server '{name}': stdio transport requires a 'command' field"
                )));
            }
            Some(kind @ ("http" | "sse")) => {
                let Some(url) = raw.url else {
                    return Err(D::Error::custom(format!(
                        "server '{name}': {kind} transport requires a 'url' field"
                    )));
                };
                if kind == "http" {
                    UpstreamTransport::Http { url, headers: raw.headers }
                } else {
                    UpstreamTransport::Sse { url, headers: raw.headers }
                }
            }
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "server '{name}': unknown transport type '{other}' \
                     (expected stdio, http, or sse)"
                )));
            }
            None => {
                return Err(D::Error::custom(format!(
                    "server '{name}': missing 'type' field and no 'command' to \
                     auto-detect stdio"
                )));
            }
        };

        Ok(UpstreamServerConfig {
            name,
            transport,
            oauth: raw.oauth,
            max_retries: raw.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_stdio_entry_parses() {
        let cfg: UpstreamServerConfig = toml::from_str(
            r#"
            name = "github"
            type = "stdio"
            command = "gh-mcp"
            args = ["--stdio"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name, "github");
        assert_eq!(cfg.transport.label(), "stdio");
        assert!(!cfg.oauth);
    }

    #[test]
    fn bare_command_auto_detects_stdio() {
        let cfg: UpstreamServerConfig = toml::from_str(
            r#"
            name = "local"
            command = "my-server"
            "#,
        )
        .unwrap();
        assert!(cfg.is_stdio());
    }

    #[test]
    fn http_requires_url() {
        let err = toml::from_str::<UpstreamServerConfig>(
            r#"
            name = "remote"
            type = "http"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires a 'url' field"));
    }

    #[test]
    fn sse_entry_parses_with_headers() {
        let cfg: UpstreamServerConfig = toml::from_str(
            r#"
            name = "legacy"
            type = "sse"
            url = "https://example.com/sse"
            oauth = true
            max_retries = 3

            [headers]
            Authorization = "Bearer token"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.transport.label(), "sse");
        assert!(cfg.oauth);
        assert_eq!(cfg.max_retries, Some(3));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = toml::from_str::<UpstreamServerConfig>(
            r#"
            name = "bad"
            type = "websocket"
            url = "wss://example.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown transport type"));
    }
}
