use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutorConfig;
use crate::upstream::UpstreamServerConfig;

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 0;
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle budget before a non-protected session's executor is disposed.
    pub idle_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: DEFAULT_HTTP_BIND.to_string(), port: DEFAULT_HTTP_PORT }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    #[serde(rename = "servers")]
    pub servers: Vec<UpstreamServerConfig>,
    pub executor: ExecutorConfig,
    pub session: SessionConfig,
    pub http: HttpConfig,
}

impl BridgeConfig {
    /// Load from an explicit path, or from the default location when absent.
    ///
    /// A missing default file yields the built-in defaults (no upstream
    /// servers); a missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => {
                let default = default_config_path()?;
                if default.exists() {
                    Self::load_file(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                bail!("upstream server entries must have a non-empty name");
            }
            if !seen.insert(server.name.as_str()) {
                bail!("duplicate upstream server name: {}", server.name);
            }
        }
        Ok(())
    }
}

/// Default config path: `~/.config/cmb/config.toml` (platform equivalent).
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "cmb")
        .context("failed to determine project directories")?;
    Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
}
