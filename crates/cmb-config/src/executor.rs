use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TOOL_CALL_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_ISOLATE_MEMORY_MB: u64 = 128;
const DEFAULT_CONTAINER_IMAGE: &str = "denoland/deno:alpine";
const DEFAULT_CONTAINER_MEMORY_MB: u64 = 256;
const DEFAULT_CONTAINER_CPUS: f64 = 1.0;
const DEFAULT_CONTAINER_PIDS: u32 = 64;
const DEFAULT_CONTAINER_TMPFS_MB: u64 = 64;

/// Which sandbox backend to run scripts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Probe availability and pick the best backend.
    #[default]
    Auto,
    /// In-process QuickJS with JS-level hardening only.
    MicroVm,
    /// In-process QuickJS with a hard memory cap and interrupt deadline.
    Isolate,
    /// Container attached through the engine daemon socket, falling back to
    /// the CLI per the container retry policy.
    Container,
    /// Container spawned through the engine CLI only.
    ContainerCli,
    /// Child process running a restricted JS runtime.
    Subprocess,
}

impl ExecutorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::MicroVm => "micro-vm",
            Self::Isolate => "isolate",
            Self::Container => "container",
            Self::ContainerCli => "container-cli",
            Self::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "micro-vm" => Ok(Self::MicroVm),
            "isolate" => Ok(Self::Isolate),
            "container" => Ok(Self::Container),
            "container-cli" => Ok(Self::ContainerCli),
            "subprocess" => Ok(Self::Subprocess),
            other => Err(format!(
                "unknown executor kind '{other}' (expected auto, micro-vm, isolate, \
                 container, container-cli, or subprocess)"
            )),
        }
    }
}

/// How the chosen executor kind was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    Explicit,
    AutoDetected,
}

/// Container engine access mode for the container backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerMode {
    /// Try the daemon socket first, then the CLI.
    #[default]
    Auto,
    /// Daemon socket only.
    Socket,
    /// CLI only.
    Cli,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    pub mode: ContainerMode,
    pub image: String,
    /// Explicit daemon socket path; platform default when absent.
    pub socket_path: Option<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
    pub tmpfs_mb: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            mode: ContainerMode::Auto,
            image: DEFAULT_CONTAINER_IMAGE.to_string(),
            socket_path: None,
            memory_mb: DEFAULT_CONTAINER_MEMORY_MB,
            cpus: DEFAULT_CONTAINER_CPUS,
            pids: DEFAULT_CONTAINER_PIDS,
            tmpfs_mb: DEFAULT_CONTAINER_TMPFS_MB,
        }
    }
}

/// Sandbox execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Per-execution wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// Budget for a single sandbox-issued tool call.
    pub tool_call_timeout_ms: u64,
    /// Heap cap for the isolate backend.
    pub memory_limit_mb: u64,
    /// Wrap synchronous callables in an async IIFE instead of invoking them
    /// directly.
    pub always_async: bool,
    /// Explicit path to the restricted runtime binary for the subprocess
    /// backend; resolved from PATH when absent.
    pub runtime_path: Option<String>,
    pub container: ContainerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Auto,
            timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            tool_call_timeout_ms: DEFAULT_TOOL_CALL_TIMEOUT_MS,
            memory_limit_mb: DEFAULT_ISOLATE_MEMORY_MB,
            always_async: false,
            runtime_path: None,
            container: ContainerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_labels() {
        for kind in [
            ExecutorKind::Auto,
            ExecutorKind::MicroVm,
            ExecutorKind::Isolate,
            ExecutorKind::Container,
            ExecutorKind::ContainerCli,
            ExecutorKind::Subprocess,
        ] {
            assert_eq!(kind.label().parse::<ExecutorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected_with_choices() {
        let err = "vm8".parse::<ExecutorKind>().unwrap_err();
        assert!(err.contains("unknown executor kind"));
        assert!(err.contains("container-cli"));
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.kind, ExecutorKind::Auto);
        assert_eq!(cfg.timeout(), Duration::from_millis(30_000));
        assert_eq!(cfg.container.mode, ContainerMode::Auto);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ExecutorConfig = toml::from_str(
            r#"
            kind = "isolate"
            timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.kind, ExecutorKind::Isolate);
        assert_eq!(cfg.timeout_ms, 500);
        assert_eq!(cfg.memory_limit_mb, 128);
    }
}
