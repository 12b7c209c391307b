//! Executor selection: explicit override or availability-probed auto pick.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use cmb_config::{ExecutorConfig, ExecutorKind, SelectionReason};

use crate::container::ContainerExecutor;
use crate::subprocess::{resolve_runtime, subprocess_executor};
use crate::{ExecutorInfo, SandboxBackend};

const DEFAULT_ENGINE_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub kind: ExecutorKind,
    pub available: bool,
    pub detail: String,
}

pub struct ExecutorSelection {
    pub backend: Arc<dyn SandboxBackend>,
    pub info: ExecutorInfo,
}

/// Build a backend instance for the configured kind.
///
/// `Auto` probes in preference order: isolate (when the in-process engine is
/// compiled in), container, subprocess, micro-VM.
pub fn select_executor(config: &ExecutorConfig) -> Result<ExecutorSelection> {
    let (kind, reason) = match config.kind {
        ExecutorKind::Auto => (auto_pick(config)?, SelectionReason::AutoDetected),
        explicit => (explicit, SelectionReason::Explicit),
    };

    let backend = build_backend(kind, config)?;
    Ok(ExecutorSelection {
        backend,
        info: ExecutorInfo { kind, reason, timeout_ms: config.timeout_ms },
    })
}

fn auto_pick(config: &ExecutorConfig) -> Result<ExecutorKind> {
    if cfg!(feature = "quickjs") {
        return Ok(ExecutorKind::Isolate);
    }
    if engine_available(config) {
        return Ok(ExecutorKind::Container);
    }
    if resolve_runtime(config).is_ok() {
        return Ok(ExecutorKind::Subprocess);
    }
    bail!(
        "no executor backend available: built without the quickjs feature, no container \
         engine reachable, and no restricted JS runtime found in PATH"
    )
}

fn build_backend(kind: ExecutorKind, config: &ExecutorConfig) -> Result<Arc<dyn SandboxBackend>> {
    match kind {
        ExecutorKind::Auto => unreachable!("auto resolved before build"),
        #[cfg(feature = "quickjs")]
        ExecutorKind::MicroVm => Ok(Arc::new(crate::quickjs::MicroVmExecutor::new(config))),
        #[cfg(feature = "quickjs")]
        ExecutorKind::Isolate => Ok(Arc::new(crate::quickjs::IsolateExecutor::new(config))),
        #[cfg(not(feature = "quickjs"))]
        ExecutorKind::MicroVm | ExecutorKind::Isolate => {
            bail!("executor kind '{kind}' requires the quickjs feature")
        }
        ExecutorKind::Container | ExecutorKind::ContainerCli => {
            Ok(Arc::new(ContainerExecutor::new(config, kind)?))
        }
        ExecutorKind::Subprocess => Ok(Arc::new(subprocess_executor(config)?)),
    }
}

fn engine_available(config: &ExecutorConfig) -> bool {
    let socket = config
        .container
        .socket_path
        .clone()
        .unwrap_or_else(|| DEFAULT_ENGINE_SOCKET.to_string());
    Path::new(&socket).exists() || which::which("docker").is_ok()
}

/// Availability report for every backend, for diagnostics.
pub fn probe_backends(config: &ExecutorConfig) -> Vec<ProbeReport> {
    let engine = engine_available(config);
    let runtime = resolve_runtime(config);
    vec![
        ProbeReport {
            kind: ExecutorKind::Isolate,
            available: cfg!(feature = "quickjs"),
            detail: if cfg!(feature = "quickjs") {
                "in-process engine compiled in".to_string()
            } else {
                "built without the quickjs feature".to_string()
            },
        },
        ProbeReport {
            kind: ExecutorKind::MicroVm,
            available: cfg!(feature = "quickjs"),
            detail: if cfg!(feature = "quickjs") {
                "in-process engine compiled in".to_string()
            } else {
                "built without the quickjs feature".to_string()
            },
        },
        ProbeReport {
            kind: ExecutorKind::Container,
            available: engine,
            detail: if engine {
                "container engine reachable".to_string()
            } else {
                "no engine socket and no docker binary in PATH".to_string()
            },
        },
        ProbeReport {
            kind: ExecutorKind::Subprocess,
            available: runtime.is_ok(),
            detail: match &runtime {
                Ok(path) => format!("runtime at {}", path.display()),
                Err(error) => format!("{error:#}"),
            },
        },
    ]
}
