//! Container backends: strongest isolation, reached either through the
//! engine daemon socket or by spawning the engine CLI.
//!
//! Both variants launch the same locked-down container (no network,
//! read-only rootfs, size-capped /tmp tmpfs, all capabilities dropped,
//! non-root user, memory/CPU/pid limits) running the embedded runner
//! script, and both speak the line protocol through the container's stdio.

mod cli;
mod socket;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use cmb_config::{ContainerMode, ExecutorConfig, ExecutorKind};
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::remote::{RemoteExecutor, RunnerLauncher};
use crate::subprocess::stage_runner_script;
use crate::{ExecuteOutcome, SandboxBackend, ToolSet};

/// Fixed in-container path of the read-only runner script mount.
pub(crate) const RUNNER_CONTAINER_PATH: &str = "/opt/codemode/runner.js";
pub(crate) const SANDBOX_USER: &str = "65534:65534";
pub(crate) const LABEL_HOST_PID: &str = "codemode.host-pid";
pub(crate) const LABEL_CREATED_AT: &str = "codemode.created-at";

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const INIT_WINDOW: Duration = Duration::from_secs(10);

pub(crate) fn container_labels() -> HashMap<String, String> {
    HashMap::from([
        (LABEL_HOST_PID.to_string(), std::process::id().to_string()),
        (LABEL_CREATED_AT.to_string(), chrono::Utc::now().to_rfc3339()),
    ])
}

pub(crate) fn runner_command() -> Vec<String> {
    vec![
        "deno".to_string(),
        "run".to_string(),
        "--quiet".to_string(),
        RUNNER_CONTAINER_PATH.to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineAccess {
    Socket,
    Cli,
}

impl fmt::Display for EngineAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => f.write_str("socket"),
            Self::Cli => f.write_str("cli"),
        }
    }
}

/// Container executor with socket-then-CLI init fallback.
///
/// Each failed init attempt disposes its instance before backing off; the
/// aggregated error reports every attempt's elapsed time and message.
pub struct ContainerExecutor {
    kind: ExecutorKind,
    config: ExecutorConfig,
    script: PathBuf,
    _staging: TempDir,
    inner: Mutex<Option<Arc<RemoteExecutor>>>,
    disposed: AtomicBool,
}

impl ContainerExecutor {
    pub fn new(config: &ExecutorConfig, kind: ExecutorKind) -> Result<Self> {
        let (staging, script) = stage_runner_script()?;
        Ok(Self {
            kind,
            config: config.clone(),
            script,
            _staging: staging,
            inner: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    fn access_order(&self) -> Vec<EngineAccess> {
        if self.kind == ExecutorKind::ContainerCli {
            return vec![EngineAccess::Cli];
        }
        match self.config.container.mode {
            ContainerMode::Auto => vec![EngineAccess::Socket, EngineAccess::Cli],
            ContainerMode::Socket => vec![EngineAccess::Socket],
            ContainerMode::Cli => vec![EngineAccess::Cli],
        }
    }

    fn make_launcher(&self, access: EngineAccess) -> Box<dyn RunnerLauncher> {
        match access {
            EngineAccess::Socket => Box::new(socket::SocketLauncher::new(
                self.config.container.clone(),
                self.script.clone(),
            )),
            EngineAccess::Cli => Box::new(cli::CliLauncher::new(
                self.config.container.clone(),
                self.script.clone(),
            )),
        }
    }

    async fn ensure_backend(&self) -> Result<Arc<RemoteExecutor>, String> {
        let mut slot = self.inner.lock().await;
        if let Some(executor) = slot.as_ref() {
            return Ok(executor.clone());
        }

        let mut attempts: Vec<String> = Vec::new();
        for access in self.access_order() {
            let window = Instant::now();
            let mut backoff = INIT_BACKOFF_INITIAL;
            for attempt in 1..=INIT_ATTEMPTS {
                if window.elapsed() > INIT_WINDOW {
                    attempts.push(format!("{access}: init window of {}s exhausted", INIT_WINDOW.as_secs()));
                    break;
                }

                let executor = Arc::new(RemoteExecutor::new(
                    self.kind,
                    self.make_launcher(access),
                    self.config.timeout_ms,
                    self.config.always_async,
                ));
                let started = Instant::now();
                match executor.ensure_ready().await {
                    Ok(()) => {
                        tracing::info!(access = %access, attempt, "container runner ready");
                        *slot = Some(executor.clone());
                        return Ok(executor);
                    }
                    Err(error) => {
                        attempts.push(format!(
                            "{access} attempt {attempt} ({}ms): {error:#}",
                            started.elapsed().as_millis()
                        ));
                        executor.dispose().await;
                        if attempt < INIT_ATTEMPTS {
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                        }
                    }
                }
            }
        }

        Err(format!("container executor failed to initialize: [{}]", attempts.join("; ")))
    }
}

#[async_trait]
impl SandboxBackend for ContainerExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(&self, script: &str, tools: ToolSet) -> ExecuteOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return ExecuteOutcome::failure("Executor disposed");
        }
        match self.ensure_backend().await {
            Ok(executor) => executor.execute(script, tools).await,
            Err(error) => ExecuteOutcome::failure(error),
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let taken = self.inner.lock().await.take();
        if let Some(executor) = taken {
            executor.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(kind: ExecutorKind, mode: ContainerMode) -> ContainerExecutor {
        let mut config = ExecutorConfig::default();
        config.container.mode = mode;
        ContainerExecutor::new(&config, kind).unwrap()
    }

    #[test]
    fn auto_mode_tries_socket_then_cli() {
        let exec = executor(ExecutorKind::Container, ContainerMode::Auto);
        assert_eq!(exec.access_order(), vec![EngineAccess::Socket, EngineAccess::Cli]);
    }

    #[test]
    fn pinned_modes_use_single_access() {
        let socket = executor(ExecutorKind::Container, ContainerMode::Socket);
        assert_eq!(socket.access_order(), vec![EngineAccess::Socket]);

        let cli = executor(ExecutorKind::Container, ContainerMode::Cli);
        assert_eq!(cli.access_order(), vec![EngineAccess::Cli]);
    }

    #[test]
    fn cli_kind_ignores_container_mode() {
        let exec = executor(ExecutorKind::ContainerCli, ContainerMode::Socket);
        assert_eq!(exec.access_order(), vec![EngineAccess::Cli]);
    }

    #[test]
    fn labels_carry_host_pid() {
        let labels = container_labels();
        assert_eq!(labels.get(LABEL_HOST_PID), Some(&std::process::id().to_string()));
        assert!(labels.contains_key(LABEL_CREATED_AT));
    }
}
