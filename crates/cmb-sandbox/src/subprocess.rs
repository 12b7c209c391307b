//! Subprocess backend: the runner script under a restricted JS runtime.
//!
//! The runner is launched with `deno run` plus explicit deny flags for
//! network, environment, FFI, and writes; the script itself needs nothing
//! beyond stdio.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cmb_config::{ExecutorConfig, ExecutorKind};
use tempfile::TempDir;
use tokio::process::Command;

use crate::remote::{RemoteExecutor, RunnerIo, RunnerLauncher, spawn_runner_process};

pub(crate) const RUNNER_SOURCE: &str = include_str!("../runtime/runner.js");
const RUNNER_FILE_NAME: &str = "runner.js";

const DENY_FLAGS: &[&str] = &["--deny-net", "--deny-env", "--deny-ffi", "--deny-write"];

/// Write the embedded runner script into a scratch directory.
///
/// The directory handle must outlive the executor; dropping it deletes the
/// staged script.
pub(crate) fn stage_runner_script() -> Result<(TempDir, PathBuf)> {
    let dir = tempfile::Builder::new()
        .prefix("cmb-runner-")
        .tempdir()
        .context("failed to create runner staging directory")?;
    let path = dir.path().join(RUNNER_FILE_NAME);
    std::fs::write(&path, RUNNER_SOURCE)
        .with_context(|| format!("failed to stage runner script at {}", path.display()))?;
    Ok((dir, path))
}

/// Resolve the restricted runtime binary from config or PATH.
pub(crate) fn resolve_runtime(config: &ExecutorConfig) -> Result<PathBuf> {
    match &config.runtime_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => which::which("deno").context(
            "deno binary not found in PATH; install deno or set executor.runtime_path",
        ),
    }
}

struct DenoLauncher {
    runtime: PathBuf,
    script: PathBuf,
    _staging: TempDir,
}

#[async_trait]
impl RunnerLauncher for DenoLauncher {
    fn label(&self) -> &'static str {
        "subprocess"
    }

    async fn launch(&self) -> Result<RunnerIo> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("run").arg("--quiet").arg("--no-prompt");
        cmd.args(DENY_FLAGS);
        cmd.arg(&self.script);
        spawn_runner_process(cmd).await
    }
}

/// Build the subprocess executor.
pub fn subprocess_executor(config: &ExecutorConfig) -> Result<RemoteExecutor> {
    let runtime = resolve_runtime(config)?;
    let (staging, script) = stage_runner_script()?;
    Ok(RemoteExecutor::new(
        ExecutorKind::Subprocess,
        Box::new(DenoLauncher { runtime, script, _staging: staging }),
        config.timeout_ms,
        config.always_async,
    ))
}
