//! Container backend reached through the engine CLI.
//!
//! Runs `docker run -i` as a child process, so the runner's stdio plumbing
//! is identical to the subprocess backend.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cmb_config::ContainerConfig;
use tokio::process::Command;

use super::{RUNNER_CONTAINER_PATH, SANDBOX_USER, container_labels, runner_command};
use crate::remote::{RunnerIo, RunnerLauncher, spawn_runner_process};

const ENGINE_BINARY: &str = "docker";

pub(super) struct CliLauncher {
    config: ContainerConfig,
    script: PathBuf,
}

impl CliLauncher {
    pub(super) fn new(config: ContainerConfig, script: PathBuf) -> Self {
        Self { config, script }
    }

    fn build_command(&self, engine: PathBuf) -> Command {
        let mut cmd = Command::new(engine);
        cmd.arg("run").arg("-i").arg("--rm");
        cmd.args(["--network", "none"]);
        cmd.arg("--read-only");
        cmd.arg("--tmpfs");
        cmd.arg(format!("/tmp:rw,size={}m", self.config.tmpfs_mb));
        cmd.args(["--cap-drop", "ALL"]);
        cmd.args(["--user", SANDBOX_USER]);
        cmd.arg("--memory");
        cmd.arg(format!("{}m", self.config.memory_mb));
        cmd.arg("--cpus");
        cmd.arg(self.config.cpus.to_string());
        cmd.arg("--pids-limit");
        cmd.arg(self.config.pids.to_string());
        for (key, value) in container_labels() {
            cmd.arg("--label");
            cmd.arg(format!("{key}={value}"));
        }
        cmd.arg("-v");
        cmd.arg(format!("{}:{}:ro", self.script.display(), RUNNER_CONTAINER_PATH));
        cmd.arg(&self.config.image);
        cmd.args(runner_command());
        cmd
    }
}

#[async_trait]
impl RunnerLauncher for CliLauncher {
    fn label(&self) -> &'static str {
        "container-cli"
    }

    async fn launch(&self) -> Result<RunnerIo> {
        let engine = which::which(ENGINE_BINARY)
            .with_context(|| format!("{ENGINE_BINARY} binary not found in PATH"))?;
        spawn_runner_process(self.build_command(engine)).await
    }
}
