//! Container backend attached through the engine daemon socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::service::HostConfig;
use cmb_config::ContainerConfig;
use futures::StreamExt;
use rand::distr::{Alphanumeric, SampleString};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use super::{RUNNER_CONTAINER_PATH, SANDBOX_USER, container_labels, runner_command};
use crate::remote::{RunnerIo, RunnerKillHandle, RunnerLauncher, StderrRing, kill_grace};

const DAEMON_TIMEOUT_SECS: u64 = 120;
const SINK_QUEUE: usize = 64;
const LINE_QUEUE: usize = 256;

pub(super) struct SocketLauncher {
    config: ContainerConfig,
    script: PathBuf,
}

impl SocketLauncher {
    pub(super) fn new(config: ContainerConfig, script: PathBuf) -> Self {
        Self { config, script }
    }

    fn connect(&self) -> Result<Docker> {
        match &self.config.socket_path {
            Some(path) => Docker::connect_with_unix(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("failed to connect to container engine at {path}")),
            None => Docker::connect_with_local_defaults()
                .context("failed to connect to container engine daemon"),
        }
    }

    fn container_config(&self) -> Config<String> {
        let host_config = HostConfig {
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,size={}m", self.config.tmpfs_mb),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            memory: Some((self.config.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(i64::from(self.config.pids)),
            binds: Some(vec![format!("{}:{}:ro", self.script.display(), RUNNER_CONTAINER_PATH)]),
            auto_remove: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(runner_command()),
            user: Some(SANDBOX_USER.to_string()),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            labels: Some(container_labels()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RunnerLauncher for SocketLauncher {
    fn label(&self) -> &'static str {
        "container-socket"
    }

    async fn launch(&self) -> Result<RunnerIo> {
        let docker = self.connect()?;
        docker.ping().await.context("container engine daemon did not answer ping")?;

        let name = format!(
            "codemode-{}",
            Alphanumeric.sample_string(&mut rand::rng(), 8).to_lowercase()
        );
        let created = docker
            .create_container(
                Some(CreateContainerOptions { name: name.clone(), platform: None }),
                self.container_config(),
            )
            .await
            .context("failed to create sandbox container")?;
        let id = created.id;

        // Attach before start so no runner output is missed.
        let attach = docker
            .attach_container(
                &id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
            .context("failed to attach to sandbox container")?;
        docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start sandbox container")?;

        let AttachContainerResults { mut output, mut input } = attach;

        let (sink_tx, mut sink_rx) = mpsc::channel::<String>(SINK_QUEUE);
        tokio::spawn(async move {
            while let Some(line) = sink_rx.recv().await {
                if input.write_all(line.as_bytes()).await.is_err()
                    || input.write_all(b"\n").await.is_err()
                    || input.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let (line_tx, line_rx) = mpsc::channel::<String>(LINE_QUEUE);
        let ring = StderrRing::new();
        let reader_ring = ring.clone();
        tokio::spawn(async move {
            let mut stdout_lines = LineAssembler::default();
            let mut stderr_lines = LineAssembler::default();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        for line in stdout_lines.push(&message) {
                            if line_tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        for line in stderr_lines.push(&message) {
                            reader_ring.push(line);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let exit_reason: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let supervisor_reason = exit_reason.clone();
        let supervisor_docker = docker.clone();
        let supervisor_id = id.clone();
        tokio::spawn(async move {
            let mut wait = supervisor_docker
                .wait_container(&supervisor_id, None::<WaitContainerOptions<String>>);
            tokio::select! {
                status = wait.next() => {
                    let reason = match status {
                        Some(Ok(body)) => format!("runner container exited with status {}", body.status_code),
                        Some(Err(error)) => format!("runner container wait failed: {error}"),
                        None => "runner container exited".to_string(),
                    };
                    *supervisor_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
                }
                _ = kill_rx => {
                    let grace = i64::try_from(kill_grace().as_secs()).unwrap_or(5);
                    let _ = supervisor_docker
                        .stop_container(&supervisor_id, Some(StopContainerOptions { t: grace }))
                        .await;
                    let _ = supervisor_docker
                        .remove_container(
                            &supervisor_id,
                            Some(RemoveContainerOptions { force: true, ..Default::default() }),
                        )
                        .await;
                    *supervisor_reason.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some("runner container stopped".to_string());
                }
            }
            let _ = done_tx.send(());
        });

        tracing::debug!(container = %name, "sandbox container started");
        Ok(RunnerIo {
            sink: sink_tx,
            lines: line_rx,
            stderr: ring,
            exit_reason,
            killer: RunnerKillHandle::from_parts(kill_tx, done_rx),
        })
    }
}

/// Reassembles newline-delimited text from arbitrary byte chunks.
#[derive(Default)]
struct LineAssembler {
    buf: String,
}

impl LineAssembler {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_splits_across_chunks() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push(b"{\"type\":\"rea").is_empty());
        assert_eq!(assembler.push(b"dy\"}\n{\"a\":1}\n"), vec![r#"{"type":"ready"}"#, r#"{"a":1}"#]);
    }

    #[test]
    fn assembler_strips_carriage_returns() {
        let mut assembler = LineAssembler::default();
        assert_eq!(assembler.push(b"hello\r\n"), vec!["hello"]);
    }

    #[test]
    fn container_config_is_locked_down() {
        let launcher =
            SocketLauncher::new(ContainerConfig::default(), PathBuf::from("/tmp/runner.js"));
        let config = launcher.container_config();
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(config.user.as_deref(), Some("65534:65534"));
        assert_eq!(config.tty, Some(false));
        let labels = config.labels.unwrap();
        assert!(labels.contains_key("codemode.host-pid"));
    }
}
