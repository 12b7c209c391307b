//! Child-process plumbing for runner processes.
//!
//! Used by the subprocess backend and the container-CLI backend, both of
//! which talk to a runner through a spawned child's stdio.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::{RunnerIo, RunnerKillHandle, StderrRing, kill_grace};

const SINK_QUEUE: usize = 64;
const LINE_QUEUE: usize = 256;

/// Spawn a runner child process and wire its stdio into a [`RunnerIo`].
///
/// The child is isolated in its own process group so forced termination can
/// target the whole group, and `kill_on_drop` backstops supervisor failures.
pub(crate) async fn spawn_runner_process(mut cmd: Command) -> Result<RunnerIo> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().context("failed to spawn runner process")?;

    let mut stdin = child.stdin.take().context("failed to capture runner stdin")?;
    let stdout = child.stdout.take().context("failed to capture runner stdout")?;
    let stderr = child.stderr.take().context("failed to capture runner stderr")?;

    let (sink_tx, mut sink_rx) = mpsc::channel::<String>(SINK_QUEUE);
    tokio::spawn(async move {
        while let Some(line) = sink_rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                break;
            }
        }
    });

    let (line_tx, line_rx) = mpsc::channel::<String>(LINE_QUEUE);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let ring = StderrRing::new();
    let stderr_ring = ring.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            stderr_ring.push(line);
        }
    });

    let exit_reason: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let (kill_tx, kill_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    let supervisor_reason = exit_reason.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                record_exit(&supervisor_reason, status);
            }
            _ = kill_rx => {
                // The framework already sent the shutdown message; give the
                // runner the grace window before force-killing the group.
                match timeout(kill_grace(), child.wait()).await {
                    Ok(status) => record_exit(&supervisor_reason, status),
                    Err(_) => {
                        kill_process_group(&mut child);
                        let _ = child.wait().await;
                        *supervisor_reason.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some("runner killed after shutdown grace period".to_string());
                    }
                }
            }
        }
        let _ = done_tx.send(());
    });

    Ok(RunnerIo {
        sink: sink_tx,
        lines: line_rx,
        stderr: ring,
        exit_reason,
        killer: RunnerKillHandle::from_parts(kill_tx, done_rx),
    })
}

fn record_exit(
    slot: &Arc<StdMutex<Option<String>>>,
    status: std::io::Result<std::process::ExitStatus>,
) {
    let reason = match status {
        Ok(status) => match status.code() {
            Some(code) => format!("runner exited with status {code}"),
            None => "runner terminated by signal".to_string(),
        },
        Err(error) => format!("failed to reap runner: {error}"),
    };
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
}

fn kill_child_process_group_fallback(child: &mut Child) {
    let _ = child.start_kill();
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative PID targets the
            // process group created by setsid in pre_exec.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }

    kill_child_process_group_fallback(child);
}
