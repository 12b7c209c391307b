//! Shared executor framework for out-of-process sandbox runners.
//!
//! A runner is anything that speaks the line-delimited JSON protocol over a
//! pair of byte streams: a child process (subprocess and container-CLI
//! backends) or an attached container (socket backend). This module owns the
//! lifecycle: deduplicated init with a ready handshake, message dispatch,
//! tool-call round-trips, the heartbeat, and dispose with kill escalation.

mod process;

#[cfg(test)]
#[path = "framework_tests.rs"]
mod framework_tests;

pub(crate) use process::spawn_runner_process;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cmb_config::ExecutorKind;
use cmb_protocol::{HostMessage, RuntimeMessage};
use rand::distr::{Alphanumeric, SampleString};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{ExecuteOutcome, SandboxBackend, ToolSet, wrap_script};

/// Interval between host heartbeats; the runner self-terminates at 3x.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long init waits for the runner's ready message.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between the shutdown message and forced termination.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Upper bound on waiting for the supervisor to confirm termination.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(12);
const STDERR_RING_CAPACITY: usize = 100;
const EXEC_ID_SUFFIX_LEN: usize = 6;

pub(crate) fn kill_grace() -> Duration {
    KILL_GRACE
}

/// Ring buffer over the runner's most recent stderr lines.
#[derive(Clone, Default)]
pub struct StderrRing {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Joined buffer contents, empty string when nothing was captured.
    pub fn dump(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Handle used by the framework to force runner termination.
///
/// Signalling the handle asks the supervisor task to wait out the kill grace
/// period and then terminate the runner; `terminate` resolves once the
/// supervisor confirms.
pub struct RunnerKillHandle {
    kill_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl RunnerKillHandle {
    pub fn from_parts(kill_tx: oneshot::Sender<()>, done_rx: oneshot::Receiver<()>) -> Self {
        Self { kill_tx: Some(kill_tx), done_rx: Some(done_rx) }
    }

    /// A handle with nothing to kill, for runners that exit on their own.
    pub fn noop() -> Self {
        Self { kill_tx: None, done_rx: None }
    }

    pub async fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.done_rx.take() {
            let _ = timeout(KILL_CONFIRM_TIMEOUT, rx).await;
        }
    }
}

/// Everything a launched runner hands back to the framework.
pub struct RunnerIo {
    /// Lines written here reach the runner's stdin.
    pub sink: mpsc::Sender<String>,
    /// Lines the runner writes to stdout.
    pub lines: mpsc::Receiver<String>,
    pub stderr: StderrRing,
    /// Set by the supervisor when the runner exits on its own.
    pub exit_reason: Arc<StdMutex<Option<String>>>,
    pub killer: RunnerKillHandle,
}

/// Backend-specific launch hook.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    fn label(&self) -> &'static str;

    async fn launch(&self) -> Result<RunnerIo>;
}

struct Pending {
    id: String,
    fns: ToolSet,
    done: oneshot::Sender<ExecuteOutcome>,
}

/// Per-runner shared state between the executor and its dispatch task.
struct Shared {
    label: &'static str,
    sink: mpsc::Sender<String>,
    stderr: StderrRing,
    exit_reason: Arc<StdMutex<Option<String>>>,
    pending: StdMutex<Option<Pending>>,
    ready: StdMutex<Option<oneshot::Sender<Result<(), String>>>>,
}

impl Shared {
    /// Fail whichever phase is waiting: a pending init, then a pending
    /// execution.
    fn fail(&self, reason: &str) {
        if let Some(ready) = self.ready.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = ready.send(Err(reason.to_string()));
        }
        if let Some(pending) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = pending.done.send(ExecuteOutcome::failure(reason));
        }
    }

    fn complete(&self, id: &str, outcome: ExecuteOutcome) {
        let pending = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|pending| pending.id == id) {
                slot.take()
            } else {
                None
            }
        };
        match pending {
            Some(pending) => {
                let _ = pending.done.send(outcome);
            }
            None => {
                tracing::debug!(
                    executor = self.label,
                    id,
                    "discarding runner output for retired execution id"
                );
            }
        }
    }
}

struct RunnerState {
    heartbeat: JoinHandle<()>,
    reader: JoinHandle<()>,
    killer: RunnerKillHandle,
}

/// Template executor over any [`RunnerLauncher`].
pub struct RemoteExecutor {
    kind: ExecutorKind,
    launcher: Box<dyn RunnerLauncher>,
    timeout_ms: u64,
    always_async: bool,
    disposed: AtomicBool,
    current: Mutex<Option<(Arc<Shared>, RunnerState)>>,
}

impl RemoteExecutor {
    pub fn new(
        kind: ExecutorKind,
        launcher: Box<dyn RunnerLauncher>,
        timeout_ms: u64,
        always_async: bool,
    ) -> Self {
        Self {
            kind,
            launcher,
            timeout_ms,
            always_async,
            disposed: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// Launch the runner and wait for its ready handshake if not already up.
    ///
    /// Concurrent callers serialize on the runner slot, so exactly one launch
    /// happens; a failed launch leaves the slot empty and the next call
    /// starts fresh.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.ready_shared().await.map(|_| ())
    }

    async fn ready_shared(&self) -> Result<Arc<Shared>> {
        let mut slot = self.current.lock().await;
        if let Some((shared, _)) = slot.as_ref() {
            return Ok(shared.clone());
        }

        let label = self.launcher.label();
        let io = self
            .launcher
            .launch()
            .await
            .with_context(|| format!("failed to launch {label} runner"))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            label,
            sink: io.sink.clone(),
            stderr: io.stderr.clone(),
            exit_reason: io.exit_reason.clone(),
            pending: StdMutex::new(None),
            ready: StdMutex::new(Some(ready_tx)),
        });
        let reader = tokio::spawn(dispatch_loop(shared.clone(), io.lines));
        let mut killer = io.killer;

        let ready = timeout(READY_TIMEOUT, ready_rx).await;
        match ready {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => {
                reader.abort();
                killer.terminate().await;
                anyhow::bail!("{label} runner failed to start: {message}");
            }
            Ok(Err(_)) => {
                reader.abort();
                killer.terminate().await;
                anyhow::bail!("{label} runner closed before becoming ready");
            }
            Err(_) => {
                reader.abort();
                killer.terminate().await;
                anyhow::bail!(
                    "{label} runner did not become ready within {}s",
                    READY_TIMEOUT.as_secs()
                );
            }
        }

        let heartbeat = spawn_heartbeat(io.sink.clone());
        let shared_out = shared.clone();
        *slot = Some((shared, RunnerState { heartbeat, reader, killer }));
        tracing::debug!(executor = label, "runner ready");
        Ok(shared_out)
    }
}

#[async_trait]
impl SandboxBackend for RemoteExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(&self, script: &str, tools: ToolSet) -> ExecuteOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return ExecuteOutcome::failure("Executor disposed");
        }

        let shared = match self.ready_shared().await {
            Ok(shared) => shared,
            Err(error) => return ExecuteOutcome::failure(format!("{error:#}")),
        };

        let id = new_execution_id();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.is_some() {
                return ExecuteOutcome::busy();
            }
            *pending = Some(Pending { id: id.clone(), fns: tools.clone(), done: done_tx });
        }

        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        let message = HostMessage::Execute {
            id: id.clone(),
            code: wrap_script(script, self.always_async),
            tools: names,
        };
        if send_message(&shared.sink, &message).await.is_err() {
            shared.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            return ExecuteOutcome::failure("runner channel closed before execution started");
        }

        tokio::select! {
            outcome = done_rx => outcome
                .unwrap_or_else(|_| ExecuteOutcome::failure("execution completion channel dropped")),
            _ = tokio::time::sleep(Duration::from_millis(self.timeout_ms)) => {
                // Abandon the pending execution; late output for this id is
                // discarded by the id check in `Shared::complete`.
                let mut slot = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                if slot.as_ref().is_some_and(|p| p.id == id) {
                    slot.take();
                }
                drop(slot);
                ExecuteOutcome::timeout(self.timeout_ms)
            }
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let taken = self.current.lock().await.take();
        let Some((shared, mut state)) = taken else {
            return;
        };

        if let Some(pending) = shared.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = pending.done.send(ExecuteOutcome::failure("Executor disposed"));
        }
        state.heartbeat.abort();
        let _ = send_message(&shared.sink, &HostMessage::Shutdown).await;
        state.killer.terminate().await;
        state.reader.abort();
        tracing::debug!(executor = shared.label, "runner disposed");
    }
}

fn spawn_heartbeat(sink: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if send_message(&sink, &HostMessage::Heartbeat).await.is_err() {
                break;
            }
        }
    })
}

async fn send_message(sink: &mpsc::Sender<String>, message: &HostMessage) -> Result<()> {
    let line = serde_json::to_string(message).context("failed to encode host message")?;
    sink.send(line).await.map_err(|_| anyhow::anyhow!("runner sink closed"))
}

/// Consume runner stdout lines and route each message.
async fn dispatch_loop(shared: Arc<Shared>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<RuntimeMessage>(trimmed) {
            Ok(message) => handle_message(&shared, message),
            Err(_) => {
                // A non-JSON stdout line signals a crashed runner.
                let mut reason =
                    format!("{} runner emitted non-JSON output: {}", shared.label, preview(trimmed));
                append_stderr(&mut reason, &shared.stderr);
                tracing::warn!(executor = shared.label, "{reason}");
                shared.fail(&reason);
                return;
            }
        }
    }

    let exit = shared
        .exit_reason
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(|| "runner exited unexpectedly".to_string());
    let mut reason = format!("{} {exit}", shared.label);
    append_stderr(&mut reason, &shared.stderr);
    shared.fail(&reason);
}

fn handle_message(shared: &Arc<Shared>, message: RuntimeMessage) {
    match message {
        RuntimeMessage::Ready => {
            if let Some(ready) = shared.ready.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = ready.send(Ok(()));
            }
        }
        RuntimeMessage::ToolCall { id, name, args } => handle_tool_call(shared, id, name, args),
        RuntimeMessage::Result { id, result, logs } => {
            shared.complete(
                &id,
                ExecuteOutcome { result: Some(result), error: None, logs: logs.unwrap_or_default() },
            );
        }
        RuntimeMessage::Error { id: Some(id), error, logs } => {
            shared.complete(
                &id,
                ExecuteOutcome {
                    result: None,
                    error: Some(error.message().to_string()),
                    logs: logs.unwrap_or_default(),
                },
            );
        }
        RuntimeMessage::Error { id: None, error, .. } => {
            let reason = format!("{} runner failed: {}", shared.label, error.message());
            tracing::warn!(executor = shared.label, error = error.message(), "fatal runner error");
            shared.fail(&reason);
        }
    }
}

fn handle_tool_call(shared: &Arc<Shared>, id: String, name: String, args: Value) {
    let fns = {
        let pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.as_ref() {
            Some(pending) => pending.fns.clone(),
            None => {
                tracing::debug!(executor = shared.label, id, name, "tool call with no pending execution");
                return;
            }
        }
    };

    let sink = shared.sink.clone();
    match fns.get(&name).cloned() {
        None => {
            let mut available: Vec<&str> = fns.keys().map(String::as_str).collect();
            available.sort_unstable();
            let error =
                format!("Tool '{name}' not found. Available tools: {}", available.join(", "));
            tokio::spawn(async move {
                let _ = send_message(&sink, &HostMessage::ToolError { id, error }).await;
            });
        }
        Some(callable) => {
            tokio::spawn(async move {
                let args = match args {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                let reply = match callable(args).await {
                    Ok(result) => HostMessage::ToolResult { id, result },
                    Err(error) => HostMessage::ToolError { id, error: format!("{error:#}") },
                };
                let _ = send_message(&sink, &reply).await;
            });
        }
    }
}

fn new_execution_id() -> String {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), EXEC_ID_SUFFIX_LEN);
    format!("exec-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

fn append_stderr(reason: &mut String, stderr: &StderrRing) {
    let dump = stderr.dump();
    if !dump.is_empty() {
        reason.push_str("\nrunner stderr:\n");
        reason.push_str(&dump);
    }
}

fn preview(line: &str) -> String {
    let mut preview: String = line.chars().take(120).collect();
    if preview.len() < line.len() {
        preview.push_str("...");
    }
    preview
}
