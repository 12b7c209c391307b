use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use cmb_config::ExecutorKind;
use cmb_protocol::{HostCallable, HostMessage};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{RemoteExecutor, RunnerIo, RunnerKillHandle, RunnerLauncher, StderrRing};
use crate::{BUSY_ERROR, SandboxBackend, ToolSet};

/// Test-side handles for one launched fake runner.
struct FakeIo {
    from_host: mpsc::Receiver<String>,
    to_host: mpsc::Sender<String>,
}

impl FakeIo {
    async fn recv_host(&mut self) -> HostMessage {
        let line = tokio::time::timeout(Duration::from_secs(5), self.from_host.recv())
            .await
            .expect("timed out waiting for host message")
            .expect("host channel closed");
        serde_json::from_str(&line).expect("host sent invalid JSON")
    }

    /// Receive host messages until one that is not a heartbeat arrives.
    async fn recv_host_skipping_heartbeats(&mut self) -> HostMessage {
        loop {
            match self.recv_host().await {
                HostMessage::Heartbeat => continue,
                other => return other,
            }
        }
    }

    async fn send_runtime(&self, value: Value) {
        self.to_host.send(value.to_string()).await.expect("runner channel closed");
    }
}

struct FakeLauncher {
    io_tx: mpsc::Sender<FakeIo>,
    ready: bool,
    stderr_lines: Vec<String>,
    first_line: Option<String>,
}

impl FakeLauncher {
    fn new(io_tx: mpsc::Sender<FakeIo>) -> Self {
        Self { io_tx, ready: true, stderr_lines: Vec::new(), first_line: None }
    }
}

#[async_trait]
impl RunnerLauncher for FakeLauncher {
    fn label(&self) -> &'static str {
        "fake"
    }

    async fn launch(&self) -> Result<RunnerIo> {
        let (sink_tx, sink_rx) = mpsc::channel(64);
        let (line_tx, line_rx) = mpsc::channel(64);
        let stderr = StderrRing::new();
        for line in &self.stderr_lines {
            stderr.push(line.clone());
        }
        if let Some(first) = &self.first_line {
            line_tx.send(first.clone()).await.ok();
        }
        if self.ready {
            line_tx.send(json!({"type": "ready"}).to_string()).await.ok();
        }
        self.io_tx
            .send(FakeIo { from_host: sink_rx, to_host: line_tx })
            .await
            .expect("test dropped io receiver");
        Ok(RunnerIo {
            sink: sink_tx,
            lines: line_rx,
            stderr,
            exit_reason: Arc::new(StdMutex::new(None)),
            killer: RunnerKillHandle::noop(),
        })
    }
}

fn executor_with(launcher: FakeLauncher, timeout_ms: u64) -> Arc<RemoteExecutor> {
    Arc::new(RemoteExecutor::new(
        ExecutorKind::Subprocess,
        Box::new(launcher),
        timeout_ms,
        false,
    ))
}

fn add_tool() -> HostCallable {
    Arc::new(|args: Vec<Value>| {
        Box::pin(async move {
            let obj = args.first().cloned().unwrap_or(Value::Null);
            let a = obj.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = obj.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
    })
}

fn failing_tool(message: &'static str) -> HostCallable {
    Arc::new(move |_args: Vec<Value>| Box::pin(async move { anyhow::bail!(message) }))
}

fn tools(entries: Vec<(&str, HostCallable)>) -> ToolSet {
    Arc::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<HashMap<_, _>>())
}

fn exec_id(message: &HostMessage) -> String {
    match message {
        HostMessage::Execute { id, .. } => id.clone(),
        other => panic!("expected execute, got {other:?}"),
    }
}

#[tokio::test]
async fn arithmetic_tool_round_trip() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);
        match &execute {
            HostMessage::Execute { code, tools, .. } => {
                assert!(code.contains("host.test__add"));
                assert_eq!(tools, &vec!["test__add".to_string()]);
            }
            other => panic!("expected execute, got {other:?}"),
        }

        io.send_runtime(json!({
            "type": "tool-call", "id": "t1", "name": "test__add", "args": [{"a": 5, "b": 3}],
        }))
        .await;

        match io.recv_host_skipping_heartbeats().await {
            HostMessage::ToolResult { id, result } => {
                assert_eq!(id, "t1");
                assert_eq!(result, json!(8));
            }
            other => panic!("expected tool-result, got {other:?}"),
        }

        io.send_runtime(json!({"type": "result", "id": id, "result": 8, "logs": ["hi"]})).await;
    });

    let outcome = executor
        .execute("async () => await host.test__add({a:5,b:3})", tools(vec![("test__add", add_tool())]))
        .await;
    responder.await.unwrap();

    assert_eq!(outcome.error, None);
    assert_eq!(outcome.result, Some(json!(8)));
    assert_eq!(outcome.logs, vec!["hi"]);
}

#[tokio::test]
async fn concurrent_execute_returns_busy() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);
        tokio::time::sleep(Duration::from_millis(300)).await;
        io.send_runtime(json!({"type": "result", "id": id, "result": 1})).await;
    });

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.execute("async () => 1", tools(vec![])).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = executor.execute("async () => 2", tools(vec![])).await;

    assert_eq!(second.error.as_deref(), Some(BUSY_ERROR));
    let first = first.await.unwrap();
    assert_eq!(first.result, Some(json!(1)));
    responder.await.unwrap();
}

#[tokio::test]
async fn timeout_resolves_quickly_and_executor_stays_usable() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 200);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        // First execution: never answered.
        let _ = io.recv_host_skipping_heartbeats().await;
        // Second execution: answered promptly.
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);
        io.send_runtime(json!({"type": "result", "id": id, "result": "ok"})).await;
    });

    let started = Instant::now();
    let outcome = executor.execute("async () => new Promise(() => {})", tools(vec![])).await;
    assert_eq!(outcome.error.as_deref(), Some("Code execution timeout after 200ms"));
    assert!(started.elapsed() < Duration::from_millis(1_000));

    let second = executor.execute("async () => 'ok'", tools(vec![])).await;
    assert_eq!(second.result, Some(json!("ok")));
    responder.await.unwrap();
}

#[tokio::test]
async fn unknown_tool_gets_error_listing_available_tools() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);

        io.send_runtime(json!({
            "type": "tool-call", "id": "t9", "name": "missing__tool", "args": [],
        }))
        .await;

        let error = match io.recv_host_skipping_heartbeats().await {
            HostMessage::ToolError { id, error } => {
                assert_eq!(id, "t9");
                error
            }
            other => panic!("expected tool-error, got {other:?}"),
        };
        io.send_runtime(json!({"type": "error", "id": id, "error": error})).await;
    });

    let outcome = executor.execute("async () => 1", tools(vec![("test__add", add_tool())])).await;
    responder.await.unwrap();

    let error = outcome.error.unwrap();
    assert!(error.contains("Tool 'missing__tool' not found"), "got: {error}");
    assert!(error.contains("Available tools: test__add"), "got: {error}");
}

#[tokio::test]
async fn failed_tool_call_surfaces_as_tool_error() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);

        io.send_runtime(json!({
            "type": "tool-call", "id": "t1", "name": "api__down", "args": [{}],
        }))
        .await;

        match io.recv_host_skipping_heartbeats().await {
            HostMessage::ToolError { error, .. } => {
                assert!(error.contains("upstream unavailable"), "got: {error}");
            }
            other => panic!("expected tool-error, got {other:?}"),
        }
        io.send_runtime(json!({"type": "result", "id": id, "result": null})).await;
    });

    let outcome = executor
        .execute("async () => host.api__down({})", tools(vec![("api__down", failing_tool("upstream unavailable"))]))
        .await;
    responder.await.unwrap();
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn stale_execution_id_output_is_discarded() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let execute = io.recv_host_skipping_heartbeats().await;
        let id = exec_id(&execute);
        io.send_runtime(json!({"type": "result", "id": "exec-0-stale", "result": "wrong"})).await;
        io.send_runtime(json!({"type": "result", "id": id, "result": "right"})).await;
    });

    let outcome = executor.execute("async () => 'x'", tools(vec![])).await;
    responder.await.unwrap();
    assert_eq!(outcome.result, Some(json!("right")));
}

#[tokio::test]
async fn fatal_runner_error_rejects_pending_execution() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let _ = io.recv_host_skipping_heartbeats().await;
        io.send_runtime(json!({"type": "error", "error": {"message": "isolate crashed"}})).await;
    });

    let outcome = executor.execute("async () => 1", tools(vec![])).await;
    responder.await.unwrap();
    assert!(outcome.error.unwrap().contains("isolate crashed"));
}

#[tokio::test]
async fn non_json_output_fails_init_with_stderr_ring() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let mut launcher = FakeLauncher::new(io_tx);
    launcher.ready = false;
    launcher.first_line = Some("Segmentation fault".to_string());
    launcher.stderr_lines = vec!["boot diagnostics".to_string()];
    let executor = executor_with(launcher, 5_000);

    // Keep the io receiver alive so launch does not error out.
    let _keep = tokio::spawn(async move { io_rx.recv().await });

    let error = executor.ensure_ready().await.unwrap_err().to_string();
    assert!(error.contains("non-JSON"), "got: {error}");
}

#[tokio::test]
async fn dispose_rejects_pending_and_sends_shutdown() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 10_000);

    let (saw_shutdown_tx, saw_shutdown_rx) = tokio::sync::oneshot::channel();
    let responder = tokio::spawn(async move {
        let mut io = io_rx.recv().await.unwrap();
        let _ = io.recv_host_skipping_heartbeats().await;
        loop {
            match io.recv_host_skipping_heartbeats().await {
                HostMessage::Shutdown => {
                    let _ = saw_shutdown_tx.send(());
                    break;
                }
                other => panic!("expected shutdown, got {other:?}"),
            }
        }
    });

    let running = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.execute("async () => new Promise(() => {})", tools(vec![])).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.dispose().await;

    let outcome = running.await.unwrap();
    assert_eq!(outcome.error.as_deref(), Some("Executor disposed"));
    saw_shutdown_rx.await.unwrap();
    responder.await.unwrap();

    // Dispose is idempotent, and a disposed executor refuses work.
    executor.dispose().await;
    let refused = executor.execute("async () => 1", tools(vec![])).await;
    assert_eq!(refused.error.as_deref(), Some("Executor disposed"));
}

#[tokio::test]
async fn heartbeat_arrives_after_ready() {
    let (io_tx, mut io_rx) = mpsc::channel(4);
    let executor = executor_with(FakeLauncher::new(io_tx), 5_000);

    executor.ensure_ready().await.unwrap();
    let mut io = io_rx.recv().await.unwrap();
    // The interval's first tick fires immediately after init.
    match io.recv_host().await {
        HostMessage::Heartbeat => {}
        other => panic!("expected heartbeat, got {other:?}"),
    }
    executor.dispose().await;
}
