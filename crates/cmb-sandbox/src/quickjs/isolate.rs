//! In-process isolate backend: hard memory cap, interrupt deadline, and
//! notification-pattern tool calls.
//!
//! A host-registered synchronous callback assigns each tool call an integer
//! id and spawns the async host invocation; completions are deposited into
//! the sandbox-side `_toolResults` / `_toolErrors` ghost objects and a
//! resolver script wakes the matching pending promise. A per-call timeout
//! aborts a stuck call without killing the sandbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cmb_config::{ExecutorConfig, ExecutorKind};
use rquickjs::function::Func;
use rquickjs::{Context, Object, Promise, Runtime};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    CONSOLE_JS, DriveOutcome, HARDEN_JS, LogSink, PumpState, drive_promise, exception_message,
    install_interrupt, json_to_js, set_tool_names,
};
use crate::{ExecuteOutcome, SandboxBackend, ToolSet, wrap_script};

const MAX_STACK_SIZE: usize = 512 * 1024;

/// Builds the frozen `host` object over the notification-pattern stub and
/// installs the sandbox-side pending-resolver table.
const BIND_HOST_JS: &str = r#"
(function() {
    const start = __start_tool_call;
    globalThis._toolResults = {};
    globalThis._toolErrors = {};
    const pending = {};
    globalThis.__resolveToolCalls = function() {
        for (const id of Object.keys(_toolResults)) {
            const waiter = pending[id];
            if (waiter) { waiter.resolve(_toolResults[id]); delete pending[id]; }
            delete _toolResults[id];
        }
        for (const id of Object.keys(_toolErrors)) {
            const waiter = pending[id];
            if (waiter) { waiter.reject(new Error(_toolErrors[id])); delete pending[id]; }
            delete _toolErrors[id];
        }
    };
    const host = {};
    for (const name of __tool_names) {
        host[name] = (...args) => {
            const id = String(start(name, JSON.stringify(args)));
            return new Promise((resolve, reject) => { pending[id] = { resolve, reject }; });
        };
    }
    delete globalThis.__start_tool_call;
    delete globalThis.__tool_names;
    Object.defineProperty(globalThis, 'host', {
        value: Object.freeze(host), writable: false, configurable: false, enumerable: true
    });
})();
"#;

type Completion = (usize, Result<Value, String>);

pub struct IsolateExecutor {
    timeout_ms: u64,
    tool_call_timeout: Duration,
    memory_limit_mb: u64,
    always_async: bool,
    busy: AtomicBool,
    disposed: AtomicBool,
    cancel: std::sync::Mutex<Option<Arc<AtomicBool>>>,
}

impl IsolateExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            tool_call_timeout: config.tool_call_timeout(),
            memory_limit_mb: config.memory_limit_mb,
            always_async: config.always_async,
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl SandboxBackend for IsolateExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Isolate
    }

    async fn execute(&self, script: &str, tools: ToolSet) -> ExecuteOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return ExecuteOutcome::failure("Executor disposed");
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return ExecuteOutcome::busy();
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());

        let wrapped = wrap_script(script, self.always_async);
        let timeout_ms = self.timeout_ms;
        let tool_call_timeout = self.tool_call_timeout;
        let memory_limit_mb = self.memory_limit_mb;
        let handle = tokio::runtime::Handle::current();
        let joined = tokio::task::spawn_blocking(move || {
            run_isolate(
                wrapped,
                tools,
                handle,
                timeout_ms,
                tool_call_timeout,
                memory_limit_mb,
                cancel,
            )
        })
        .await;

        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.busy.store(false, Ordering::SeqCst);
        joined.unwrap_or_else(|error| {
            ExecuteOutcome::failure(format!("sandbox thread failed: {error}"))
        })
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.store(true, Ordering::Relaxed);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_isolate(
    wrapped: String,
    tools: ToolSet,
    handle: tokio::runtime::Handle,
    timeout_ms: u64,
    tool_call_timeout: Duration,
    memory_limit_mb: u64,
    cancel: Arc<AtomicBool>,
) -> ExecuteOutcome {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let logs = Arc::new(LogSink::new());

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(error) => return ExecuteOutcome::failure(format!("failed to create runtime: {error}")),
    };
    rt.set_memory_limit(usize::try_from(memory_limit_mb * 1024 * 1024).unwrap_or(usize::MAX));
    rt.set_max_stack_size(MAX_STACK_SIZE);
    install_interrupt(&rt, deadline, cancel.clone());
    let ctx = match Context::full(&rt) {
        Ok(ctx) => ctx,
        Err(error) => return ExecuteOutcome::failure(format!("failed to create context: {error}")),
    };

    let (completions_tx, mut completions_rx) = mpsc::unbounded_channel::<Completion>();
    let outstanding = Arc::new(AtomicUsize::new(0));

    let drive = ctx.with(|ctx| -> Result<DriveOutcome, String> {
        let console_logs = logs.clone();
        ctx.globals()
            .set(
                "__console_emit",
                Func::from(move |prefix: String, message: String| {
                    console_logs.push(&prefix, &message);
                }),
            )
            .map_err(|e| format!("failed to install console hook: {e}"))?;
        ctx.eval::<(), _>(CONSOLE_JS).map_err(|e| format!("failed to install console: {e}"))?;

        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        set_tool_names(&ctx, &names).map_err(|e| format!("failed to install tool names: {e}"))?;

        let next_call_id = Arc::new(AtomicUsize::new(1));
        let start_tools = tools.clone();
        let start_outstanding = outstanding.clone();
        let start_handle = handle.clone();
        let call_tx = completions_tx.clone();
        ctx.globals()
            .set(
                "__start_tool_call",
                Func::from(move |name: String, args_json: String| -> i32 {
                    let id = next_call_id.fetch_add(1, Ordering::Relaxed);
                    start_outstanding.fetch_add(1, Ordering::SeqCst);
                    start_tool_call(
                        &start_tools,
                        &start_handle,
                        &call_tx,
                        tool_call_timeout,
                        id,
                        name,
                        args_json,
                    );
                    id as i32
                }),
            )
            .map_err(|e| format!("failed to install tool dispatch: {e}"))?;

        ctx.eval::<(), _>(BIND_HOST_JS).map_err(|e| format!("failed to bind host: {e}"))?;
        ctx.eval::<(), _>(HARDEN_JS).map_err(|e| format!("failed to harden sandbox: {e}"))?;

        let promise: Promise = ctx
            .eval(format!("Promise.resolve({wrapped})"))
            .map_err(|_| enrich_memory_error(exception_message(&ctx), memory_limit_mb))?;

        let pump_outstanding = outstanding.clone();
        Ok(drive_promise(&rt, &ctx, &promise, deadline, &cancel, |ctx| {
            let mut progressed = false;
            while let Ok((call_id, outcome)) = completions_rx.try_recv() {
                progressed = true;
                pump_outstanding.fetch_sub(1, Ordering::SeqCst);
                deposit_completion(ctx, call_id, outcome)?;
            }
            if progressed {
                ctx.eval::<(), _>("__resolveToolCalls()")
                    .map_err(|_| exception_message(ctx))?;
            }
            Ok(PumpState { progressed, outstanding: pump_outstanding.load(Ordering::SeqCst) })
        }))
    });

    let logs = logs.take();
    match drive {
        Ok(DriveOutcome::Value(result)) => ExecuteOutcome {
            result: Some(result.unwrap_or(Value::Null)),
            error: None,
            logs,
        },
        Ok(DriveOutcome::Error(message)) => ExecuteOutcome {
            result: None,
            error: Some(enrich_memory_error(message, memory_limit_mb)),
            logs,
        },
        Ok(DriveOutcome::TimedOut) => {
            let mut outcome = ExecuteOutcome::timeout(timeout_ms);
            outcome.logs = logs;
            outcome
        }
        Ok(DriveOutcome::Cancelled) => {
            ExecuteOutcome { result: None, error: Some("Executor disposed".to_string()), logs }
        }
        Err(message) => ExecuteOutcome {
            result: None,
            error: Some(enrich_memory_error(message, memory_limit_mb)),
            logs,
        },
    }
}

/// Kick off one async tool invocation; its completion is deposited by the
/// pump on the sandbox thread.
fn start_tool_call(
    tools: &ToolSet,
    handle: &tokio::runtime::Handle,
    completions: &mpsc::UnboundedSender<Completion>,
    tool_call_timeout: Duration,
    id: usize,
    name: String,
    args_json: String,
) {
    match tools.get(&name).cloned() {
        None => {
            let mut available: Vec<&str> = tools.keys().map(String::as_str).collect();
            available.sort_unstable();
            let _ = completions.send((
                id,
                Err(format!("Tool '{name}' not found. Available tools: {}", available.join(", "))),
            ));
        }
        Some(callable) => {
            let args: Vec<Value> = serde_json::from_str(&args_json).unwrap_or_default();
            let completions = completions.clone();
            handle.spawn(async move {
                let outcome = match tokio::time::timeout(tool_call_timeout, callable(args)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(format!("{error:#}")),
                    Err(_) => Err(format!(
                        "tool call timed out after {}ms",
                        tool_call_timeout.as_millis()
                    )),
                };
                let _ = completions.send((id, outcome));
            });
        }
    }
}

/// External-copy deposit into the sandbox ghost objects.
fn deposit_completion(
    ctx: &rquickjs::Ctx<'_>,
    call_id: usize,
    outcome: Result<Value, String>,
) -> Result<(), String> {
    let (slot_name, value) = match outcome {
        Ok(value) => ("_toolResults", value),
        Err(message) => ("_toolErrors", Value::String(message)),
    };
    let slot: Object = ctx
        .globals()
        .get(slot_name)
        .map_err(|e| format!("missing sandbox slot {slot_name}: {e}"))?;
    let js_value =
        json_to_js(ctx, &value).map_err(|e| format!("failed to copy tool outcome: {e}"))?;
    slot.set(call_id.to_string(), js_value)
        .map_err(|e| format!("failed to deposit tool outcome: {e}"))
}

fn enrich_memory_error(message: String, memory_limit_mb: u64) -> String {
    if message.to_lowercase().contains("out of memory") {
        format!("memory limit of {memory_limit_mb} MB exceeded: {message}")
    } else {
        message
    }
}
