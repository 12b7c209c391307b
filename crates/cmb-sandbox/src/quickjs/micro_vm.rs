//! In-process micro-VM backend: fastest path, JS-level sandboxing only.
//!
//! Host callables are dispatched synchronously: the QuickJS-side stub blocks
//! the sandbox thread on the async host future, so `await host.x(...)` in a
//! script observes a plain resolved value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cmb_config::{ExecutorConfig, ExecutorKind};
use rquickjs::function::Func;
use rquickjs::{Context, Promise, Runtime};
use serde_json::json;

use super::{
    CONSOLE_JS, DriveOutcome, HARDEN_JS, LogSink, PumpState, drive_promise, exception_message,
    install_interrupt, set_tool_names,
};
use crate::{ExecuteOutcome, SandboxBackend, ToolSet, wrap_script};

/// Builds the frozen `host` object over the synchronous invoke stub.
const BIND_HOST_JS: &str = r#"
(function() {
    const invoke = __host_invoke;
    const host = {};
    for (const name of __tool_names) {
        host[name] = (...args) => {
            const outcome = JSON.parse(invoke(name, JSON.stringify(args)));
            if (outcome.err !== undefined) { throw new Error(outcome.err); }
            return outcome.ok;
        };
    }
    delete globalThis.__host_invoke;
    delete globalThis.__tool_names;
    Object.defineProperty(globalThis, 'host', {
        value: Object.freeze(host), writable: false, configurable: false, enumerable: true
    });
})();
"#;

pub struct MicroVmExecutor {
    timeout_ms: u64,
    tool_call_timeout: Duration,
    always_async: bool,
    busy: AtomicBool,
    disposed: AtomicBool,
    cancel: std::sync::Mutex<Option<Arc<AtomicBool>>>,
}

impl MicroVmExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            tool_call_timeout: config.tool_call_timeout(),
            always_async: config.always_async,
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl SandboxBackend for MicroVmExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::MicroVm
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
        let handle = tokio::runtime::Handle::current();
        let joined = tokio::task::spawn_blocking(move || {
            run_micro_vm(wrapped, tools, handle, timeout_ms, tool_call_timeout, cancel)
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

fn run_micro_vm(
    wrapped: String,
    tools: ToolSet,
    handle: tokio::runtime::Handle,
    timeout_ms: u64,
    tool_call_timeout: Duration,
    cancel: Arc<AtomicBool>,
) -> ExecuteOutcome {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let logs = Arc::new(LogSink::new());

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(error) => return ExecuteOutcome::failure(format!("failed to create runtime: {error}")),
    };
    install_interrupt(&rt, deadline, cancel.clone());
    let ctx = match Context::full(&rt) {
        Ok(ctx) => ctx,
        Err(error) => return ExecuteOutcome::failure(format!("failed to create context: {error}")),
    };

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

        let invoke_tools = tools.clone();
        let invoke_handle = handle.clone();
        ctx.globals()
            .set(
                "__host_invoke",
                Func::from(move |name: String, args_json: String| -> String {
                    dispatch_sync(&invoke_tools, &invoke_handle, tool_call_timeout, &name, &args_json)
                }),
            )
            .map_err(|e| format!("failed to install host dispatch: {e}"))?;

        ctx.eval::<(), _>(BIND_HOST_JS).map_err(|e| format!("failed to bind host: {e}"))?;
        ctx.eval::<(), _>(HARDEN_JS).map_err(|e| format!("failed to harden sandbox: {e}"))?;

        let promise: Promise = ctx
            .eval(format!("Promise.resolve({wrapped})"))
            .map_err(|_| exception_message(&ctx))?;

        Ok(drive_promise(&rt, &ctx, &promise, deadline, &cancel, |_| {
            Ok(PumpState { progressed: false, outstanding: 0 })
        }))
    });

    let logs = logs.take();
    match drive {
        Ok(DriveOutcome::Value(result)) => ExecuteOutcome {
            result: Some(result.unwrap_or(serde_json::Value::Null)),
            error: None,
            logs,
        },
        Ok(DriveOutcome::Error(message)) => {
            ExecuteOutcome { result: None, error: Some(message), logs }
        }
        Ok(DriveOutcome::TimedOut) => {
            let mut outcome = ExecuteOutcome::timeout(timeout_ms);
            outcome.logs = logs;
            outcome
        }
        Ok(DriveOutcome::Cancelled) => {
            ExecuteOutcome { result: None, error: Some("Executor disposed".to_string()), logs }
        }
        Err(message) => ExecuteOutcome { result: None, error: Some(message), logs },
    }
}

/// Synchronous tool dispatch: block the sandbox thread on the host future,
/// bounded by the per-call timeout. Returns a JSON envelope the stub unpacks.
fn dispatch_sync(
    tools: &ToolSet,
    handle: &tokio::runtime::Handle,
    tool_call_timeout: Duration,
    name: &str,
    args_json: &str,
) -> String {
    let envelope = match tools.get(name) {
        None => {
            let mut available: Vec<&str> = tools.keys().map(String::as_str).collect();
            available.sort_unstable();
            json!({"err": format!("Tool '{name}' not found. Available tools: {}", available.join(", "))})
        }
        Some(callable) => {
            let args: Vec<serde_json::Value> = serde_json::from_str(args_json).unwrap_or_default();
            let future = callable(args);
            match handle.block_on(tokio::time::timeout(tool_call_timeout, future)) {
                Ok(Ok(value)) => json!({"ok": value}),
                Ok(Err(error)) => json!({"err": format!("{error:#}")}),
                Err(_) => json!({
                    "err": format!("tool call timed out after {}ms", tool_call_timeout.as_millis())
                }),
            }
        }
    };
    envelope.to_string()
}
