//! In-process QuickJS backends.
//!
//! Both backends evaluate the wrapped script inside a fresh QuickJS runtime
//! on a blocking thread, with an interrupt handler enforcing the execution
//! deadline and dispose cancellation. They differ in tool dispatch: the
//! micro-VM resolves host calls synchronously, the isolate uses the
//! notification pattern with sandbox-side pending resolvers, a hard memory
//! cap, and per-call timeouts.

mod isolate;
mod micro_vm;

pub use isolate::IsolateExecutor;
pub use micro_vm::MicroVmExecutor;

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rquickjs::{Ctx, Promise, Runtime, Value};

/// Console shim: captures output with level prefixes into the host-side log
/// buffer through `__console_emit`.
pub(crate) const CONSOLE_JS: &str = r#"
(function() {
    const emit = __console_emit;
    const toText = (args) => args.map((a) => {
        if (typeof a === 'string') { return a; }
        try { return JSON.stringify(a); } catch (_) { return String(a); }
    }).join(' ');
    const console = {
        log: (...args) => emit('', toText(args)),
        info: (...args) => emit('', toText(args)),
        warn: (...args) => emit('[WARN] ', toText(args)),
        error: (...args) => emit('[ERROR] ', toText(args)),
        debug: (...args) => emit('[DEBUG] ', toText(args)),
    };
    Object.defineProperty(globalThis, 'console', {
        value: Object.freeze(console), writable: false, configurable: false
    });
    delete globalThis.__console_emit;
})();
"#;

/// Hardening: strip eval, neuter the Function constructor, freeze the common
/// prototypes, and seal the global. Must run after console and `host` are
/// installed.
pub(crate) const HARDEN_JS: &str = r#"
(function() {
    "use strict";
    delete globalThis.eval;

    const OrigFunction = Function;
    const SafeFunction = function() {
        throw new TypeError('Function constructor is disabled in this sandbox');
    };
    SafeFunction.prototype = OrigFunction.prototype;
    OrigFunction.prototype.constructor = SafeFunction;
    Object.defineProperty(globalThis, 'Function', {
        value: SafeFunction, writable: false, configurable: false
    });

    for (const proto of [
        Object.getPrototypeOf(async function() {}),
        Object.getPrototypeOf(function*() {}),
        Object.getPrototypeOf(async function*() {}),
    ]) {
        try {
            Object.defineProperty(proto, 'constructor', {
                value: SafeFunction, writable: false, configurable: false
            });
        } catch (_) {}
    }

    for (const proto of [
        Object.prototype, Array.prototype, String.prototype,
        Number.prototype, Boolean.prototype, Function.prototype,
    ]) {
        Object.freeze(proto);
    }
    Object.seal(globalThis);
})();
"#;

pub(crate) struct LogSink(pub StdMutex<Vec<String>>);

impl LogSink {
    pub(crate) fn new() -> Self {
        Self(StdMutex::new(Vec::new()))
    }

    pub(crate) fn push(&self, prefix: &str, message: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(format!("{prefix}{message}"));
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Message extracted from the context's currently caught exception.
pub(crate) fn exception_message(ctx: &Ctx<'_>) -> String {
    let caught: Value = ctx.catch();
    if let Some(object) = caught.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            return message;
        }
    }
    if let Ok(Some(text)) = ctx.json_stringify(caught) {
        if let Ok(text) = text.to_string() {
            return text;
        }
    }
    "unknown script error".to_string()
}

/// Convert a JS value into JSON; `None` for `undefined`.
pub(crate) fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Option<serde_json::Value> {
    if value.is_undefined() {
        return None;
    }
    let text = ctx.json_stringify(value).ok()??.to_string().ok()?;
    serde_json::from_str(&text).ok()
}

/// Parse JSON into a JS value inside the context.
pub(crate) fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    ctx.json_parse(text)
}

pub(crate) enum DriveOutcome {
    Value(Option<serde_json::Value>),
    Error(String),
    TimedOut,
    Cancelled,
}

pub(crate) struct PumpState {
    /// A completion was deposited this round.
    pub progressed: bool,
    /// Tool calls still in flight; zero with a pending promise and no jobs
    /// means the script can never make progress again.
    pub outstanding: usize,
}

/// Run the job queue and the backend's completion pump until the promise
/// settles, the deadline passes, or dispose cancels the execution.
pub(crate) fn drive_promise<'js>(
    rt: &Runtime,
    ctx: &Ctx<'js>,
    promise: &Promise<'js>,
    deadline: Instant,
    cancel: &AtomicBool,
    mut pump: impl FnMut(&Ctx<'js>) -> Result<PumpState, String>,
) -> DriveOutcome {
    loop {
        while rt.is_job_pending() {
            if rt.execute_pending_job().is_err() {
                break;
            }
        }

        match promise.result::<Value<'js>>() {
            Some(Ok(value)) => return DriveOutcome::Value(js_to_json(ctx, value)),
            Some(Err(_)) => return DriveOutcome::Error(exception_message(ctx)),
            None => {}
        }

        if cancel.load(Ordering::Relaxed) {
            return DriveOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return DriveOutcome::TimedOut;
        }

        match pump(ctx) {
            Err(message) => return DriveOutcome::Error(message),
            Ok(state) => {
                if !state.progressed && !rt.is_job_pending() {
                    if state.outstanding == 0 {
                        // Nothing can resolve this promise anymore.
                        return DriveOutcome::TimedOut;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

/// Install the deadline/cancel interrupt handler on a runtime.
pub(crate) fn install_interrupt(
    rt: &Runtime,
    deadline: Instant,
    cancel: std::sync::Arc<AtomicBool>,
) {
    rt.set_interrupt_handler(Some(Box::new(move || {
        cancel.load(Ordering::Relaxed) || Instant::now() >= deadline
    })));
}

/// Expose the sanitized tool-name list to the bind script.
pub(crate) fn set_tool_names(ctx: &Ctx<'_>, names: &[String]) -> rquickjs::Result<()> {
    let value = json_to_js(ctx, &serde_json::json!(names))?;
    ctx.globals().set("__tool_names", value)
}
