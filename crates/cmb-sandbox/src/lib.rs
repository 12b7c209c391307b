//! Sandbox backends for evaluating agent-authored JavaScript.
//!
//! Every backend implements the same [`SandboxBackend`] contract: scripts go
//! in, an [`ExecuteOutcome`] comes out, and the backend never panics over a
//! script failure. Out-of-process backends (subprocess, containers) share the
//! [`remote`] executor framework and speak the line-delimited JSON protocol
//! from `cmb-protocol`; in-process backends embed QuickJS.

mod container;
#[cfg(feature = "quickjs")]
mod quickjs;
mod remote;
mod selector;
mod subprocess;
mod wrap;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cmb_config::{ExecutorKind, SelectionReason};
use cmb_protocol::HostCallable;
use serde::Serialize;
use serde_json::Value;

pub use container::ContainerExecutor;
#[cfg(feature = "quickjs")]
pub use quickjs::{IsolateExecutor, MicroVmExecutor};
pub use remote::{RemoteExecutor, RunnerIo, RunnerKillHandle, RunnerLauncher, StderrRing};
pub use selector::{ExecutorSelection, ProbeReport, probe_backends, select_executor};
pub use subprocess::subprocess_executor;
pub use wrap::{ScriptShape, classify_script, wrap_script};

/// Error message returned when an execution is refused because another one
/// is still pending on the same executor.
pub const BUSY_ERROR: &str = "Another execution is already in progress";

/// The flat callable map handed to one execution: sanitized qualified name
/// to host callable.
pub type ToolSet = Arc<HashMap<String, HostCallable>>;

/// Result of one sandbox execution.
///
/// Never an `Err`: fatal conditions are carried in `error`, and on timeout
/// both `result` and `error` may be absent apart from the timeout message.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

impl ExecuteOutcome {
    pub fn success(result: Value, logs: Vec<String>) -> Self {
        Self { result: Some(result), error: None, logs }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { result: None, error: Some(error.into()), logs: Vec::new() }
    }

    pub fn busy() -> Self {
        Self::failure(BUSY_ERROR)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::failure(format!("Code execution timeout after {timeout_ms}ms"))
    }
}

/// Descriptor of the executor serving a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutorInfo {
    #[serde(rename = "type")]
    pub kind: ExecutorKind,
    pub reason: SelectionReason,
    pub timeout_ms: u64,
}

/// One isolated JavaScript runtime.
///
/// Executions are serialized per backend instance: while one is pending, a
/// second `execute` returns the busy error without touching the sandbox.
/// Session-level parallelism comes from routing sessions to distinct
/// instances.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Run one script with the given host callables.
    async fn execute(&self, script: &str, tools: ToolSet) -> ExecuteOutcome;

    /// Tear the backend down. Idempotent, and safe to call on an executor
    /// that never initialized or whose init failed.
    async fn dispose(&self);
}
