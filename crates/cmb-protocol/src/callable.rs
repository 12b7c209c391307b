use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

/// Future returned by a host callable.
pub type ToolFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A host-side function exposed to the sandbox as one entry of the `host`
/// namespace.
///
/// The argument vector carries the call's positional arguments: a runner
/// that sends a JSON array gets it spread, any other value arrives as a
/// single-element vector. Errors become `tool-error` messages, surfaced in
/// the sandbox as a rejected promise.
pub type HostCallable = Arc<dyn Fn(Vec<Value>) -> ToolFuture + Send + Sync>;
