//! Wire types shared between the bridge host and sandbox runners.
//!
//! The host and the runner speak line-delimited JSON over stdio: exactly one
//! JSON object per line, UTF-8, no partial lines. [`HostMessage`] flows host
//! to runner, [`RuntimeMessage`] flows runner to host. [`EvalReturn`] is the
//! contract a sandbox script's return value must satisfy before it is mapped
//! to MCP content blocks.

mod callable;
mod eval_return;
mod messages;
mod sanitize;

pub use callable::{HostCallable, ToolFuture};
pub use eval_return::{EvalBlock, EvalReturnError, validate_eval_return};
pub use messages::{FatalError, HostMessage, RuntimeError, RuntimeMessage};
pub use sanitize::{qualified_name, sanitize_name, split_qualified};
