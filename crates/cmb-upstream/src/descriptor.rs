use std::fmt;

use cmb_protocol::HostCallable;
use serde::Serialize;
use serde_json::Value;

/// Canonical internal representation of one upstream tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Sanitized identifier, unique within its server.
    pub name: String,
    /// Original upstream tool name used when proxying calls.
    pub upstream_name: String,
    pub description: String,
    /// Unmodified upstream JSON Schema, kept for type generation.
    pub raw_schema: Value,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    /// Invoking this round-trips to the owning upstream client.
    pub execute: HostCallable,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("upstream_name", &self.upstream_name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// One row of the flat tool listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolListEntry {
    pub server: String,
    /// Qualified name (`namespace__tool`).
    pub name: String,
    pub description: String,
}

/// Observer notified when a namespace's tool set changes.
///
/// The upstream manager pushes registrations outward; consumers never hold a
/// back-pointer into the manager.
pub trait ToolRegistrySink: Send + Sync {
    fn tools_changed(&self, namespace: &str, tools: Vec<ToolDescriptor>);
    fn namespace_removed(&self, namespace: &str);
}
