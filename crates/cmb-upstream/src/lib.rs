//! Upstream MCP client management: connections, retry with OAuth-aware
//! classification, and the live tool registry.

mod client;
mod descriptor;
mod manager;
mod states;

pub use descriptor::{ToolDescriptor, ToolListEntry, ToolRegistrySink};
pub use manager::{ConnectedCallback, UpstreamManager};
pub use states::{ServerConnectionInfo, ServerConnectionState};
