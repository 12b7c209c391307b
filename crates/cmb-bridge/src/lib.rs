//! The downstream bridge surface: the per-session tool registry, the five
//! bridge tools, and the stdio/HTTP MCP servers in front of them.

mod router;
mod sandbox_manager;
mod serve;
mod tools;
mod utils_tools;

pub use router::BridgeRouter;
pub use sandbox_manager::{NamespaceInfo, RegistrySync, SandboxManager};
pub use serve::{HttpEndpoint, run_bridge, serve_stdio};
pub use tools::{BridgeTools, ToolOutput, build_bridge};
pub use utils_tools::utils_descriptors;
