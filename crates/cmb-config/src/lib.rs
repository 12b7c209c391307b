//! Bridge configuration: upstream server entries, executor settings, and
//! downstream transport options, loaded from a TOML file.

mod bridge;
mod executor;
mod upstream;

pub use bridge::{BridgeConfig, HttpConfig, SessionConfig};
pub use executor::{
    ContainerConfig, ContainerMode, ExecutorConfig, ExecutorKind, SelectionReason,
};
pub use upstream::{UpstreamServerConfig, UpstreamTransport};
