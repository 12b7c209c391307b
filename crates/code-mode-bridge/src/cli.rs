use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cmb_config::ExecutorKind;

#[derive(Parser)]
#[command(
    name = "cmb",
    about = "MCP bridge that multiplexes upstream tool servers behind a JavaScript sandbox",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the bridge over stdio (default) or HTTP.
    Serve {
        /// Config file path; defaults to the user config directory.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Serve over HTTP/SSE instead of stdio.
        #[arg(long)]
        http: bool,
        /// HTTP bind address override.
        #[arg(long)]
        bind: Option<String>,
        /// HTTP port override.
        #[arg(long)]
        port: Option<u16>,
        /// Executor backend override (auto, micro-vm, isolate, container,
        /// container-cli, subprocess).
        #[arg(long)]
        executor: Option<ExecutorKind>,
    },
    /// Report which sandbox backends are available on this host.
    Probe {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
