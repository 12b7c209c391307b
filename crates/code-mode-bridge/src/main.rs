use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use cmb_config::BridgeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr: stdout belongs to the MCP stdio transport.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, http, bind, port, executor } => {
            let mut bridge_config = BridgeConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                bridge_config.http.bind = bind;
            }
            if let Some(port) = port {
                bridge_config.http.port = port;
            }
            if let Some(executor) = executor {
                bridge_config.executor.kind = executor;
            }
            cmb_bridge::run_bridge(bridge_config, http).await
        }
        Commands::Probe { config } => {
            let bridge_config = BridgeConfig::load(config.as_deref())?;
            for report in cmb_sandbox::probe_backends(&bridge_config.executor) {
                let status = if report.available { "available" } else { "unavailable" };
                println!("{:<14} {:<12} {}", report.kind.label(), status, report.detail);
            }
            Ok(())
        }
    }
}
