//! vmk-netd entry point.
//!
//! Builds the switch from its configuration, then serves control requests
//! on stdin until end of input or ctrl-c.

use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use vmk_netd::{init_logging, startup, Cli, ControlServer};

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    init_logging(cli.log_level(&config))?;

    info!("--- Starting vmk-netd ---");
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "configuration file");
    }
    let net = startup(&config)?;
    let server = ControlServer::new(net.clone());

    tokio::select! {
        served = server.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            let served = served?;
            info!(served, "control input closed");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("received SIGINT, shutting down"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
        }
    }

    net.mod_cleanup();
    info!("vmk-netd exiting normally");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // logging may not be up yet
            eprintln!("vmk-netd: {e:#}");
            error!(error = %format!("{e:#}"), "vmk-netd failed");
            ExitCode::FAILURE
        }
    }
}
