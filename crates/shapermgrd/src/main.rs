//! shapermgrd - Router Shaping Policy Daemon
//!
//! Entry point: loads the YAML configuration, builds the management
//! facade, and runs the session expiry sweep until shutdown.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use shaper_common::config::ShaperConfig;
use shaper_common::ShaperResult;
use shapermgrd::ShaperApi;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "shapermgrd", about = "Router session and shaping policy daemon")]
struct Args {
    /// Path to the daemon configuration file.
    #[arg(short, long, default_value = "/etc/shaperd/config.yaml")]
    config: String,

    /// Log verbosity.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn init_logging(level: Level) -> ShaperResult<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| shaper_common::ShaperError::config(format!("failed to set logger: {}", e)))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(args.log_level) {
        eprintln!("shapermgrd: {}", e);
        return ExitCode::FAILURE;
    }

    info!(config = %args.config, "Starting shapermgrd");

    match run(&args).await {
        Ok(()) => {
            info!("shapermgrd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "shapermgrd exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> ShaperResult<()> {
    let config = ShaperConfig::load(&args.config)?;
    info!(
        routers = config.routers.len(),
        lan_interface = %config.lan_interface,
        "Configuration loaded"
    );

    let api = Arc::new(ShaperApi::new(&config)?);

    let sweeper = {
        let api = Arc::clone(&api);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = api.sweep().await;
                if expired > 0 {
                    info!(expired, "Expired idle sessions");
                }
            }
        })
    };

    info!("shapermgrd ready");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Signal handler failed, shutting down"),
    }

    sweeper.abort();
    api.shutdown().await;
    info!("Graceful shutdown complete");
    Ok(())
}
