use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use gapbridge_core::{Bridge, BridgeConfig, Error};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// GapBridge - protocol bridge across an air-gapped link
#[derive(Parser)]
#[command(name = "gapbridge-server")]
#[command(about = "Runs one side of the FTP/SFTP/PostgreSQL air-gap bridge")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "gapbridge.toml")]
    pub config: PathBuf,

    /// Debug logging (overrides --log-level)
    #[arg(short, long)]
    pub debug: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn init_logging(cli: &Cli) {
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Configuration problems exit with a distinct code.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Config(_)) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&cli.config)?;
    let bridge = Bridge::from_config(config).await?;

    bridge.start().await.context("starting bridge")?;
    let stopped = bridge.stopped();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing signal handler")?;
            info!("Interrupt received");
        }
        _ = stopped.cancelled() => {}
    }

    bridge.shutdown().await;
    if bridge.link_lost() {
        anyhow::bail!("link receive stream ended unexpectedly");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap prints usage, help or the version itself
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_FAILURE),
            };
        }
    };

    init_logging(&cli);
    info!("Starting GapBridge v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => {
            info!("GapBridge stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}
