mod cli;

use anyhow::Result;
use beach_beacon::{config::ServerConfig, telemetry::Telemetry};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let telemetry = Telemetry::init(&cli.telemetry())?;

    if let Some(Commands::Listen { url, cid, token }) = cli.command {
        return cli::run_listener(url, cid, token).await;
    }

    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        channel_depth = config.channel_depth,
        send_timeout_ms = config.send_timeout.as_millis() as u64,
        "starting beach-beacon relay"
    );

    beach_beacon::run(config, telemetry.metrics_handle()).await
}
