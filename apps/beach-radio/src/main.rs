use anyhow::Result;
use beach_radio::config::{Cli, RadioConfig};
use beach_radio::server;
use beach_radio::telemetry::Telemetry;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RadioConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        relay_only = config.engine.relay_only,
        max_sessions = ?config.max_sessions,
        "starting beach-radio"
    );

    server::run(config, telemetry.metrics_handle()).await
}
