use anyhow::Result;
use clap::Parser;
use tracing::info;

use beach_beacon::{
    config::{Cli, Config},
    server,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = Config::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        routing_policy = ?config.routing_policy,
        push_enabled = config.fcm_service_account.is_some(),
        "starting beach-beacon"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
