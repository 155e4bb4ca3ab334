use clap::Parser;
use tracing::info;

use medfly_signaling::config::{self, Cli};
use medfly_signaling::signaling::SignalingServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    config::init_logging(cli.log_level, cli.verbose);

    let config = cli.into_config()?;
    info!("Starting medfly-signaling v{}", env!("CARGO_PKG_VERSION"));
    info!("Binding to {}", config.bind_addr);

    let server = SignalingServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested, closing listener"),
    }

    Ok(())
}
