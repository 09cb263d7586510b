use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ditto_relay::gateway::context::resolve_relay_context;
use ditto_relay::gateway::http::router;
use ditto_relay::gateway::observability::init_tracing;
use ditto_relay::gateway::{MemoryLedger, RelayConfig, RelayHttpState};

/// OpenAI-compatible relay with channel failover and quota metering.
#[derive(Parser)]
#[command(name = "ditto-relay", long_about = None)]
struct Cli {
    /// Relay configuration (`.toml`, otherwise JSON)
    #[arg(value_name = "FILE")]
    config: PathBuf,

    /// Listen address, overriding the config file
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Default retry budget, overriding the config file
    #[arg(long, value_name = "N")]
    retry_times: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut config = RelayConfig::from_path(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(times) = cli.retry_times {
        config.retry.times = times;
    }

    let channels = config.build_channel_store().await;
    let ledger = Arc::new(MemoryLedger::new());
    let state = RelayHttpState::from_config(&config, channels, ledger)?;

    let app = router(state).layer(axum::middleware::from_fn_with_state(
        config.build_token_resolver(),
        resolve_relay_context,
    ));

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        channels = config.channels.len(),
        retry_times = config.retry.times,
        "ditto-relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
