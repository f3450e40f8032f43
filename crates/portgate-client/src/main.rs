//! portgate client binary.

use anyhow::{Context, Result};
use clap::Parser;
use portgate_client::{ClientConfig, TunnelClient};
use portgate_proto::TunnelSpec;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Expose local TCP services through a portgate server.
#[derive(Parser, Debug)]
#[command(name = "portgate-client")]
#[command(about = "portgate client - expose local TCP services through a portgate server")]
#[command(version)]
struct Args {
    /// Server host to connect to
    #[arg(long, env = "PORTGATE_SERVER_HOST", default_value = "localhost")]
    server_host: String,

    /// Server control port
    #[arg(long, env = "PORTGATE_SERVER_PORT", default_value_t = 7000)]
    server_port: u16,

    /// Authentication token
    #[arg(long, env = "PORTGATE_AUTH_TOKEN", default_value = "")]
    auth_token: String,

    /// Tunnels to expose, comma separated "<remotePort>:<localPort>:<name>"
    #[arg(long, env = "PORTGATE_TUNNELS", value_delimiter = ',', required = true)]
    tunnels: Vec<TunnelSpec>,

    /// Host the local services live on
    #[arg(long, env = "PORTGATE_LOCAL_HOST", default_value = "localhost")]
    local_host: String,

    /// Reconnect attempts before giving up
    #[arg(long, env = "PORTGATE_RECONNECT_ATTEMPTS", default_value_t = 999)]
    reconnect_attempts: u32,

    /// Initial reconnect delay in milliseconds
    #[arg(long, env = "PORTGATE_RECONNECT_DELAY_MS", default_value_t = 5_000)]
    reconnect_delay_ms: u64,

    /// How long to wait for the server's data-channel dial, in milliseconds
    #[arg(long, env = "PORTGATE_CONNECTION_TIMEOUT_MS", default_value_t = 10_000)]
    connection_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PORTGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(log_level).with_context(|| format!("invalid log level: {log_level}"))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = ClientConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        auth_token: args.auth_token,
        tunnels: args.tunnels,
        local_host: args.local_host,
        reconnect_attempts: args.reconnect_attempts,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        connection_timeout: Duration::from_millis(args.connection_timeout_ms),
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(()).await;
    });

    let client = TunnelClient::new(config);
    client.run(shutdown_rx).await?;

    info!("shutdown complete");
    Ok(())
}
