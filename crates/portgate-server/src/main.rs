//! portgate server binary.

use anyhow::{Context, Result};
use clap::Parser;
use portgate_proto::PortList;
use portgate_server::{Server, ServerConfig};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Expose TCP ports on behalf of clients behind NAT.
#[derive(Parser, Debug)]
#[command(name = "portgate-server")]
#[command(about = "portgate server - expose TCP ports on behalf of tunnel clients")]
#[command(version)]
struct Args {
    /// Bind host for the control listener and public tunnel ports
    #[arg(long, env = "PORTGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Control port clients connect to
    #[arg(long, env = "PORTGATE_CONTROL_PORT", default_value_t = 7000)]
    control_port: u16,

    /// Accepted auth tokens, comma separated. Empty accepts any client.
    #[arg(long, env = "PORTGATE_AUTH_TOKENS", value_delimiter = ',')]
    auth_tokens: Vec<String>,

    /// Public ports clients may register, e.g. "3000,9000-9100". Empty allows all.
    #[arg(long, env = "PORTGATE_ALLOWED_PORTS", default_value = "")]
    allowed_ports: PortList,

    /// Address dialed to reach a client's data listener
    #[arg(long, env = "PORTGATE_CLIENT_DATA_HOST", default_value = "localhost")]
    client_data_host: String,

    /// Rendezvous deadline in milliseconds
    #[arg(long, env = "PORTGATE_CONNECTION_TIMEOUT_MS", default_value_t = 10_000)]
    connection_timeout_ms: u64,

    /// Keepalive ping interval in milliseconds
    #[arg(long, env = "PORTGATE_PING_INTERVAL_MS", default_value_t = 30_000)]
    ping_interval_ms: u64,

    /// Quiet-session timeout in milliseconds
    #[arg(long, env = "PORTGATE_PING_TIMEOUT_MS", default_value_t = 60_000)]
    ping_timeout_ms: u64,

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

#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received");
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let auth_tokens: Vec<String> = args
        .auth_tokens
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();

    let config = ServerConfig {
        host: args.host,
        control_port: args.control_port,
        auth_tokens,
        allowed_ports: args.allowed_ports,
        client_data_host: args.client_data_host,
        connection_timeout: Duration::from_millis(args.connection_timeout_ms),
        ping_interval: Duration::from_millis(args.ping_interval_ms),
        ping_timeout: Duration::from_millis(args.ping_timeout_ms),
    };

    let shutdown = shutdown_signal()?;
    let server = Server::bind(config)
        .await
        .context("fatal startup error")?;
    server.run(shutdown).await?;

    info!("shutdown complete");
    Ok(())
}
