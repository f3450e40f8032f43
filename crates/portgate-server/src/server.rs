//! Server root object: control listener, registry, connection tables.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::control::{handle_session, SessionContext, SessionTracker};
use crate::registry::TunnelRegistry;
use crate::rendezvous::ConnectionTable;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control listener on {addr}: {source}")]
    ControlBind { addr: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A bound but not yet running server. Splitting bind from run keeps fatal
/// startup errors separate from the accept loop and lets tests learn the
/// ephemeral control port before connecting.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<TunnelRegistry>,
    connections: ConnectionTable,
    sessions: Arc<SessionTracker>,
    listener: TcpListener,
    local_addr: SocketAddr,
    started_at: Instant,
}

impl Server {
    /// Bind the control listener. Fails fast on unusable config.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if config.auth_tokens.is_empty() {
            warn!("no auth tokens configured, accepting any client");
        }

        let addr = format!("{}:{}", config.host, config.control_port);
        let listener =
            TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::ControlBind {
                    addr: addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;

        let config = Arc::new(config);
        let connections = ConnectionTable::new();
        let registry = Arc::new(TunnelRegistry::new(
            config.host.clone(),
            config.allowed_ports.clone(),
            config.connection_timeout,
            connections.clone(),
        ));

        info!(
            %local_addr,
            allowed_ports = %config.allowed_ports,
            "control listener bound"
        );

        Ok(Self {
            config,
            registry,
            connections,
            sessions: Arc::new(SessionTracker::new()),
            listener,
            local_addr,
            started_at: Instant::now(),
        })
    }

    /// Address the control listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn connections(&self) -> ConnectionTable {
        self.connections.clone()
    }

    /// Accept control sessions until `shutdown` resolves, then tear down
    /// every tunnel and close the control listener.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "control connection accepted");
                        let ctx = SessionContext {
                            config: self.config.clone(),
                            registry: self.registry.clone(),
                            connections: self.connections.clone(),
                            started_at: self.started_at,
                        };
                        self.sessions.register(tokio::spawn(handle_session(ctx, stream, peer)));
                    }
                    Err(e) => warn!(error = %e, "failed to accept control connection"),
                }
            }
        }

        info!("shutting down, tearing down all tunnels");
        self.registry.teardown_all().await;
        self.sessions.abort_all();
        drop(self.listener);
        Ok(())
    }
}
