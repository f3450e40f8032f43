//! Control session and reconnect loop.
//!
//! The client keeps one WebSocket control session to the server: connect,
//! authenticate, announce tunnels, then answer the server's rendezvous and
//! keepalive traffic. Any close starts a fresh session after a capped
//! exponential backoff; the server keeps no state across sessions, so the
//! tunnels are announced again every time.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use portgate_proto::{codec, ControlMessage};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::data::ActiveConnections;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const AUTH_RESULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gave up after {0} reconnect attempts")]
    ReconnectAttemptsExhausted(u32),
}

enum SessionOutcome {
    /// Shutdown was requested; stop for good.
    Shutdown,
    /// The session ended; reconnect. `authenticated` resets the backoff.
    Ended { authenticated: bool, reason: String },
}

pub struct TunnelClient {
    config: ClientConfig,
    connections: ActiveConnections,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connections: ActiveConnections::new(),
        }
    }

    /// Data connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Run until `shutdown` fires (or its sender is dropped) or the
    /// reconnect budget is exhausted.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;
        let mut delay = self.config.reconnect_delay;

        loop {
            match self.run_session(&mut shutdown).await {
                SessionOutcome::Shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
                SessionOutcome::Ended {
                    authenticated,
                    reason,
                } => {
                    if authenticated {
                        attempt = 0;
                        delay = self.config.reconnect_delay;
                    }
                    attempt += 1;
                    if attempt > self.config.reconnect_attempts {
                        warn!(reason, "not reconnecting, attempt budget exhausted");
                        return Err(ClientError::ReconnectAttemptsExhausted(
                            self.config.reconnect_attempts,
                        ));
                    }
                    warn!(
                        reason,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "control session ended, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            info!("shutting down");
                            return Ok(());
                        }
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    async fn run_session(&self, shutdown: &mut mpsc::Receiver<()>) -> SessionOutcome {
        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        info!(%addr, "connecting to server");

        let tcp = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                return SessionOutcome::Ended {
                    authenticated: false,
                    reason: format!("connect failed: {e}"),
                }
            }
        };
        let url = format!("ws://{addr}/");
        let ws = match client_async(url, tcp).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                return SessionOutcome::Ended {
                    authenticated: false,
                    reason: format!("websocket handshake failed: {e}"),
                }
            }
        };

        let (sink, mut frames) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<ControlMessage>(64);
        let writer = tokio::spawn(writer_task(sink, out_rx));

        let outcome = self.drive(&mut frames, &out_tx, shutdown).await;

        // Data tasks hold sender clones for as long as their splices live,
        // so the writer cannot be joined by just dropping ours.
        drop(out_tx);
        writer.abort();
        let _ = writer.await;
        outcome
    }

    /// Authenticate, register, then serve the session until it ends.
    async fn drive(
        &self,
        frames: &mut WsSource,
        out_tx: &mpsc::Sender<ControlMessage>,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> SessionOutcome {
        let ended = |authenticated: bool, reason: String| SessionOutcome::Ended {
            authenticated,
            reason,
        };

        if out_tx
            .send(ControlMessage::Auth {
                token: self.config.auth_token.clone(),
            })
            .await
            .is_err()
        {
            return ended(false, "write side closed".to_string());
        }

        let client_id = match self.await_auth_result(frames).await {
            Ok(client_id) => client_id,
            Err(reason) => return ended(false, reason),
        };
        info!(
            client_id = %client_id,
            tunnels = self.config.tunnels.len(),
            "authenticated, registering tunnels"
        );

        if out_tx
            .send(ControlMessage::RegisterTunnels {
                tunnels: self.config.tunnels.clone(),
            })
            .await
            .is_err()
        {
            return ended(true, "write side closed".to_string());
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionOutcome::Shutdown,
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                        Ok(msg) => self.dispatch(msg, out_tx).await,
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        return ended(true, "connection closed by server".to_string());
                    }
                    Some(Ok(_)) => debug!("ignoring non-text frame"),
                    Some(Err(e)) => return ended(true, format!("read error: {e}")),
                }
            }
        }
    }

    async fn await_auth_result(&self, frames: &mut WsSource) -> Result<String, String> {
        loop {
            let frame = tokio::time::timeout(AUTH_RESULT_TIMEOUT, frames.next())
                .await
                .map_err(|_| "timed out waiting for auth result".to_string())?;
            match frame {
                Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                    Ok(ControlMessage::AuthSuccess { client_id }) => return Ok(client_id),
                    Ok(ControlMessage::AuthFailed { reason }) => {
                        return Err(format!("authentication rejected: {reason}"));
                    }
                    Ok(other) => {
                        debug!(kind = other.kind(), "ignoring message before auth result");
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err("connection closed before auth result".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(format!("read error: {e}")),
            }
        }
    }

    async fn dispatch(&self, msg: ControlMessage, out_tx: &mpsc::Sender<ControlMessage>) {
        match msg {
            ControlMessage::TunnelRegistered {
                remote_port,
                local_port,
                name,
            } => {
                info!(remote_port, local_port, name = %name, "tunnel registered");
            }
            ControlMessage::TunnelFailed { remote_port, error } => {
                warn!(remote_port, error = %error, "tunnel registration failed");
            }
            ControlMessage::NewConnection {
                connection_id,
                remote_port,
                client_address,
            } => {
                let Some(spec) = self
                    .config
                    .tunnels
                    .iter()
                    .find(|t| t.remote_port == remote_port)
                else {
                    warn!(remote_port, "new_connection for a tunnel we never declared");
                    let _ = out_tx
                        .send(ControlMessage::ConnectionClosed {
                            connection_id,
                            reason: "unknown tunnel".to_string(),
                        })
                        .await;
                    return;
                };
                debug!(
                    connection_id = %connection_id,
                    remote_port,
                    client_address = %client_address,
                    "serving new connection"
                );
                self.connections.spawn(
                    connection_id,
                    self.config.local_host.clone(),
                    spec.local_port,
                    self.config.connection_timeout,
                    out_tx.clone(),
                );
            }
            ControlMessage::ConnectionClosed {
                connection_id,
                reason,
            } => {
                self.connections.abort(&connection_id, &reason);
            }
            ControlMessage::Ping => {
                let _ = out_tx.send(ControlMessage::Pong).await;
            }
            ControlMessage::Pong => {}
            ControlMessage::StatusResponse {
                client_id,
                tunnels,
                uptime_secs,
                ..
            } => {
                info!(client_id = %client_id, tunnels = tunnels.len(), uptime_secs, "server status");
            }
            other => {
                debug!(kind = other.kind(), "dropping unexpected message");
            }
        }
    }
}

/// Serialize outbound messages onto the WebSocket. Exits when the session
/// drops its sender or the socket dies.
async fn writer_task(mut sink: WsSink, mut rx: mpsc::Receiver<ControlMessage>) {
    while let Some(msg) = rx.recv().await {
        let text = match codec::encode(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
