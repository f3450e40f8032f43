//! Control-channel sessions.
//!
//! Each client holds one long-lived WebSocket connection carrying JSON
//! control messages. A session moves through `AwaitAuth -> Authenticated ->
//! Closed`: before authentication a single bad or unexpected frame closes
//! the connection, afterwards bad frames are logged and dropped. The server
//! pings on an interval and closes sessions that go quiet for longer than
//! the ping timeout, tearing down every tunnel the client owned.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use portgate_proto::{codec, ControlMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::registry::TunnelRegistry;
use crate::rendezvous::ConnectionTable;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The control channel is gone; the session is closing or closed.
#[derive(Debug, Error)]
#[error("control channel closed")]
pub struct SessionClosed;

/// Cheap handle for sending messages to one client's control channel.
/// Held by the tunnels a session owns; sending after the session died just
/// returns [`SessionClosed`].
#[derive(Clone)]
pub struct SessionHandle {
    client_id: String,
    outbound: mpsc::Sender<ControlMessage>,
}

impl SessionHandle {
    pub fn new(client_id: String, outbound: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            client_id,
            outbound,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&self, msg: ControlMessage) -> Result<(), SessionClosed> {
        self.outbound.send(msg).await.map_err(|_| SessionClosed)
    }
}

/// Tracks live control-session tasks so graceful shutdown can close them.
/// Entries for finished sessions are swept on the next register.
#[derive(Default)]
pub struct SessionTracker {
    next_id: std::sync::atomic::AtomicU64,
    tasks: std::sync::Mutex<std::collections::HashMap<u64, tokio::task::JoinHandle<()>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: tokio::task::JoinHandle<()>) {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, handle);
    }

    /// Abort every live session. Idempotent.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}

/// Everything a session needs from the server root.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<TunnelRegistry>,
    pub connections: ConnectionTable,
    pub started_at: Instant,
}

/// Drive one control connection from handshake to cleanup.
pub async fn handle_session(ctx: SessionContext, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (sink, mut frames) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<ControlMessage>(64);
    let writer = tokio::spawn(writer_task(sink, out_rx));

    let Some(client_id) = authenticate(&ctx, &mut frames, &out_tx, peer).await else {
        drop(out_tx);
        let _ = writer.await;
        return;
    };
    info!(client_id = %client_id, %peer, "client authenticated");

    let session = SessionHandle::new(client_id.clone(), out_tx.clone());
    let reason = run_authenticated(&ctx, &mut frames, &session).await;
    info!(client_id = %client_id, %peer, reason, "control session closed");

    ctx.registry.remove_client(&client_id).await;
    drop(session);
    drop(out_tx);
    let _ = writer.await;
}

/// AwaitAuth state: exactly one valid `auth` frame gets the session
/// authenticated, anything else closes it.
async fn authenticate(
    ctx: &SessionContext,
    frames: &mut WsSource,
    out_tx: &mpsc::Sender<ControlMessage>,
    peer: SocketAddr,
) -> Option<String> {
    let first = tokio::time::timeout(ctx.config.ping_timeout, frames.next()).await;
    let msg = match first {
        Err(_) => {
            warn!(%peer, "no auth frame before timeout");
            return None;
        }
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return None,
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "control read failed before auth");
            return None;
        }
        Ok(Some(Ok(Message::Text(text)))) => match codec::decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%peer, error = %e, "malformed frame before auth");
                return None;
            }
        },
        Ok(Some(Ok(_))) => {
            warn!(%peer, "non-text frame before auth");
            return None;
        }
    };

    let ControlMessage::Auth { token } = msg else {
        warn!(%peer, kind = msg.kind(), "expected auth as first message");
        return None;
    };

    if !token_allowed(&ctx.config.auth_tokens, &token) {
        warn!(%peer, "authentication failed");
        let _ = out_tx
            .send(ControlMessage::AuthFailed {
                reason: "invalid token".to_string(),
            })
            .await;
        return None;
    }

    let client_id = Uuid::new_v4().to_string();
    out_tx
        .send(ControlMessage::AuthSuccess {
            client_id: client_id.clone(),
        })
        .await
        .ok()?;
    Some(client_id)
}

fn token_allowed(tokens: &[String], presented: &str) -> bool {
    tokens.is_empty() || tokens.iter().any(|t| t == presented)
}

/// Authenticated state: dispatch frames FIFO and keep the session alive
/// until the peer goes away or stops answering pings.
async fn run_authenticated(
    ctx: &SessionContext,
    frames: &mut WsSource,
    session: &SessionHandle,
) -> &'static str {
    let mut last_seen = Instant::now();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.config.ping_interval,
        ctx.config.ping_interval,
    );

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match codec::decode(&text) {
                        Ok(msg) => dispatch(ctx, session, msg).await,
                        Err(e) => {
                            warn!(client_id = %session.client_id(), error = %e, "dropping malformed frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => return "closed by client",
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                    debug!(client_id = %session.client_id(), "ignoring non-text frame");
                }
                Some(Err(e)) => {
                    warn!(client_id = %session.client_id(), error = %e, "control read failed");
                    return "read error";
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > ctx.config.ping_timeout {
                    return "ping timeout";
                }
                if session.send(ControlMessage::Ping).await.is_err() {
                    return "write side closed";
                }
            }
        }
    }
}

async fn dispatch(ctx: &SessionContext, session: &SessionHandle, msg: ControlMessage) {
    match msg {
        ControlMessage::RegisterTunnels { tunnels } => {
            // One result per requested spec, in request order. Partial
            // success is normal.
            for spec in &tunnels {
                let reply = match ctx.registry.register(spec, session).await {
                    Ok(()) => ControlMessage::TunnelRegistered {
                        remote_port: spec.remote_port,
                        local_port: spec.local_port,
                        name: spec.name.clone(),
                    },
                    Err(e) => {
                        warn!(client_id = %session.client_id(), tunnel = %spec, error = %e, "tunnel registration failed");
                        ControlMessage::TunnelFailed {
                            remote_port: spec.remote_port,
                            error: e.to_string(),
                        }
                    }
                };
                if session.send(reply).await.is_err() {
                    return;
                }
            }
        }
        ControlMessage::ConnectionReady {
            connection_id,
            data_port,
        } => {
            // Dialing the data channel may take a while; other messages for
            // other connections must not wait on it.
            let connections = ctx.connections.clone();
            let data_host = ctx.config.client_data_host.clone();
            let dial_timeout = ctx.config.connection_timeout;
            tokio::spawn(async move {
                connections
                    .complete(&connection_id, &data_host, data_port, dial_timeout)
                    .await;
            });
        }
        ControlMessage::ConnectionClosed {
            connection_id,
            reason,
        } => {
            ctx.connections.cleanup(&connection_id, &reason);
        }
        ControlMessage::StatusRequest => {
            let response = ControlMessage::StatusResponse {
                client_id: session.client_id().to_string(),
                tunnels: ctx.registry.snapshot(Some(session.client_id())),
                uptime_secs: ctx.started_at.elapsed().as_secs(),
                timestamp: Utc::now(),
            };
            let _ = session.send(response).await;
        }
        ControlMessage::Ping => {
            let _ = session.send(ControlMessage::Pong).await;
        }
        ControlMessage::Pong => {}
        other => {
            debug!(client_id = %session.client_id(), kind = other.kind(), "dropping unexpected message");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_list_accepts_anything() {
        assert!(token_allowed(&[], "whatever"));
        assert!(token_allowed(&[], ""));
    }

    #[test]
    fn token_must_match_exactly() {
        let tokens = vec!["secret".to_string(), "other".to_string()];
        assert!(token_allowed(&tokens, "secret"));
        assert!(token_allowed(&tokens, "other"));
        assert!(!token_allowed(&tokens, "Secret"));
        assert!(!token_allowed(&tokens, ""));
    }

    #[tokio::test]
    async fn session_handle_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let handle = SessionHandle::new("client-a".to_string(), tx);
        drop(rx);
        assert!(handle.send(ControlMessage::Ping).await.is_err());
    }
}
