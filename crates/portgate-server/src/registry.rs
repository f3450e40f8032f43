//! Tunnel registry and public listeners.
//!
//! Maps each public port to the tunnel that owns it. Registration binds the
//! TCP listener (retrying through TIME_WAIT), teardown drains the tunnel's
//! connections, closes the listener, and holds the port back for a short
//! release delay before it may be registered again.

use portgate_proto::{ControlMessage, PortList, TunnelInfo, TunnelSpec};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::SessionHandle;
use crate::rendezvous::ConnectionTable;

/// Attempts after the initial bind when the port is still held by the OS or
/// by a draining tunnel.
const BIND_RETRIES: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Grace after closing a listener before the port is offered for reuse.
const PORT_RELEASE_DELAY: Duration = Duration::from_millis(100);

/// Per-tunnel counters, updated from accept and splice tasks.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

struct Tunnel {
    spec: TunnelSpec,
    owner: String,
    stats: Arc<TunnelStats>,
    accept_task: JoinHandle<()>,
}

/// Lifecycle of one public port inside the registry.
enum Slot {
    /// Registration in flight: port claimed, listener not yet bound.
    Reserved,
    Active(Tunnel),
    /// Teardown in flight: listener closed, release delay still running.
    Draining,
}

enum Reservation {
    Reserved,
    Draining,
    Taken,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("port {port} is not allowed by the server's port list")]
    NotAllowed { port: u16 },

    #[error("port {port} is already in use by another tunnel")]
    Taken { port: u16 },

    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

pub struct TunnelRegistry {
    bind_host: String,
    allowed: PortList,
    connection_timeout: Duration,
    connections: ConnectionTable,
    tunnels: Mutex<HashMap<u16, Slot>>,
}

impl TunnelRegistry {
    pub fn new(
        bind_host: String,
        allowed: PortList,
        connection_timeout: Duration,
        connections: ConnectionTable,
    ) -> Self {
        Self {
            bind_host,
            allowed,
            connection_timeout,
            connections,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Register one tunnel for the given session and start its public
    /// listener.
    ///
    /// A port held by a draining tunnel or still in TIME_WAIT is treated as
    /// transient: the bind is retried up to [`BIND_RETRIES`] times with
    /// [`BIND_RETRY_DELAY`] spacing. A port owned by a live tunnel fails
    /// immediately.
    pub async fn register(
        &self,
        spec: &TunnelSpec,
        session: &SessionHandle,
    ) -> Result<(), RegisterError> {
        let port = spec.remote_port;
        if port == 0 || !self.allowed.allows(port) {
            return Err(RegisterError::NotAllowed { port });
        }

        let mut reserved = false;
        let mut attempt = 0u32;
        let bound = loop {
            if !reserved {
                match self.reserve(port) {
                    Reservation::Reserved => reserved = true,
                    Reservation::Draining if attempt < BIND_RETRIES => {
                        attempt += 1;
                        debug!(port, attempt, "port still draining, retrying registration");
                        tokio::time::sleep(BIND_RETRY_DELAY).await;
                        continue;
                    }
                    Reservation::Draining | Reservation::Taken => {
                        return Err(RegisterError::Taken { port });
                    }
                }
            }
            match TcpListener::bind((self.bind_host.as_str(), port)).await {
                Ok(listener) => break Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_RETRIES => {
                    attempt += 1;
                    warn!(port, attempt, "public port in use, retrying bind");
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => break Err(e),
            }
        };

        match bound {
            Ok(listener) => {
                self.activate(spec, session, listener);
                Ok(())
            }
            Err(source) => {
                self.release_reservation(port);
                Err(RegisterError::Bind { port, source })
            }
        }
    }

    fn reserve(&self, port: u16) -> Reservation {
        let mut tunnels = self.tunnels.lock().unwrap();
        match tunnels.get(&port) {
            None => {
                tunnels.insert(port, Slot::Reserved);
                Reservation::Reserved
            }
            Some(Slot::Draining) => Reservation::Draining,
            Some(Slot::Reserved) | Some(Slot::Active(_)) => Reservation::Taken,
        }
    }

    fn release_reservation(&self, port: u16) {
        let mut tunnels = self.tunnels.lock().unwrap();
        if matches!(tunnels.get(&port), Some(Slot::Reserved)) {
            tunnels.remove(&port);
        }
    }

    fn activate(&self, spec: &TunnelSpec, session: &SessionHandle, listener: TcpListener) {
        let stats = Arc::new(TunnelStats::default());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            spec.remote_port,
            session.clone(),
            stats.clone(),
            self.connections.clone(),
            self.connection_timeout,
        ));

        let tunnel = Tunnel {
            spec: spec.clone(),
            owner: session.client_id().to_string(),
            stats,
            accept_task,
        };
        info!(
            client_id = %tunnel.owner,
            tunnel = %tunnel.spec,
            "tunnel registered"
        );
        self.tunnels
            .lock()
            .unwrap()
            .insert(spec.remote_port, Slot::Active(tunnel));
    }

    /// Tear down the tunnel on `remote_port`: destroy its connections, close
    /// the listener, and free the port after the release delay. A no-op for
    /// ports without an active tunnel.
    pub async fn teardown(&self, remote_port: u16) {
        let tunnel = {
            let mut tunnels = self.tunnels.lock().unwrap();
            match tunnels.remove(&remote_port) {
                Some(Slot::Active(tunnel)) => {
                    tunnels.insert(remote_port, Slot::Draining);
                    tunnel
                }
                Some(other) => {
                    tunnels.insert(remote_port, other);
                    return;
                }
                None => return,
            }
        };

        info!(remote_port, name = %tunnel.spec.name, "tearing down tunnel");
        self.connections.drain_port(remote_port);

        tunnel.accept_task.abort();
        let _ = tunnel.accept_task.await;
        // The accept loop may have parked a connection between the drain and
        // the listener close; sweep again now that no more can arrive.
        self.connections.drain_port(remote_port);

        // Grant the OS time to release the bound address before the port can
        // be registered again.
        tokio::time::sleep(PORT_RELEASE_DELAY).await;
        self.tunnels.lock().unwrap().remove(&remote_port);
        debug!(remote_port, "port released");
    }

    /// Tear down every tunnel owned by `client_id`. One tunnel's teardown
    /// never blocks the others.
    pub async fn remove_client(&self, client_id: &str) {
        let ports = self.ports_owned_by(Some(client_id));
        if ports.is_empty() {
            return;
        }
        info!(client_id, ?ports, "tearing down tunnels for disconnected client");
        futures_util::future::join_all(ports.into_iter().map(|port| self.teardown(port))).await;
    }

    /// Tear down everything. Used on graceful shutdown.
    pub async fn teardown_all(&self) {
        let ports = self.ports_owned_by(None);
        futures_util::future::join_all(ports.into_iter().map(|port| self.teardown(port))).await;
    }

    fn ports_owned_by(&self, client_id: Option<&str>) -> Vec<u16> {
        let tunnels = self.tunnels.lock().unwrap();
        tunnels
            .iter()
            .filter_map(|(port, slot)| match slot {
                Slot::Active(t) if client_id.is_none() || client_id == Some(t.owner.as_str()) => {
                    Some(*port)
                }
                _ => None,
            })
            .collect()
    }

    /// Snapshot of live tunnels, optionally restricted to one client, sorted
    /// by public port.
    pub fn snapshot(&self, client_id: Option<&str>) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock().unwrap();
        let mut infos: Vec<TunnelInfo> = tunnels
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(t) if client_id.is_none() || client_id == Some(t.owner.as_str()) => {
                    Some(TunnelInfo {
                        remote_port: t.spec.remote_port,
                        local_port: t.spec.local_port,
                        name: t.spec.name.clone(),
                        active_connections: t.stats.active_connections.load(Ordering::Relaxed),
                        total_connections: t.stats.total_connections.load(Ordering::Relaxed),
                        bytes_in: t.stats.bytes_in.load(Ordering::Relaxed),
                        bytes_out: t.stats.bytes_out.load(Ordering::Relaxed),
                    })
                }
                _ => None,
            })
            .collect();
        infos.sort_by_key(|info| info.remote_port);
        infos
    }
}

/// Accept loop for one public listener. Each accepted socket is parked in
/// the pending table and announced to the owning client.
async fn accept_loop(
    listener: TcpListener,
    remote_port: u16,
    session: SessionHandle,
    stats: Arc<TunnelStats>,
    connections: ConnectionTable,
    connection_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((external, peer)) => {
                let connection_id = Uuid::new_v4().to_string();
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                debug!(connection_id = %connection_id, remote_port, %peer, "external connection accepted");

                connections.insert_pending(
                    connection_id.clone(),
                    remote_port,
                    external,
                    peer,
                    stats.clone(),
                    connection_timeout,
                );

                let announce = ControlMessage::NewConnection {
                    connection_id: connection_id.clone(),
                    remote_port,
                    client_address: peer.to_string(),
                };
                if session.send(announce).await.is_err() {
                    warn!(remote_port, "control channel closed, dropping external connection");
                    connections.cleanup(&connection_id, "control channel closed");
                }
            }
            Err(e) => {
                warn!(remote_port, error = %e, "accept failed on public listener");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
