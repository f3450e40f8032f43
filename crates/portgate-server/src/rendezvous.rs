//! Rendezvous between accepted external sockets and client data channels.
//!
//! Every external connection accepted on a public listener is parked in the
//! pending table under a fresh `connectionId` until the owning client reports
//! its data port (`connection_ready`), at which point the server dials the
//! data channel and splices the two sockets. Pending entries that outlive
//! their deadline are destroyed. All paths that retire a connection funnel
//! through [`ConnectionTable::cleanup`], which is idempotent.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::registry::TunnelStats;

/// A rendezvous in progress: external socket accepted, data channel not yet
/// established.
struct PendingConn {
    remote_port: u16,
    external: TcpStream,
    peer: SocketAddr,
    stats: Arc<TunnelStats>,
    deadline: Option<AbortHandle>,
}

/// A spliced pair. The splice task owns both sockets; aborting it destroys
/// them.
struct ActiveConn {
    remote_port: u16,
    task: AbortHandle,
    stats: Arc<TunnelStats>,
}

/// Shared pending/active connection tables.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    pending: Arc<DashMap<String, PendingConn>>,
    active: Arc<DashMap<String, ActiveConn>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a freshly accepted external socket until the client's data port
    /// arrives. Destroys the socket if `deadline` elapses first.
    pub fn insert_pending(
        &self,
        connection_id: String,
        remote_port: u16,
        external: TcpStream,
        peer: SocketAddr,
        stats: Arc<TunnelStats>,
        deadline: Duration,
    ) {
        self.pending.insert(
            connection_id.clone(),
            PendingConn {
                remote_port,
                external,
                peer,
                stats,
                deadline: None,
            },
        );

        let table = self.clone();
        let id = connection_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if table.pending.contains_key(&id) {
                warn!(connection_id = %id, "rendezvous deadline elapsed, dropping external connection");
                table.cleanup(&id, "rendezvous deadline elapsed");
            }
        });

        // The entry may already be gone if the client answered between the
        // insert and here; the timer then finds nothing to expire.
        if let Some(mut entry) = self.pending.get_mut(&connection_id) {
            entry.deadline = Some(timer.abort_handle());
        } else {
            timer.abort();
        }
    }

    /// Promote a pending connection: dial the client's data port and splice
    /// it with the parked external socket. Stale or unknown ids are logged
    /// and ignored; the control channel stays up.
    pub async fn complete(
        &self,
        connection_id: &str,
        data_host: &str,
        data_port: u16,
        dial_timeout: Duration,
    ) {
        let Some((_, pending)) = self.pending.remove(connection_id) else {
            warn!(connection_id, "connection_ready for unknown or expired connection");
            return;
        };
        if let Some(timer) = &pending.deadline {
            timer.abort();
        }
        let PendingConn {
            remote_port,
            external,
            peer,
            stats,
            ..
        } = pending;

        let addr = format!("{data_host}:{data_port}");
        let data = match tokio::time::timeout(dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(connection_id, %addr, error = %e, "data channel dial failed");
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                warn!(connection_id, %addr, "data channel dial timed out");
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        debug!(connection_id, remote_port, external_peer = %peer, data_addr = %addr, "splicing connection");

        // Gate the splice task on its table registration so it cannot finish
        // (and try to deregister) before it is inserted.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let table = self.clone();
        let id = connection_id.to_string();
        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            splice(id, external, data, task_stats, table).await;
        });

        self.active.insert(
            connection_id.to_string(),
            ActiveConn {
                remote_port,
                task: task.abort_handle(),
                stats,
            },
        );
        let _ = registered_tx.send(());
    }

    /// Retire a connection wherever it currently lives. Safe to call any
    /// number of times; the stats counter is decremented exactly once.
    pub fn cleanup(&self, connection_id: &str, reason: &str) {
        if let Some((_, pending)) = self.pending.remove(connection_id) {
            if let Some(timer) = pending.deadline {
                timer.abort();
            }
            pending.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug!(connection_id, reason, "pending connection destroyed");
            return;
        }
        if let Some((_, active)) = self.active.remove(connection_id) {
            active.task.abort();
            active.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug!(connection_id, reason, "active connection destroyed");
        }
    }

    /// Destroy every pending and active connection belonging to one tunnel.
    /// Used during tunnel teardown; never fails.
    pub fn drain_port(&self, remote_port: u16) {
        self.pending.retain(|connection_id, pending| {
            if pending.remote_port != remote_port {
                return true;
            }
            if let Some(timer) = &pending.deadline {
                timer.abort();
            }
            pending.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug!(connection_id, remote_port, "pending connection destroyed by teardown");
            false
        });
        self.active.retain(|connection_id, active| {
            if active.remote_port != remote_port {
                return true;
            }
            active.task.abort();
            active.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug!(connection_id, remote_port, "active connection destroyed by teardown");
            false
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Pump bytes both ways until either side closes, then retire the pair.
/// `copy_bidirectional` forwards half-closes, so a one-way shutdown on
/// either socket reaches the other end before the pair is destroyed.
async fn splice(
    connection_id: String,
    mut external: TcpStream,
    mut data: TcpStream,
    stats: Arc<TunnelStats>,
    table: ConnectionTable,
) {
    match copy_bidirectional(&mut external, &mut data).await {
        Ok((inbound, outbound)) => {
            stats.bytes_in.fetch_add(inbound, Ordering::Relaxed);
            stats.bytes_out.fetch_add(outbound, Ordering::Relaxed);
            debug!(connection_id = %connection_id, inbound, outbound, "connection closed");
        }
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "connection errored");
        }
    }

    if table.active.remove(&connection_id).is_some() {
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A connected pair of sockets over loopback.
    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn deadline_destroys_pending_connection() {
        let table = ConnectionTable::new();
        let stats = Arc::new(TunnelStats::default());
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (_client, server, peer) = socket_pair().await;
        table.insert_pending(
            "c-1".into(),
            3000,
            server,
            peer,
            stats.clone(),
            Duration::from_millis(50),
        );
        assert_eq!(table.pending_count(), 1);

        assert!(
            wait_until(Duration::from_secs(2), || table.pending_count() == 0).await,
            "pending entry should expire"
        );
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let table = ConnectionTable::new();
        let stats = Arc::new(TunnelStats::default());
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (_client, server, peer) = socket_pair().await;
        table.insert_pending(
            "c-2".into(),
            3000,
            server,
            peer,
            stats.clone(),
            Duration::from_secs(30),
        );

        table.cleanup("c-2", "test");
        table.cleanup("c-2", "test");
        table.cleanup("never-existed", "test");

        assert_eq!(table.pending_count(), 0);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn complete_for_unknown_id_is_harmless() {
        let table = ConnectionTable::new();
        table
            .complete("ghost", "127.0.0.1", 1, Duration::from_millis(100))
            .await;
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test]
    async fn promoted_pair_splices_and_counts_bytes() {
        let table = ConnectionTable::new();
        let stats = Arc::new(TunnelStats::default());
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Stand-in for the client's one-shot data listener: echoes bytes.
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = data_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (mut external_client, external_server, peer) = socket_pair().await;
        table.insert_pending(
            "c-3".into(),
            3000,
            external_server,
            peer,
            stats.clone(),
            Duration::from_secs(30),
        );

        table
            .complete("c-3", "127.0.0.1", data_port, Duration::from_secs(5))
            .await;
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.active_count(), 1);

        external_client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        external_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(external_client);
        assert!(
            wait_until(Duration::from_secs(2), || table.active_count() == 0).await,
            "pair should retire once the external socket closes"
        );
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 5);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn drain_port_only_touches_its_tunnel() {
        let table = ConnectionTable::new();
        let stats_a = Arc::new(TunnelStats::default());
        let stats_b = Arc::new(TunnelStats::default());
        stats_a.active_connections.fetch_add(1, Ordering::Relaxed);
        stats_b.active_connections.fetch_add(1, Ordering::Relaxed);

        let (_ca, sa, pa) = socket_pair().await;
        let (_cb, sb, pb) = socket_pair().await;
        table.insert_pending("a".into(), 3000, sa, pa, stats_a.clone(), Duration::from_secs(30));
        table.insert_pending("b".into(), 4000, sb, pb, stats_b.clone(), Duration::from_secs(30));

        table.drain_port(3000);

        assert_eq!(table.pending_count(), 1);
        assert_eq!(stats_a.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats_b.active_connections.load(Ordering::Relaxed), 1);
    }
}
