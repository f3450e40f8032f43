//! Client side of the rendezvous: data-channel acceptors.
//!
//! For every `new_connection` the client dials the local service, binds a
//! one-shot loopback listener, reports its port with `connection_ready`, and
//! waits for the server's dial. The accepted data socket is then spliced
//! with the local service socket.

use dashmap::DashMap;
use portgate_proto::ControlMessage;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
enum DataError {
    #[error("failed to reach local service on port {local_port}: {source}")]
    LocalDial { local_port: u16, source: io::Error },

    #[error("failed to open data listener: {0}")]
    Listen(io::Error),

    #[error("data channel accept failed: {0}")]
    Accept(io::Error),

    #[error("timed out waiting for the server to dial the data channel")]
    AcceptTimeout,

    #[error("control channel closed")]
    ControlClosed,
}

/// Live data connections keyed by `connectionId`. Entries remove themselves
/// when their task ends; `connection_closed` from the server aborts them.
#[derive(Clone, Default)]
pub struct ActiveConnections {
    inner: Arc<DashMap<String, AbortHandle>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Start serving one rendezvous. Failures are reported to the server as
    /// `connection_closed`; they never take down the control session.
    pub fn spawn(
        &self,
        connection_id: String,
        local_host: String,
        local_port: u16,
        accept_timeout: Duration,
        out_tx: mpsc::Sender<ControlMessage>,
    ) {
        // Gate the task on its map registration so it cannot finish (and try
        // to deregister) before it is inserted.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let registry = self.clone();
        let id = connection_id.clone();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            if let Err(e) = run_connection(&id, &local_host, local_port, accept_timeout, &out_tx).await
            {
                warn!(connection_id = %id, error = %e, "data connection failed");
                let _ = out_tx
                    .send(ControlMessage::ConnectionClosed {
                        connection_id: id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
            }
            registry.inner.remove(&id);
        });

        self.inner.insert(connection_id, task.abort_handle());
        let _ = registered_tx.send(());
    }

    /// Abort a connection the server reported closed. Unknown ids are fine;
    /// the task may have retired itself already.
    pub fn abort(&self, connection_id: &str, reason: &str) {
        if let Some((_, task)) = self.inner.remove(connection_id) {
            task.abort();
            debug!(connection_id, reason, "data connection aborted");
        }
    }
}

async fn run_connection(
    connection_id: &str,
    local_host: &str,
    local_port: u16,
    accept_timeout: Duration,
    out_tx: &mpsc::Sender<ControlMessage>,
) -> Result<(), DataError> {
    // Local service first: if it is down there is nothing to announce.
    let mut local = TcpStream::connect((local_host, local_port))
        .await
        .map_err(|source| DataError::LocalDial { local_port, source })?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(DataError::Listen)?;
    let data_port = listener.local_addr().map_err(DataError::Listen)?.port();

    out_tx
        .send(ControlMessage::ConnectionReady {
            connection_id: connection_id.to_string(),
            data_port,
        })
        .await
        .map_err(|_| DataError::ControlClosed)?;

    // One-shot listener: exactly one accept, then it is closed.
    let (mut data, peer) = match tokio::time::timeout(accept_timeout, listener.accept()).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => return Err(DataError::Accept(e)),
        Err(_) => return Err(DataError::AcceptTimeout),
    };
    drop(listener);
    debug!(connection_id, data_port, server_peer = %peer, "data channel established");

    match copy_bidirectional(&mut data, &mut local).await {
        Ok((from_server, to_server)) => {
            debug!(connection_id, from_server, to_server, "data connection closed");
        }
        Err(e) => {
            debug!(connection_id, error = %e, "data connection errored");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

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
    async fn reports_unreachable_local_service() {
        let active = ActiveConnections::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        // A port nothing listens on: bind, take the port, drop the listener.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        active.spawn(
            "c-1".into(),
            "127.0.0.1".into(),
            dead_port,
            Duration::from_secs(1),
            out_tx,
        );

        match out_rx.recv().await {
            Some(ControlMessage::ConnectionClosed { connection_id, reason }) => {
                assert_eq!(connection_id, "c-1");
                assert!(reason.contains("local service"), "reason: {reason}");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(wait_until(Duration::from_secs(2), || active.is_empty()).await);
    }

    #[tokio::test]
    async fn accept_timeout_reports_connection_closed() {
        let active = ActiveConnections::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        // A live local service the connection can dial.
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _sock = local.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        active.spawn(
            "c-2".into(),
            "127.0.0.1".into(),
            local_port,
            Duration::from_millis(100),
            out_tx,
        );

        // connection_ready first, then the timeout report. Nobody dials the
        // advertised port.
        match out_rx.recv().await {
            Some(ControlMessage::ConnectionReady { connection_id, .. }) => {
                assert_eq!(connection_id, "c-2");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match out_rx.recv().await {
            Some(ControlMessage::ConnectionClosed { connection_id, reason }) => {
                assert_eq!(connection_id, "c-2");
                assert!(reason.contains("timed out"), "reason: {reason}");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(wait_until(Duration::from_secs(2), || active.is_empty()).await);
    }

    #[tokio::test]
    async fn splices_data_channel_with_local_service() {
        let active = ActiveConnections::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        // Echoing local service.
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = local.accept().await.unwrap();
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

        active.spawn(
            "c-3".into(),
            "127.0.0.1".into(),
            local_port,
            Duration::from_secs(5),
            out_tx,
        );

        let data_port = match out_rx.recv().await {
            Some(ControlMessage::ConnectionReady { data_port, .. }) => data_port,
            other => panic!("unexpected message: {other:?}"),
        };

        // Play the server: dial the advertised data port.
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        data.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(data);
        assert!(wait_until(Duration::from_secs(2), || active.is_empty()).await);
    }
}
