//! Shared plumbing for forwarded connections
//!
//! Every tunnel type ends up with a local socket on one side and an SSH
//! channel stream on the other. `bridge` shuttles bytes both ways with an
//! idle timeout, half-closing each direction on EOF, and stops as soon as
//! the tunnel's cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ssh::transport::ConnectionSource;
use crate::ssh::SshError;

/// Idle timeout for forwarded connections (5 minutes)
pub const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const BRIDGE_BUFFER: usize = 32 * 1024;

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent towards the target
    pub bytes_sent: u64,
    /// Total bytes received from the target
    pub bytes_received: u64,
}

/// Lock-free counters shared by a tunnel and its connection tasks
#[derive(Debug, Default)]
pub struct StatsCounter {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a new forwarded connection until the guard drops
    pub fn open(self: &Arc<Self>) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            stats: self.clone(),
        }
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::SeqCst),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active count on drop, whichever way the connection ended
pub struct ConnectionGuard {
    stats: Arc<StatsCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a tunnel's accept loop and connection tasks share
#[derive(Clone)]
pub struct ForwardContext {
    pub forward_id: String,
    pub source: Arc<dyn ConnectionSource>,
    pub stats: Arc<StatsCounter>,
    /// Fires when the tunnel stops; ends the listener and every connection
    pub cancel: CancellationToken,
}

/// Bind a local listener, mapping OS errors to something a user can act on
pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, SshError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr).await.map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                "Port already in use. Another application may be using this port.".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "Permission denied. Ports below 1024 require elevated privileges.".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "Address not available. The specified address is not valid on this system."
                    .to_string()
            }
            _ => e.to_string(),
        };
        SshError::Bind { addr, reason }
    })
}

/// Bridge `local` and `remote` until both directions finish, the
/// connection idles out, or `cancel` fires
pub async fn bridge<L, R>(local: L, remote: R, stats: &StatsCounter, cancel: &CancellationToken)
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let upstream = pipe(local_read, remote_write, &stats.bytes_sent, "local -> remote");
    let downstream = pipe(remote_read, local_write, &stats.bytes_received, "remote -> local");

    tokio::select! {
        _ = async { tokio::join!(upstream, downstream) } => {
            debug!("Forwarded connection closed");
        }
        _ = cancel.cancelled() => {
            debug!("Forwarded connection cancelled");
        }
    }
}

async fn pipe<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    counter: &AtomicU64,
    label: &str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BRIDGE_BUFFER];
    loop {
        match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("{} write error: {}", label, e);
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!("{} read error: {}", label, e);
                break;
            }
            Err(_) => {
                debug!(
                    "{} idle timeout ({}s), closing",
                    label,
                    FORWARD_IDLE_TIMEOUT.as_secs()
                );
                break;
            }
        }
    }
    // Half-close so the peer sees EOF
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active_connections() {
        let stats = StatsCounter::new();
        let a = stats.open();
        let b = stats.open();
        assert_eq!(stats.active(), 2);
        drop(a);
        assert_eq!(stats.snapshot().active_connections, 1);
        drop(b);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.connection_count, 2);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = bind_listener("127.0.0.1", port).await.unwrap_err();
        match err {
            SshError::Bind { addr, reason } => {
                assert_eq!(addr, format!("127.0.0.1:{}", port));
                assert!(reason.contains("already in use"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bridge_counts_both_directions() {
        let (local, mut client) = tokio::io::duplex(1024);
        let (remote, mut server) = tokio::io::duplex(1024);
        let stats = StatsCounter::new();
        let cancel = CancellationToken::new();

        let task = {
            let stats = stats.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge(local, remote, &stats, &cancel).await })
        };

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"pong!!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!!");

        drop(client);
        drop(server);
        task.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 5);
        assert_eq!(snapshot.bytes_received, 6);
    }

    #[tokio::test]
    async fn test_cancel_ends_bridge() {
        let (local, _client) = tokio::io::duplex(64);
        let (remote, _server) = tokio::io::duplex(64);
        let stats = StatsCounter::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), bridge(local, remote, &stats, &cancel))
            .await
            .unwrap();
    }
}
