use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::atomic::AtomicCell;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::time;
use tracing::debug;

use crate::AppError;
use crate::AppResult;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type CloseHandler = Box<dyn Fn(ConnectionId) + Send + Sync>;

/// Which party established the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Another node dialed us; the peer owns the connection lifetime.
    Accepted,
    /// We dialed another node; receipts flow back on this connection.
    Dialed,
}

/// One transport connection to a remote peer.
///
/// The connection exclusively owns its socket. One task may read while
/// another writes, but the node guarantees a single reader per connection.
/// Closing is idempotent: the first `close` flips the connected flag, stamps
/// the disconnect time, shuts the socket down and runs the close handler;
/// later calls do nothing.
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    remote_address: String,

    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    read_timeout: Duration,

    is_connected: AtomicBool,
    connect_time: AtomicCell<Option<DateTime<Utc>>>,
    disconnect_time: AtomicCell<Option<DateTime<Utc>>>,

    last_not_idle: AtomicI64,
    idle_timeout_ms: i64,

    close_handler: OnceCell<CloseHandler>,

    // held for accepted connections so the listener cap frees up on drop
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    pub(crate) fn accepted(
        stream: TcpStream,
        remote_address: String,
        read_timeout: Duration,
        idle_timeout_ms: i64,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Connection {
        Connection::from_stream(
            ConnectionKind::Accepted,
            stream,
            remote_address,
            read_timeout,
            idle_timeout_ms,
            permit,
        )
    }

    pub(crate) fn dialed(
        stream: TcpStream,
        remote_address: String,
        read_timeout: Duration,
        idle_timeout_ms: i64,
    ) -> Connection {
        Connection::from_stream(
            ConnectionKind::Dialed,
            stream,
            remote_address,
            read_timeout,
            idle_timeout_ms,
            None,
        )
    }

    fn from_stream(
        kind: ConnectionKind,
        stream: TcpStream,
        remote_address: String,
        read_timeout: Duration,
        idle_timeout_ms: i64,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Connection {
        let (read_half, write_half) = stream.into_split();
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            remote_address,
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            read_timeout,
            is_connected: AtomicBool::new(true),
            connect_time: AtomicCell::new(Some(Utc::now())),
            disconnect_time: AtomicCell::new(None),
            last_not_idle: AtomicI64::new(Utc::now().timestamp_millis()),
            idle_timeout_ms,
            close_handler: OnceCell::new(),
            _permit: permit,
        }
    }

    /// Registers the hook run on close, typically pool removal. Only the
    /// first registration takes effect.
    pub(crate) fn set_close_handler(&self, handler: CloseHandler) {
        let _ = self.close_handler.set(handler);
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.connect_time.load()
    }

    pub fn disconnect_time(&self) -> Option<DateTime<Utc>> {
        self.disconnect_time.load()
    }

    /// True when idle pruning is enabled and nothing has been read or
    /// written for longer than the idle timeout.
    pub fn is_idle(&self) -> bool {
        if self.idle_timeout_ms < 1 {
            return false;
        }
        Utc::now().timestamp_millis() - self.last_not_idle.load(Ordering::Acquire)
            > self.idle_timeout_ms
    }

    fn not_idle(&self) {
        self.last_not_idle
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Reads into `buf` with the configured per-call timeout.
    ///
    /// A timeout is not an error: it returns `Ok(0)` so poll loops stay
    /// responsive to shutdown. EOF and real I/O errors close the connection
    /// and surface as `Closed`.
    pub async fn read(&self, buf: &mut [u8]) -> AppResult<usize> {
        if !self.is_connected() {
            return Err(AppError::Closed);
        }

        let outcome = {
            let mut read_half = self.read_half.lock().await;
            match time::timeout(self.read_timeout, read_half.read(buf)).await {
                Err(_) => return Ok(0),
                Ok(outcome) => outcome,
            }
        };

        match outcome {
            Ok(0) => {
                self.close().await;
                Err(AppError::Closed)
            }
            Ok(count) => {
                self.not_idle();
                Ok(count)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => Ok(0),
            Err(_) => {
                self.close().await;
                Err(AppError::Closed)
            }
        }
    }

    /// Writes all of `data`. Any error closes the connection and surfaces as
    /// `Closed`; there is no retry.
    pub async fn write(&self, data: &[u8]) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::Closed);
        }

        let outcome = {
            let mut write_half = self.write_half.lock().await;
            write_half.write_all(data).await
        };

        match outcome {
            Ok(()) => {
                self.not_idle();
                Ok(())
            }
            Err(_) => {
                self.close().await;
                Err(AppError::Closed)
            }
        }
    }

    /// Closes the connection. Safe to call any number of times; only the
    /// first call has any effect.
    pub async fn close(&self) {
        if self
            .is_connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.disconnect_time.store(Some(Utc::now()));

        {
            let mut write_half = self.write_half.lock().await;
            let _ = write_half.shutdown().await;
        }

        if let Some(handler) = self.close_handler.get() {
            handler(self.id);
        }

        debug!(id = self.id, remote = %self.remote_address, "connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_address", &self.remote_address)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let conn = Connection::dialed(
            dialed,
            addr.to_string(),
            Duration::from_millis(50),
            60_000,
        );
        (conn, accepted)
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_an_error() {
        let (conn, _peer) = connected_pair().await;
        let mut buf = [0u8; 64];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (conn, mut peer) = connected_pair().await;
        conn.write(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 64];
        let count = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..count], b"pong");
    }

    #[tokio::test]
    async fn test_peer_eof_closes_connection() {
        let (conn, peer) = connected_pair().await;
        drop(peer);

        let mut buf = [0u8; 16];
        // the first read may or may not observe the EOF within one timeout
        let mut closed = false;
        for _ in 0..10 {
            match conn.read(&mut buf).await {
                Err(AppError::Closed) => {
                    closed = true;
                    break;
                }
                Ok(0) => continue,
                other => panic!("unexpected read outcome: {other:?}"),
            }
        }
        assert!(closed);
        assert!(!conn.is_connected());
        assert!(conn.disconnect_time().is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _peer) = connected_pair().await;

        conn.close().await;
        assert!(!conn.is_connected());
        let first_disconnect = conn.disconnect_time().unwrap();

        conn.close().await;
        assert_eq!(conn.disconnect_time().unwrap(), first_disconnect);

        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf).await, Err(AppError::Closed)));
        assert!(matches!(conn.write(b"x").await, Err(AppError::Closed)));
    }

    #[tokio::test]
    async fn test_close_handler_runs_once() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let (conn, _peer) = connected_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        conn.set_close_handler(Box::new(move |_| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        conn.close().await;
        conn.close().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let conn = Connection::dialed(dialed, addr.to_string(), Duration::from_millis(50), 20);
        assert!(!conn.is_idle());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(conn.is_idle());

        // a successful write counts as activity
        conn.write(b"keepalive").await.unwrap();
        assert!(!conn.is_idle());
    }

    #[tokio::test]
    async fn test_idle_disabled_when_timeout_unset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let conn = Connection::dialed(dialed, addr.to_string(), Duration::from_millis(50), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!conn.is_idle());
    }
}
