//! Raw duplex socket of a request that asked for a WebSocket upgrade.
//!
//! No framework response object exists for these requests. If the handler
//! answers with a plain response instead of upgrading, the head is written
//! byte for byte by [`ResponseHead::encode`] and the socket is closed after
//! the body.
//!
//! While the socket is waiting for the handler, a watcher task reads the read
//! side so a peer that goes away is reported through [`CloseSignal`]. Bytes
//! it reads are handed back by [`RawSocket::into_stream`].

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::compression::BodySink;

use super::head::{ResponseHead, ResponseSink};

// ============================================================================
// Constants
// ============================================================================

/// Most bytes the close watcher holds before it stops reading.
const WATCH_BUFFER_LIMIT: usize = 64 * 1024;

/// Read size of the close watcher.
const WATCH_READ_SIZE: usize = 4 * 1024;

// ============================================================================
// CloseSignal
// ============================================================================

/// Fires once when the peer goes away before the response is committed.
///
/// Cloning shares the signal. After [`CloseSignal::disarm`] a later close no
/// longer fires it.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    armed: Arc<AtomicBool>,
}

impl CloseSignal {
    /// Creates an armed signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Reports a closed socket. Ignored once disarmed.
    pub fn fire(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.token.cancel();
        }
    }

    /// Stops listening for closes.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Returns the token observers wait on.
    #[inline]
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns `true` if the signal has fired.
    #[inline]
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ============================================================================
// RawSocket
// ============================================================================

/// A TCP connection taken out of HTTP processing mid-handshake.
pub struct RawSocket {
    writer: Option<OwnedWriteHalf>,
    watcher: Option<JoinHandle<(OwnedReadHalf, BytesMut)>>,
    stop_watch: CancellationToken,
    remote_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl RawSocket {
    /// Wraps `stream` and starts watching it for a peer close.
    pub fn new(stream: TcpStream, close: CloseSignal) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let (mut reader, writer) = stream.into_split();
        let stop_watch = CancellationToken::new();
        let stop = stop_watch.clone();

        let watcher = tokio::spawn(async move {
            let mut early = BytesMut::new();
            tokio::select! {
                _ = stop.cancelled() => {}
                () = watch_for_close(&mut reader, &mut early, &close) => {}
            }
            (reader, early)
        });

        Self {
            writer: Some(writer),
            watcher: Some(watcher),
            stop_watch,
            remote_addr,
        }
    }

    /// Peer address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Stops the watcher and reassembles the TCP stream for the handshake.
    ///
    /// Also returns the bytes the peer sent while the watcher was running.
    /// They belong in front of anything read from the stream afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the socket was already used for a response.
    pub async fn into_stream(mut self) -> io::Result<(TcpStream, Bytes)> {
        self.stop_watch.cancel();

        let watcher = self
            .watcher
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "raw socket already released"))?;
        let (reader, early) = watcher.await.map_err(io::Error::other)?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "raw socket already released"))?;

        let stream = reader.reunite(writer).map_err(io::Error::other)?;
        Ok((stream, early.freeze()))
    }

    fn writer(&mut self) -> io::Result<&mut OwnedWriteHalf> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "raw socket already closed"))
    }
}

/// Reads until the peer goes away, keeping what arrives in `early`.
///
/// Stops watching once `early` reaches [`WATCH_BUFFER_LIMIT`].
async fn watch_for_close(reader: &mut OwnedReadHalf, early: &mut BytesMut, close: &CloseSignal) {
    loop {
        if early.len() >= WATCH_BUFFER_LIMIT {
            trace!(buffered = early.len(), "Raw socket watch buffer full");
            return std::future::pending().await;
        }

        early.reserve(WATCH_READ_SIZE);
        match reader.read_buf(early).await {
            Ok(0) | Err(_) => {
                trace!("Raw socket closed before response");
                close.fire();
                return std::future::pending().await;
            }
            Ok(n) => trace!(n, "Raw socket bytes held for the handshake"),
        }
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        self.stop_watch.cancel();
    }
}

// ============================================================================
// Sink Implementations
// ============================================================================

#[async_trait]
impl ResponseSink for RawSocket {
    async fn commit(&mut self, head: &ResponseHead) -> io::Result<()> {
        let bytes = head.encode();
        self.writer()?.write_all(&bytes).await?;

        trace!(status = head.status, "Raw response head written");
        Ok(())
    }
}

#[async_trait]
impl BodySink for RawSocket {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.stop_watch.cancel();
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn test_manual_response_framing() {
        let (server, mut client) = pair().await;
        let mut socket = RawSocket::new(server, CloseSignal::new());

        let mut head = ResponseHead::new(400, "Bad Request");
        head.headers.append("x-reason", "no upgrade");
        socket.commit(&head).await.unwrap();
        socket.write_chunk(b"nope").await.unwrap();
        socket.finish().await.unwrap();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(
            received,
            "HTTP/1.1 400 Bad Request\r\nx-reason: no upgrade\r\n\r\nnope"
        );
    }

    #[tokio::test]
    async fn test_close_signal_fires_on_peer_close() {
        let (server, client) = pair().await;
        let close = CloseSignal::new();
        let _socket = RawSocket::new(server, close.clone());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), close.token().cancelled())
            .await
            .expect("close signal should fire");
        assert!(close.is_fired());
    }

    #[tokio::test]
    async fn test_disarmed_signal_stays_quiet() {
        let close = CloseSignal::new();
        close.disarm();
        close.fire();
        assert!(!close.is_fired());
    }

    #[tokio::test]
    async fn test_into_stream_reunites() {
        let (server, mut client) = pair().await;
        let close = CloseSignal::new();
        let socket = RawSocket::new(server, close.clone());
        assert!(socket.remote_addr().is_some());

        let (mut stream, early) = socket.into_stream().await.unwrap();
        assert!(early.is_empty());
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(!close.is_fired());
    }

    #[tokio::test]
    async fn test_close_after_early_bytes_still_fires() {
        let (server, mut client) = pair().await;
        let close = CloseSignal::new();
        let _socket = RawSocket::new(server, close.clone());

        client.write_all(b"\x81").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!close.is_fired());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), close.token().cancelled())
            .await
            .expect("close signal should fire");
    }

    #[tokio::test]
    async fn test_early_bytes_are_returned() {
        let (server, mut client) = pair().await;
        let socket = RawSocket::new(server, CloseSignal::new());

        client.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_stream, early) = socket.into_stream().await.unwrap();
        assert_eq!(&early[..], b"early");
    }
}
