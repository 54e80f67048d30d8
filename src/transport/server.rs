//! HTTP/1.1 listener and per-connection driver.
//!
//! # Connection Flow
//!
//! 1. [`HttpServer::bind`] binds the listener (port 0 picks a free port)
//! 2. [`HttpServer::serve`] accepts connections until shutdown is signalled
//! 3. Each connection gets its own task reading request heads
//! 4. A head carrying `Upgrade: websocket` leaves HTTP processing and is
//!    handed over as a [`RawSocket`]
//! 5. Any other head becomes a [`Request`] plus [`ServerResponse`]; the
//!    driver pumps the body, then waits for the response before reading the
//!    next head
//!
//! Stopping the listener does not touch connections already accepted.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;

use super::head::ResponseHead;
use super::request::{BodyFraming, BodyReceiver, Limits, Request, RequestReader};
use super::response::ServerResponse;
use super::socket::{CloseSignal, RawSocket};

// ============================================================================
// Types
// ============================================================================

/// Response object type produced by the driver.
pub type HttpResponse = ServerResponse<OwnedWriteHalf>;

/// Receives requests from the transport.
///
/// Both callbacks must return quickly; long-running work belongs in a
/// spawned task. The driver keeps reading the request body while the
/// callback's task runs.
pub trait TransportEvents: Send + Sync + 'static {
    /// A plain HTTP request arrived.
    fn on_request(self: Arc<Self>, request: Request, response: HttpResponse, close: CloseSignal);

    /// A request asked for a WebSocket upgrade.
    ///
    /// `head` holds any bytes the client sent after the request head.
    fn on_upgrade(self: Arc<Self>, request: Request, socket: RawSocket, head: Bytes, close: CloseSignal);
}

// ============================================================================
// HttpServer
// ============================================================================

/// A bound listener that has not started accepting yet.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    limits: Limits,
}

impl HttpServer {
    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn bind(addr: SocketAddr, limits: Limits) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "HTTP server bound");

        Ok(Self {
            listener,
            local_addr,
            limits,
        })
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve<E: TransportEvents>(self, events: Arc<E>, shutdown: CancellationToken) {
        info!(local_addr = %self.local_addr, "Accept loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!(?addr, "TCP connection accepted");
                        let events = Arc::clone(&events);
                        tokio::spawn(serve_connection(stream, addr, self.limits, events));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                },
            }
        }

        info!(local_addr = %self.local_addr, "Accept loop terminated");
    }
}

// ============================================================================
// Connection Driver
// ============================================================================

/// Serves requests on one connection until it closes or upgrades.
async fn serve_connection<E: TransportEvents>(
    stream: TcpStream,
    remote_addr: SocketAddr,
    limits: Limits,
    events: Arc<E>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(error = %e, "set_nodelay failed");
    }

    let (read, write) = stream.into_split();
    let mut reader = RequestReader::new(read, limits);
    let mut writer = Some(write);

    loop {
        let Some(write) = writer.take() else {
            return;
        };

        let head = match reader.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!(?remote_addr, "Connection closed by peer");
                return;
            }
            Err(e) => {
                if let Some((status, message)) = e.status() {
                    debug!(?remote_addr, status, "Rejecting request head");
                    reject(write, status, message).await;
                } else {
                    debug!(?remote_addr, error = ?e, "Connection failed while reading head");
                }
                return;
            }
        };

        if head.is_upgrade() {
            let (read, leftover) = reader.into_parts();
            let stream = match read.reunite(write) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to reassemble upgrade socket");
                    return;
                }
            };

            let close = CloseSignal::new();
            let request = head.into_request(Some(remote_addr), BodyReceiver::empty());
            let socket = RawSocket::new(stream, close.clone());

            debug!(?remote_addr, "Upgrade request received");
            events.on_upgrade(request, socket, leftover, close);
            return;
        }

        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                debug!(?remote_addr, error = %e, "Rejecting request body framing");
                reject(write, 400, "Bad Request").await;
                return;
            }
        };

        let keep_alive = head.wants_keep_alive();
        let head_request = head.method.as_ref() == Some(&Method::HEAD);
        let (body_tx, body) = match framing {
            BodyFraming::Empty => (None, BodyReceiver::empty()),
            _ => {
                let (tx, rx) = BodyReceiver::channel();
                (Some(tx), rx)
            }
        };

        let close = CloseSignal::new();
        let (done_tx, mut done_rx) = oneshot::channel();
        let response = ServerResponse::new(write, head.version, head_request, keep_alive, done_tx);
        let request = head.into_request(Some(remote_addr), body);

        Arc::clone(&events).on_request(request, response, close.clone());

        if let Some(tx) = body_tx
            && let Err(e) = reader.pump_body(framing, tx, &close).await
        {
            debug!(?remote_addr, error = %e, "Request body aborted");
            close.fire();
            return;
        }

        let handback = tokio::select! {
            done = &mut done_rx => done,
            closed = reader.peer_closed() => {
                if closed {
                    trace!(?remote_addr, "Peer closed before response");
                    close.fire();
                    return;
                }
                done_rx.await
            }
        };

        match handback {
            Ok(Some(write)) => writer = Some(write),
            _ => return,
        }
    }
}

/// Writes an empty error response and closes the connection.
async fn reject(mut write: OwnedWriteHalf, status: u16, message: &str) {
    let mut head = ResponseHead::new(status, message);
    head.headers.append("connection", "close");
    head.headers.append("content-length", "0");

    if write.write_all(&head.encode()).await.is_ok() {
        let _ = write.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
