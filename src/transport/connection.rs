//! Upgraded WebSocket connection and its event loop.
//!
//! This module wraps a `tokio-tungstenite` stream behind a cloneable
//! [`WsConnection`] handle.
//!
//! # Event Loop
//!
//! Two tasks serve each connection:
//!
//! - A writer task drains outbound commands (frames, pings, close) so
//!   senders never wait on the socket.
//! - A [`ConnectionReader`] reads inbound frames and hands each message to
//!   [`ConnectionEvents::on_message`], one at a time and in arrival order.
//!   Once the socket closes it calls [`ConnectionEvents::on_close`] once.
//!
//! Pausing a connection stops the reader from pulling frames until
//! [`WsConnection::resume`] is called.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

// ============================================================================
// Types
// ============================================================================

/// Frame type of an application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Frames flow both ways.
    Open = 0,
    /// A close frame was sent; waiting for the peer.
    Closing = 1,
    /// The socket is gone.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Callbacks fired by the connection reader.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// A text or binary message arrived.
    async fn on_message(&self, connection: &WsConnection, payload: Bytes, kind: MessageKind);

    /// The connection closed. Called exactly once.
    async fn on_close(&self, connection: &WsConnection);
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the writer task.
enum ConnectionCommand {
    /// Send a data frame.
    Send(Message),
    /// Send a ping.
    Ping,
    /// Start the close handshake.
    Close(Option<CloseFrame>),
}

// ============================================================================
// WsConnection
// ============================================================================

/// Shared connection state.
struct Inner {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    state: AtomicU8,
    paused: AtomicBool,
    resumed: Notify,
}

/// Handle to an upgraded WebSocket connection.
///
/// Cheap to clone; every clone addresses the same socket.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl PartialEq for WsConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for WsConnection {}

impl WsConnection {
    /// Wraps an upgraded stream.
    ///
    /// Spawns the writer task. The returned [`ConnectionReader`] must be run
    /// to receive frames; nothing is read until then.
    pub fn new<S>(stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> (Self, ConnectionReader<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                remote_addr,
                command_tx,
                state: AtomicU8::new(ConnectionState::Open as u8),
                paused: AtomicBool::new(false),
                resumed: Notify::new(),
            }),
        };

        tokio::spawn(Self::run_writer(
            connection.id(),
            Arc::downgrade(&connection.inner),
            sink,
            command_rx,
        ));

        let reader = ConnectionReader {
            connection: connection.clone(),
            stream,
        };

        (connection, reader)
    }

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the peer address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns `true` while the connection is open.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns `true` while inbound reading is paused.
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Stops reading inbound frames.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resumes reading inbound frames.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.resumed.notify_waiters();
    }

    /// Queues a data frame.
    ///
    /// `compressed` asks for per-message compression. The handshake does not
    /// negotiate `permessage-deflate`, so frames currently go out as-is.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUtf8`] if a text frame is not valid UTF-8
    /// - [`Error::ConnectionClosed`] if the connection is gone
    pub fn send(&self, kind: MessageKind, data: Bytes, compressed: bool) -> Result<()> {
        let message = Self::frame(kind, data)?;
        trace!(id = %self.inner.id, ?kind, compressed, "Queueing frame");
        self.send_message(message)
    }

    /// Queues an already built frame.
    pub(crate) fn send_message(&self, message: Message) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .command_tx
            .send(ConnectionCommand::Send(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Builds a data frame.
    pub(crate) fn frame(kind: MessageKind, data: Bytes) -> Result<Message> {
        Ok(match kind {
            MessageKind::Binary => Message::Binary(data),
            MessageKind::Text => Message::Text(Utf8Bytes::try_from(data)?),
        })
    }

    /// Queues a ping.
    pub fn ping(&self) {
        let _ = self.inner.command_tx.send(ConnectionCommand::Ping);
    }

    /// Starts the close handshake.
    ///
    /// Without a code the close frame carries no status.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from(reason.unwrap_or_default().to_owned()),
        });

        let _ = self.inner.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.inner.command_tx.send(ConnectionCommand::Close(frame));
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Writer task: drains commands into the socket.
    async fn run_writer<S>(
        id: ConnectionId,
        inner: Weak<Inner>,
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(command) = command_rx.recv().await {
            let result = match command {
                ConnectionCommand::Send(message) => sink.send(message).await,
                ConnectionCommand::Ping => sink.send(Message::Ping(Bytes::new())).await,
                ConnectionCommand::Close(frame) => sink.send(Message::Close(frame)).await,
            };

            if let Err(e) = result {
                debug!(%id, error = %e, "WebSocket write failed");
                if let Some(inner) = inner.upgrade() {
                    inner.state.store(ConnectionState::Closed as u8, Ordering::Release);
                }
                break;
            }
        }

        trace!(%id, "Writer task terminated");
    }
}

// ============================================================================
// ConnectionReader
// ============================================================================

/// Read half of a connection. Run it with [`ConnectionReader::run`].
pub struct ConnectionReader<S> {
    connection: WsConnection,
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Reads frames until the socket closes, dispatching to `events`.
    pub async fn run<E>(mut self, events: &E)
    where
        E: ConnectionEvents + ?Sized,
    {
        let id = self.connection.id();

        loop {
            while self.connection.is_paused() {
                let resumed = self.connection.inner.resumed.notified();
                if !self.connection.is_paused() {
                    break;
                }
                resumed.await;
            }

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    events
                        .on_message(&self.connection, Bytes::from(text), MessageKind::Text)
                        .await;
                }

                Some(Ok(Message::Binary(data))) => {
                    events
                        .on_message(&self.connection, data, MessageKind::Binary)
                        .await;
                }

                Some(Ok(Message::Close(frame))) => {
                    debug!(%id, ?frame, "WebSocket closed by remote");
                    break;
                }

                Some(Err(e)) => {
                    warn!(%id, error = %e, "WebSocket error");
                    break;
                }

                None => {
                    debug!(%id, "WebSocket stream ended");
                    break;
                }

                // Ping, Pong and raw frames are handled by tungstenite.
                Some(Ok(_)) => {}
            }
        }

        self.connection.set_state(ConnectionState::Closed);
        events.on_close(&self.connection).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
