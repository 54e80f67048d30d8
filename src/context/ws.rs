//! Per-event context for upgraded WebSocket connections.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::identifiers::TopicId;
use crate::registry::SubscriptionRegistry;
use crate::transport::{MessageKind, WsConnection};

// ============================================================================
// Types
// ============================================================================

/// Opaque value threaded from [`HttpContext::upgrade`](crate::HttpContext::upgrade)
/// to every event of the connection.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Lifecycle event a [`WsContext`] was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WsEventKind {
    /// Handshake completed.
    Open,
    /// A message arrived.
    Message,
    /// The connection closed.
    Close,
}

impl fmt::Display for WsEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Close => "close",
        })
    }
}

// ============================================================================
// WsContext
// ============================================================================

/// One WebSocket occurrence: open, message or close.
///
/// Built fresh for every event and immutable afterwards; its methods only
/// act on the connection and the registry.
pub struct WsContext {
    kind: WsEventKind,
    connection: WsConnection,
    message: Bytes,
    message_kind: MessageKind,
    user_data: UserData,
    registry: Arc<SubscriptionRegistry>,
}

impl fmt::Debug for WsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsContext")
            .field("kind", &self.kind)
            .field("connection", &self.connection)
            .field("message_len", &self.message.len())
            .field("message_kind", &self.message_kind)
            .finish_non_exhaustive()
    }
}

impl WsContext {
    pub(crate) fn new(
        kind: WsEventKind,
        connection: WsConnection,
        message: Bytes,
        message_kind: MessageKind,
        user_data: UserData,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            kind,
            connection,
            message,
            message_kind,
            user_data,
            registry,
        }
    }

    /// Context without a payload, used for open and close.
    pub(crate) fn lifecycle(
        kind: WsEventKind,
        connection: WsConnection,
        user_data: UserData,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self::new(kind, connection, Bytes::new(), MessageKind::Text, user_data, registry)
    }

    /// Returns the event kind.
    #[inline]
    #[must_use]
    pub fn event_kind(&self) -> WsEventKind {
        self.kind
    }

    /// Sends a frame.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUtf8`](crate::Error::InvalidUtf8) for a text frame that is not UTF-8
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) once the connection is gone
    pub fn send(&self, kind: MessageKind, data: impl Into<Bytes>, compressed: bool) -> Result<()> {
        self.connection.send(kind, data.into(), compressed)
    }

    /// Starts the close handshake with an optional status code and reason.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.connection.close(code, reason);
    }

    /// Returns the payload. Empty for open and close.
    #[inline]
    #[must_use]
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    /// Returns the payload as text if it is valid UTF-8.
    #[must_use]
    pub fn message_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }

    /// Returns whether the payload arrived as a text or binary frame.
    #[inline]
    #[must_use]
    pub fn message_kind(&self) -> MessageKind {
        self.message_kind
    }

    /// Subscribes this connection to `topic`.
    ///
    /// Returns `false` if it was already subscribed or the connection has
    /// closed, which is always the case inside a `close` handler.
    pub fn subscribe(&self, topic: impl Into<TopicId>) -> bool {
        self.registry.subscribe(topic.into(), &self.connection)
    }

    /// Unsubscribes this connection from `topic`.
    ///
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, topic: impl Into<TopicId>) -> bool {
        self.registry.unsubscribe(topic.into(), &self.connection)
    }

    /// Returns the upgrade data if it is a `T`.
    #[must_use]
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        (*self.user_data).downcast_ref::<T>()
    }

    /// Returns the upgrade data as passed.
    #[inline]
    #[must_use]
    pub fn user_data_raw(&self) -> &UserData {
        &self.user_data
    }

    /// Returns the connection handle.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &WsConnection {
        &self.connection
    }
}

// ============================================================================
// Tests
// ============================================================================
