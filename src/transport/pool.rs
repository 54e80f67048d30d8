//! Registry of live WebSocket connections.
//!
//! Every upgraded connection is inserted here after the handshake and
//! removed when its reader finishes. The runtime uses the pool for the
//! keepalive pings and for [`Runtime::connection_count`].
//!
//! [`Runtime::connection_count`]: crate::Runtime::connection_count
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               ClientPool                │
//! │  ┌─────────────────────────────────┐    │
//! │  │ ConnectionId=1 → WsConnection   │    │
//! │  │ ConnectionId=2 → WsConnection   │    │
//! │  │ ConnectionId=3 → WsConnection   │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identifiers::ConnectionId;

use super::connection::WsConnection;

// ============================================================================
// ClientPool
// ============================================================================

/// Live WebSocket connections keyed by [`ConnectionId`].
///
/// Thread-safe; handles are cloned out so no lock is held while sending.
#[derive(Debug, Default)]
pub struct ClientPool {
    connections: RwLock<FxHashMap<ConnectionId, WsConnection>>,
}

impl ClientPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection.
    pub fn insert(&self, connection: WsConnection) {
        let id = connection.id();
        self.connections.write().insert(id, connection);
        debug!(id = %id, "Connection added to pool");
    }

    /// Removes a connection. Returns `true` if it was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&id).is_some();
        if removed {
            debug!(id = %id, "Connection removed from pool");
        }
        removed
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if no connection is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Returns handles to all live connections.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WsConnection> {
        self.connections.read().values().cloned().collect()
    }

    /// Pings every open connection that is not paused.
    ///
    /// Returns how many pings were queued.
    pub fn ping_all(&self) -> usize {
        let mut pinged = 0;
        for connection in self.snapshot() {
            if connection.is_open() && !connection.is_paused() {
                connection.ping();
                pinged += 1;
            }
        }

        trace!(pinged, "Keepalive pings queued");
        pinged
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.connections.write().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
