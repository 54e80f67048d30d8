//! Type-safe identifiers.
//!
//! Newtype wrappers keep connection handles, broadcast topics and upgrade
//! correlation tokens from being mixed up at compile time.
//!
//! | Type | Wraps | Source |
//! |------|-------|--------|
//! | [`ConnectionId`] | `u64` | process-wide counter |
//! | [`TopicId`] | `u32` | chosen by the caller |
//! | [`UpgradeId`] | `Uuid` | random per upgrade |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionId
// ============================================================================

/// Next connection ID. Starts at 1 so `0` never names a live connection.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one upgraded WebSocket connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a fresh, never reused ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TopicId
// ============================================================================

/// Broadcast topic key.
///
/// Topics are small integers allocated by the application; no namespace
/// protection exists, so callers coordinate IDs themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(u32);

impl TopicId {
    /// Creates a topic ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for TopicId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// UpgradeId
// ============================================================================

/// Correlates one in-flight WebSocket handshake with the headers it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpgradeId(Uuid);

impl UpgradeId {
    /// Generates a random upgrade ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.as_u64() > 0);
    }

    #[test]
    fn test_topic_id_from_u32() {
        let topic: TopicId = 7.into();
        assert_eq!(topic, TopicId::new(7));
        assert_eq!(topic.to_string(), "7");
    }

    #[test]
    fn test_upgrade_ids_differ() {
        assert_ne!(UpgradeId::generate(), UpgradeId::generate());
    }
}
