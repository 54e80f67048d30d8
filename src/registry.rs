//! Topic subscriptions for publish/subscribe fan-out.
//!
//! The registry is an owned service object: the runtime creates one and
//! every [`WsContext`](crate::WsContext) holds a reference to it. Tests
//! create fresh instances.
//!
//! # Invariants
//!
//! - A connection appears at most once per topic.
//! - Empty topics are pruned.
//! - A closed connection is never added back.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::{ConnectionId, TopicId};
use crate::transport::{ConnectionState, WsConnection};

// ============================================================================
// SubscriptionRegistry
// ============================================================================

type Subscribers = FxHashMap<ConnectionId, WsConnection>;

/// Maps topics to the connections subscribed to them.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<FxHashMap<TopicId, Subscribers>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `connection` to `topic`.
    ///
    /// Returns `false` if it was already subscribed or has closed.
    pub fn subscribe(&self, topic: TopicId, connection: &WsConnection) -> bool {
        let mut topics = self.topics.write();

        // A close seen under the write lock is final.
        if connection.state() == ConnectionState::Closed {
            trace!(%topic, id = %connection.id(), "Subscribe after close ignored");
            return false;
        }

        let added = topics
            .entry(topic)
            .or_default()
            .insert(connection.id(), connection.clone())
            .is_none();

        trace!(%topic, id = %connection.id(), added, "Subscribe");
        added
    }

    /// Unsubscribes `connection` from `topic`.
    ///
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, topic: TopicId, connection: &WsConnection) -> bool {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(&topic) else {
            return false;
        };

        let removed = subscribers.remove(&connection.id()).is_some();
        if subscribers.is_empty() {
            topics.remove(&topic);
        }

        trace!(%topic, id = %connection.id(), removed, "Unsubscribe");
        removed
    }

    /// Removes `id` from every topic. Returns how many topics it left.
    pub fn remove_connection(&self, id: ConnectionId) -> usize {
        let mut topics = self.topics.write();
        let mut left = 0;

        topics.retain(|_, subscribers| {
            if subscribers.remove(&id).is_some() {
                left += 1;
            }
            !subscribers.is_empty()
        });

        trace!(%id, left, "Connection removed from all topics");
        left
    }

    /// Returns handles to the subscribers of `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: TopicId) -> Vec<WsConnection> {
        self.topics
            .read()
            .get(&topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: TopicId) -> usize {
        self.topics.read().get(&topic).map_or(0, FxHashMap::len)
    }

    /// Returns the number of topics with at least one subscriber.
    #[inline]
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Returns `true` if `id` is subscribed to `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: TopicId, id: ConnectionId) -> bool {
        self.topics
            .read()
            .get(&topic)
            .is_some_and(|subscribers| subscribers.contains_key(&id))
    }
}

// ============================================================================
// Tests
// ============================================================================
