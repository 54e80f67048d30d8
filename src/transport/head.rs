//! Response head model shared by both response transports.
//!
//! [`HeaderList`] keeps header names in first-insertion order with every
//! value ever appended, so repeated headers such as `set-cookie` survive.
//! [`ResponseHead::encode`] produces the exact HTTP/1.1 framing:
//!
//! ```text
//! HTTP/1.1 <code> <message>\r\n
//! <name>: <value>\r\n        (once per value)
//! \r\n
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::io;

use async_trait::async_trait;

use crate::compression::BodySink;

// ============================================================================
// HeaderList
// ============================================================================

/// Ordered multi-value header map.
///
/// Names compare case-insensitively; the spelling of the first insertion is
/// kept for emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderList {
    /// Creates an empty list.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` to the values of `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.position(&name) {
            Some(index) => self.entries[index].1.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replaces every value of `name` with `value`, keeping its position.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.position(&name) {
            Some(index) => self.entries[index].1 = vec![value],
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Removes `name`, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|index| self.entries.remove(index).1)
    }

    /// Moves `name` behind every other header. No-op when absent.
    pub fn move_to_end(&mut self, name: &str) {
        if let Some(index) = self.position(name) {
            let entry = self.entries.remove(index);
            self.entries.push(entry);
        }
    }

    /// Returns the values of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|index| self.entries[index].1.as_slice())
    }

    /// Returns `true` if `name` has at least one value.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns `true` if no header is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, value)` pairs in emission order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// ResponseHead
// ============================================================================

/// Status line plus headers of a response about to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub message: String,
    /// Headers in emission order.
    pub headers: HeaderList,
}

impl ResponseHead {
    /// Creates a head with no headers.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: HeaderList::new(),
        }
    }

    /// Serializes the head, including the terminating blank line.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.message).as_bytes());

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

// ============================================================================
// ResponseSink
// ============================================================================

/// A response transport: commit the head once, then stream the body.
#[async_trait]
pub trait ResponseSink: BodySink {
    /// Emits the status line and headers.
    async fn commit(&mut self, head: &ResponseHead) -> io::Result<()>;
}

// ============================================================================
// Tests
// ============================================================================
