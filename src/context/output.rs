//! The two response surfaces behind one sink.
//!
//! A context is built over exactly one of them, chosen by the transport:
//!
//! | Variant | Built for | Head emission | After the body |
//! |---------|-----------|---------------|----------------|
//! | [`ResponseOutput::Server`] | plain request | framework routine | connection reused |
//! | [`ResponseOutput::Raw`] | upgrade request | manual HTTP/1.1 framing | socket closed |

// ============================================================================
// Imports
// ============================================================================

use std::io;

use async_trait::async_trait;

use crate::compression::BodySink;
use crate::transport::{HttpResponse, RawSocket, ResponseHead, ResponseSink};

// ============================================================================
// ResponseOutput
// ============================================================================

/// Response surface owned by an [`HttpContext`](crate::HttpContext).
#[derive(Debug)]
pub enum ResponseOutput {
    /// Framework response object.
    Server(HttpResponse),
    /// Pre-upgrade duplex socket.
    Raw(RawSocket),
}

impl ResponseOutput {
    /// Returns `true` for the raw socket shape.
    #[inline]
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

#[async_trait]
impl ResponseSink for ResponseOutput {
    async fn commit(&mut self, head: &ResponseHead) -> io::Result<()> {
        match self {
            Self::Server(response) => response.commit(head).await,
            Self::Raw(socket) => socket.commit(head).await,
        }
    }
}

#[async_trait]
impl BodySink for ResponseOutput {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Self::Server(response) => response.write_chunk(chunk).await,
            Self::Raw(socket) => socket.write_chunk(chunk).await,
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        match self {
            Self::Server(response) => response.finish().await,
            Self::Raw(socket) => socket.finish().await,
        }
    }
}
