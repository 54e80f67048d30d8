//! Framework response object for plain HTTP requests.
//!
//! [`ServerResponse`] owns the write side of a connection for the duration of
//! one response. Its emission routine frames the body itself:
//!
//! | Head carries | HTTP/1.1 | HTTP/1.0 |
//! |--------------|----------|----------|
//! | `content-length` | fixed length | fixed length |
//! | nothing | `transfer-encoding: chunked` | close-delimited |
//!
//! When the body is finished the writer is handed back to the connection
//! driver if the connection can be kept alive.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;

use async_trait::async_trait;
use http::Version;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::trace;

use crate::compression::BodySink;

use super::head::{ResponseHead, ResponseSink};

// ============================================================================
// Types
// ============================================================================

/// Receives the writer back once a response completes; `None` closes the
/// connection.
pub type ResponseDone<W> = oneshot::Sender<Option<W>>;

/// Body delimitation chosen at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Uncommitted,
    Empty,
    Length { remaining: u64 },
    Chunked,
    UntilClose,
}

// ============================================================================
// ServerResponse
// ============================================================================

/// Response object for one request on a keep-alive capable connection.
pub struct ServerResponse<W> {
    writer: Option<W>,
    version: Version,
    head_request: bool,
    keep_alive: bool,
    framing: Framing,
    done: Option<ResponseDone<W>>,
}

impl<W> fmt::Debug for ServerResponse<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerResponse")
            .field("version", &self.version)
            .field("head_request", &self.head_request)
            .field("keep_alive", &self.keep_alive)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Send + Unpin> ServerResponse<W> {
    /// Creates a response writer.
    ///
    /// # Arguments
    ///
    /// * `writer` - Write side of the connection
    /// * `version` - Request HTTP version
    /// * `head_request` - Suppress body bytes (`HEAD`)
    /// * `keep_alive` - Whether the client allows connection reuse
    /// * `done` - Notified when the response is complete
    pub fn new(
        writer: W,
        version: Version,
        head_request: bool,
        keep_alive: bool,
        done: ResponseDone<W>,
    ) -> Self {
        Self {
            writer: Some(writer),
            version,
            head_request,
            keep_alive,
            framing: Framing::Uncommitted,
            done: Some(done),
        }
    }

    /// Returns `true` once the head has been written.
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.framing != Framing::Uncommitted
    }

    /// Returns `true` for responses to `HEAD`.
    #[inline]
    #[must_use]
    pub fn is_head_request(&self) -> bool {
        self.head_request
    }

    fn writer(&mut self) -> io::Result<&mut W> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "response already finished"))
    }

    /// Chooses framing and adds the headers it requires.
    fn frame(&mut self, head: &ResponseHead) -> ResponseHead {
        let mut head = head.clone();

        if let Some(values) = head.headers.get("connection")
            && values.iter().any(|v| v.eq_ignore_ascii_case("close"))
        {
            self.keep_alive = false;
        }

        let declared = head
            .headers
            .get("content-length")
            .and_then(|values| values.last())
            .and_then(|v| v.trim().parse::<u64>().ok());

        self.framing = if matches!(head.status, 100..=199 | 204 | 304) {
            Framing::Empty
        } else if let Some(length) = declared {
            Framing::Length { remaining: length }
        } else if self.version == Version::HTTP_11 {
            head.headers.append("transfer-encoding", "chunked");
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::UntilClose
        };

        if !head.headers.contains("connection") {
            let token = if self.keep_alive { "keep-alive" } else { "close" };
            head.headers.append("connection", token);
        }

        head
    }
}

// ============================================================================
// Sink Implementations
// ============================================================================

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ResponseSink for ServerResponse<W> {
    async fn commit(&mut self, head: &ResponseHead) -> io::Result<()> {
        if self.is_committed() {
            return Err(io::Error::other("response head already sent"));
        }

        let head = self.frame(head);
        let bytes = head.encode();
        self.writer()?.write_all(&bytes).await?;

        trace!(status = head.status, framing = ?self.framing, "Response head written");
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> BodySink for ServerResponse<W> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.head_request || chunk.is_empty() {
            return Ok(());
        }

        match self.framing {
            Framing::Uncommitted => Err(io::Error::other("body written before head")),
            Framing::Empty => Ok(()),
            Framing::Length { remaining } => {
                let take = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                if take < chunk.len() {
                    // More bytes than declared; the connection cannot be reused.
                    self.keep_alive = false;
                }
                self.framing = Framing::Length {
                    remaining: remaining - take as u64,
                };
                self.writer()?.write_all(&chunk[..take]).await
            }
            Framing::Chunked => {
                let size_line = format!("{:x}\r\n", chunk.len());
                let writer = self.writer()?;
                writer.write_all(size_line.as_bytes()).await?;
                writer.write_all(chunk).await?;
                writer.write_all(b"\r\n").await
            }
            Framing::UntilClose => self.writer()?.write_all(chunk).await,
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        match self.framing {
            Framing::Uncommitted => return Err(io::Error::other("finish before head")),
            Framing::Chunked if !self.head_request => {
                self.writer()?.write_all(b"0\r\n\r\n").await?;
            }
            Framing::Length { remaining } if remaining > 0 && !self.head_request => {
                self.keep_alive = false;
            }
            _ => {}
        }

        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "response already finished"))?;
        writer.flush().await?;

        let handback = if self.keep_alive {
            Some(writer)
        } else {
            let _ = writer.shutdown().await;
            None
        };

        if let Some(done) = self.done.take() {
            let _ = done.send(handback);
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
