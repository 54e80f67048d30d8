//! Compression engine for response bodies.
//!
//! Two entry points cover the two payload shapes a context can write:
//!
//! - [`compress_buffer`] compresses a complete in-memory payload before any
//!   header is emitted, so the final length is known.
//! - [`compress_stream`] pipes a byte stream through the codec into a
//!   [`BodySink`], one chunk at a time. The next chunk is only read once the
//!   previous one has been accepted by the sink.
//!
//! Stream failures never escape [`compress_stream`]: by the time streaming
//! starts the response head is already on the wire, so the only honest
//! outcome is a truncated body. They are logged at `debug` level.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::{self, Write};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Read size for streamed payloads.
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Brotli internal buffer size.
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Brotli quality (library default).
const BROTLI_QUALITY: u32 = 11;

/// Brotli window size (library default).
const BROTLI_LG_WINDOW: u32 = 22;

// ============================================================================
// CompressionMethod
// ============================================================================

/// Content coding applied to a response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Passthrough.
    #[default]
    None,
    /// gzip (RFC 1952).
    Gzip,
    /// Brotli (RFC 7932).
    Brotli,
    /// zlib-wrapped deflate (RFC 1950), which is what HTTP `deflate` names.
    Deflate,
}

impl CompressionMethod {
    /// Returns the `content-encoding` token, or `None` for passthrough.
    #[inline]
    #[must_use]
    pub const fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Brotli => Some("br"),
            Self::Deflate => Some("deflate"),
        }
    }

    /// Returns `true` unless this is [`CompressionMethod::None`].
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Picks a method from an `accept-encoding` header value.
    ///
    /// Preference is `br`, then `gzip`, then `deflate`. Codings listed with
    /// `q=0` are refused; `*` accepts every coding.
    #[must_use]
    pub fn negotiate(accept_encoding: &str) -> Self {
        let mut wildcard = false;
        let mut accepted = [false; 3];

        for entry in accept_encoding.split(',') {
            let mut parts = entry.split(';');
            let coding = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

            let refused = parts.any(|param| {
                let param = param.trim();
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if refused {
                continue;
            }

            match coding.as_str() {
                "br" => accepted[0] = true,
                "gzip" | "x-gzip" => accepted[1] = true,
                "deflate" => accepted[2] = true,
                "*" => wildcard = true,
                _ => {}
            }
        }

        if accepted[0] || wildcard {
            Self::Brotli
        } else if accepted[1] {
            Self::Gzip
        } else if accepted[2] {
            Self::Deflate
        } else {
            Self::None
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Brotli => "brotli",
            Self::Deflate => "deflate",
        })
    }
}

// ============================================================================
// BodySink
// ============================================================================

/// Destination of a streamed body.
///
/// Implemented by both response transports and by `Vec<u8>`.
#[async_trait]
pub trait BodySink: Send {
    /// Writes one chunk. Resolves once the chunk has been accepted.
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Ends the body.
    async fn finish(&mut self) -> io::Result<()>;
}

#[async_trait]
impl BodySink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Buffer Compression
// ============================================================================

/// Compresses a complete payload.
///
/// [`CompressionMethod::None`] returns a fresh copy of `data`. Codec work runs
/// on the blocking pool.
///
/// # Errors
///
/// Returns [`Error::Compression`] carrying the codec error.
pub async fn compress_buffer(method: CompressionMethod, data: Bytes) -> Result<Bytes> {
    if !method.is_enabled() {
        return Ok(Bytes::copy_from_slice(&data));
    }

    let input_len = data.len();
    let compressed = tokio::task::spawn_blocking(move || encode_all(method, &data))
        .await
        .map_err(|e| Error::compression(method, io::Error::other(e)))?
        .map_err(|e| Error::compression(method, e))?;

    trace!(%method, input_len, output_len = compressed.len(), "Buffer compressed");

    Ok(Bytes::from(compressed))
}

/// Runs the codec over a whole buffer.
fn encode_all(method: CompressionMethod, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = StreamEncoder::new(method);
    let mut out = encoder.encode(data)?;
    out.extend(encoder.finish()?);
    Ok(out)
}

// ============================================================================
// Stream Compression
// ============================================================================

/// Pipes `source` through the codec into `destination`, then finishes it.
///
/// Errors from the source, the codec or the destination end the pipe early;
/// they are logged and swallowed.
pub async fn compress_stream<R, S>(method: CompressionMethod, source: R, destination: &mut S)
where
    R: AsyncRead + Unpin + Send,
    S: BodySink + ?Sized,
{
    if let Err(e) = pipe(method, source, destination).await {
        debug!(%method, error = %e, "Body stream aborted");
    }
}

/// Fallible body of [`compress_stream`].
async fn pipe<R, S>(method: CompressionMethod, mut source: R, destination: &mut S) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    S: BodySink + ?Sized,
{
    let mut encoder = StreamEncoder::new(method);
    let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);

    loop {
        buf.clear();
        if source.read_buf(&mut buf).await? == 0 {
            break;
        }

        match &mut encoder {
            StreamEncoder::Passthrough => destination.write_chunk(&buf).await?,
            encoder => {
                let out = encoder.encode(&buf)?;
                if !out.is_empty() {
                    destination.write_chunk(&out).await?;
                }
            }
        }
    }

    let tail = encoder.finish()?;
    if !tail.is_empty() {
        destination.write_chunk(&tail).await?;
    }

    destination.finish().await
}

// ============================================================================
// StreamEncoder
// ============================================================================

/// Incremental encoder that hands back whatever output each input produced.
enum StreamEncoder {
    Passthrough,
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Brotli(Box<brotli::CompressorWriter<Vec<u8>>>),
}

impl StreamEncoder {
    fn new(method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => Self::Passthrough,
            CompressionMethod::Gzip => Self::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            CompressionMethod::Deflate => {
                Self::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
            CompressionMethod::Brotli => Self::Brotli(Box::new(brotli::CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            ))),
        }
    }

    /// Feeds `input` and drains the output produced so far.
    fn encode(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Passthrough => Ok(input.to_vec()),
            Self::Gzip(e) => {
                e.write_all(input)?;
                Ok(std::mem::take(e.get_mut()))
            }
            Self::Deflate(e) => {
                e.write_all(input)?;
                Ok(std::mem::take(e.get_mut()))
            }
            Self::Brotli(e) => {
                e.write_all(input)?;
                Ok(std::mem::take(e.get_mut()))
            }
        }
    }

    /// Flushes the trailer.
    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Passthrough => Ok(Vec::new()),
            Self::Gzip(e) => e.finish(),
            Self::Deflate(e) => e.finish(),
            Self::Brotli(e) => Ok(e.into_inner()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
