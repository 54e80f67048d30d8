//! Request heads and bodies as delivered by the transport.
//!
//! [`RequestReader`] owns the read side of a TCP connection. It parses one
//! request head at a time with `httparse`, then pumps the body into a
//! bounded channel whose receiving end travels inside the [`Request`]. The
//! channel holds a single chunk, so the socket is only read again once the
//! consumer has taken the previous chunk.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING, UPGRADE};
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};

use super::socket::CloseSignal;

// ============================================================================
// Constants
// ============================================================================

/// Socket read size.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Longest accepted chunk-size line in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

/// Most body bytes read ahead while the handler is busy.
const BODY_LOOKAHEAD: usize = 64 * 1024;

// ============================================================================
// Limits
// ============================================================================

/// Bounds applied while parsing request heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted head, request line included.
    pub max_head_size: usize,
    /// Largest accepted header count.
    pub max_headers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_size: 16 * 1024,
            max_headers: 100,
        }
    }
}

// ============================================================================
// HeadError
// ============================================================================

/// Why a request head was rejected.
#[derive(Debug)]
pub enum HeadError {
    /// Head could not be parsed; answer 400.
    Malformed(Error),
    /// Head exceeded a limit; answer 431.
    TooLarge,
    /// Socket failed.
    Io(io::Error),
}

impl HeadError {
    /// Status line written back before the socket closes, if any.
    #[must_use]
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::Malformed(_) => Some((400, "Bad Request")),
            Self::TooLarge => Some((431, "Request Header Fields Too Large")),
            Self::Io(_) => None,
        }
    }
}

// ============================================================================
// RequestHead
// ============================================================================

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Option<Method>,
    /// Request target as sent.
    pub path: Option<String>,
    /// HTTP version.
    pub version: Version,
    /// Headers, names lowercased.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Returns `true` if the request asks for a WebSocket upgrade.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Returns `true` if the connection may carry another request afterwards.
    #[must_use]
    pub fn wants_keep_alive(&self) -> bool {
        let token = |needle: &str| {
            self.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(needle)))
                    .unwrap_or(false)
            })
        };

        match self.version {
            Version::HTTP_11 => !token("close"),
            _ => token("keep-alive"),
        }
    }

    /// Works out how the body is delimited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRequest`] for an unreadable `content-length`
    /// or a transfer coding other than `chunked`.
    pub fn body_framing(&self) -> Result<BodyFraming> {
        if let Some(te) = self.headers.get(TRANSFER_ENCODING) {
            let te = te
                .to_str()
                .map_err(|_| Error::malformed_request("unreadable transfer-encoding"))?;
            let last = te.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(Error::malformed_request(format!(
                    "unsupported transfer-encoding: {te}"
                )));
            }
            return Ok(BodyFraming::Chunked);
        }

        match self.headers.get(CONTENT_LENGTH) {
            None => Ok(BodyFraming::Empty),
            Some(value) => {
                let length = value
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| Error::malformed_request("invalid content-length"))?;
                Ok(if length == 0 {
                    BodyFraming::Empty
                } else {
                    BodyFraming::Length(length)
                })
            }
        }
    }

    /// Attaches peer address and body, producing a [`Request`].
    #[must_use]
    pub fn into_request(self, remote_addr: Option<SocketAddr>, body: BodyReceiver) -> Request {
        Request {
            method: self.method,
            path: self.path,
            version: self.version,
            headers: self.headers,
            remote_addr,
            body,
        }
    }
}

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// `transfer-encoding: chunked`.
    Chunked,
}

// ============================================================================
// Request
// ============================================================================

/// A request handed to the runtime by the transport.
#[derive(Debug)]
pub struct Request {
    method: Option<Method>,
    path: Option<String>,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    body: BodyReceiver,
}

impl Request {
    /// Request method, if the transport reported one.
    #[inline]
    #[must_use]
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Request target, if the transport reported one.
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// HTTP version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Peer address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Mutable access to the body channel.
    #[inline]
    pub fn body_mut(&mut self) -> &mut BodyReceiver {
        &mut self.body
    }
}

// ============================================================================
// BodyReceiver
// ============================================================================

/// Receiving end of a request body.
///
/// Yields chunks in arrival order; `None` once the body is complete or the
/// connection failed mid-body.
#[derive(Debug)]
pub struct BodyReceiver {
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl BodyReceiver {
    /// Creates a connected body channel holding at most one chunk in flight.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Self { rx: Some(rx) })
    }

    /// A body that is already complete.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self { rx: None }
    }

    /// Returns `false` once no more chunks can arrive.
    #[inline]
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.rx.is_some()
    }

    /// Waits for the next chunk.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let rx = self.rx.as_mut()?;
        let chunk = rx.recv().await;
        if chunk.is_none() {
            self.rx = None;
        }
        chunk
    }
}

// ============================================================================
// RequestReader
// ============================================================================

/// Buffered read side of one HTTP/1.x connection.
pub struct RequestReader<R> {
    inner: R,
    buf: BytesMut,
    limits: Limits,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R, limits: Limits) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            limits,
        }
    }

    /// Returns the reader and any bytes buffered past the last parsed item.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.inner, self.buf.freeze())
    }

    /// Reads more bytes into the buffer. Returns `0` at EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK_SIZE);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Reads the next request head.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly between requests.
    pub async fn read_head(&mut self) -> std::result::Result<Option<RequestHead>, HeadError> {
        loop {
            if !self.buf.is_empty() {
                match parse_head(&self.buf, self.limits)? {
                    Some((head, consumed)) => {
                        self.buf.advance(consumed);
                        trace!(consumed, method = ?head.method, "Request head parsed");
                        return Ok(Some(head));
                    }
                    None if self.buf.len() >= self.limits.max_head_size => {
                        return Err(HeadError::TooLarge);
                    }
                    None => {}
                }
            }

            if self.fill().await.map_err(HeadError::Io)? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(HeadError::Io(io::ErrorKind::UnexpectedEof.into()))
                };
            }
        }
    }

    /// Reads the body and forwards it chunk by chunk.
    ///
    /// Each send waits for room in the channel. While it waits the socket is
    /// still read, so a peer that goes away fires `closed`. If the receiver is
    /// gone the rest of the body is read and discarded so the connection
    /// stays usable.
    ///
    /// # Errors
    ///
    /// Socket errors, early EOF and malformed chunk framing.
    pub async fn pump_body(
        &mut self,
        framing: BodyFraming,
        tx: mpsc::Sender<Bytes>,
        closed: &CloseSignal,
    ) -> io::Result<()> {
        let mut tx = Some(tx);

        match framing {
            BodyFraming::Empty => Ok(()),
            BodyFraming::Length(length) => {
                let mut remaining = length;
                while remaining > 0 {
                    let chunk = self.take_up_to(remaining).await?;
                    remaining -= chunk.len() as u64;
                    self.forward(&mut tx, chunk, closed).await;
                }
                Ok(())
            }
            BodyFraming::Chunked => loop {
                let line = self.read_line().await?;
                let size_field = line.split(|b| *b == b';').next().unwrap_or_default();
                let size = std::str::from_utf8(size_field)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;

                if size == 0 {
                    // Trailers end with an empty line.
                    while !self.read_line().await?.is_empty() {}
                    return Ok(());
                }

                let mut remaining = size;
                while remaining > 0 {
                    let chunk = self.take_up_to(remaining).await?;
                    remaining -= chunk.len() as u64;
                    self.forward(&mut tx, chunk, closed).await;
                }

                if !self.read_line().await?.is_empty() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "missing chunk terminator"));
                }
            },
        }
    }

    /// Waits until the peer sends more data or goes away.
    ///
    /// Returns `true` if the peer closed. Bytes that arrive are kept for the
    /// next request.
    pub async fn peer_closed(&mut self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        !matches!(self.fill().await, Ok(n) if n > 0)
    }

    /// Takes buffered bytes, reading once if the buffer is empty.
    async fn take_up_to(&mut self, max: u64) -> io::Result<Bytes> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let n = self.buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
        Ok(self.buf.split_to(n).freeze())
    }

    /// Reads one CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Sends `chunk` unless the receiver is already gone.
    ///
    /// Keeps reading ahead while the channel is full, up to
    /// [`BODY_LOOKAHEAD`] buffered bytes, and fires `closed` on EOF or a
    /// socket error. The chunk is still delivered afterwards.
    async fn forward(&mut self, tx: &mut Option<mpsc::Sender<Bytes>>, chunk: Bytes, closed: &CloseSignal) {
        let Some(sender) = tx.clone() else {
            return;
        };
        let mut watching = true;

        loop {
            let read_ahead = watching && self.buf.len() < BODY_LOOKAHEAD;

            tokio::select! {
                biased;

                permit = sender.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(chunk),
                        Err(_) => *tx = None,
                    }
                    return;
                }

                read = self.fill(), if read_ahead => {
                    if !matches!(read, Ok(n) if n > 0) {
                        trace!("Peer went away while the body was waiting");
                        closed.fire();
                        watching = false;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a head from the front of `buf`.
///
/// Returns the head and the number of bytes it occupied, or `None` if more
/// bytes are needed.
fn parse_head(buf: &[u8], limits: Limits) -> std::result::Result<Option<(RequestHead, usize)>, HeadError> {
    let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut parsed = httparse::Request::new(&mut slots);

    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge),
        Err(e) => return Err(HeadError::Malformed(Error::malformed_request(e.to_string()))),
    };

    if consumed > limits.max_head_size {
        return Err(HeadError::TooLarge);
    }

    let method = parsed
        .method
        .map(|m| Method::from_bytes(m.as_bytes()))
        .transpose()
        .map_err(|e| HeadError::Malformed(Error::malformed_request(e.to_string())))?;

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| HeadError::Malformed(Error::malformed_request(e.to_string())))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| HeadError::Malformed(Error::malformed_request(e.to_string())))?;
        headers.append(name, value);
    }

    let head = RequestHead {
        method,
        path: parsed.path.map(str::to_owned),
        version,
        headers,
    };

    Ok(Some((head, consumed)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::io::Builder;

    fn reader(parts: &[&[u8]]) -> RequestReader<tokio_test::io::Mock> {
        let mut builder = Builder::new();
        for part in parts {
            builder.read(part);
        }
        RequestReader::new(builder.build(), Limits::default())
    }

    #[tokio::test]
    async fn test_read_head_across_reads() {
        let mut reader = reader(&[b"GET /chat?x=1 HTTP/1.1\r\nHo", b"st: a\r\nX-Custom: 1\r\n\r\n"]);
        let head = reader.read_head().await.unwrap().unwrap();

        assert_eq!(head.method, Some(Method::GET));
        assert_eq!(head.path.as_deref(), Some("/chat?x=1"));
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("x-custom").unwrap(), "1");
        assert!(head.wants_keep_alive());
        assert!(!head.is_upgrade());
    }

    #[tokio::test]
    async fn test_clean_eof_between_requests() {
        let mut reader = reader(&[]);
        assert!(reader.read_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_head() {
        let mut reader = reader(&[b"NOT A REQUEST\r\n\r\n"]);
        let err = reader.read_head().await.unwrap_err();
        assert_eq!(err.status(), Some((400, "Bad Request")));
    }

    #[tokio::test]
    async fn test_too_many_headers() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..5 {
            raw.push_str(&format!("x-h{i}: v\r\n"));
        }
        raw.push_str("\r\n");

        let mock = Builder::new().read(raw.as_bytes()).build();
        let limits = Limits {
            max_head_size: 16 * 1024,
            max_headers: 3,
        };
        let mut reader = RequestReader::new(mock, limits);
        let err = reader.read_head().await.unwrap_err();
        assert_eq!(err.status(), Some((431, "Request Header Fields Too Large")));
    }

    #[tokio::test]
    async fn test_upgrade_detection_and_leftover() {
        let mut reader = reader(&[
            b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n\x81\x00",
        ]);
        let head = reader.read_head().await.unwrap().unwrap();
        assert!(head.is_upgrade());

        let (_, leftover) = reader.into_parts();
        assert_eq!(leftover.as_ref(), b"\x81\x00");
    }

    #[tokio::test]
    async fn test_http10_keep_alive_rules() {
        let mut reader = reader(&[b"GET / HTTP/1.0\r\n\r\n"]);
        let head = reader.read_head().await.unwrap().unwrap();
        assert_eq!(head.version, Version::HTTP_10);
        assert!(!head.wants_keep_alive());
    }

    #[tokio::test]
    async fn test_content_length_body_is_pumped_in_order() {
        let mut reader = reader(&[b"POST / HTTP/1.1\r\ncontent-length: 11\r\n\r\nhello", b" world"]);
        let head = reader.read_head().await.unwrap().unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Length(11));

        let (tx, mut body) = BodyReceiver::channel();
        let pump = async { reader.pump_body(BodyFraming::Length(11), tx, &CloseSignal::new()).await };
        let collect = async {
            let mut chunks = Vec::new();
            while let Some(chunk) = body.next_chunk().await {
                chunks.push(chunk);
            }
            chunks
        };

        let (pumped, chunks) = tokio::join!(pump, collect);
        pumped.unwrap();
        assert_eq!(chunks, vec![Bytes::from("hello"), Bytes::from(" world")]);
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let mut reader = reader(&[
            b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n",
            b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nx-trailer: 1\r\n\r\n",
        ]);
        let head = reader.read_head().await.unwrap().unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Chunked);

        let (tx, mut body) = BodyReceiver::channel();
        let pump = async { reader.pump_body(BodyFraming::Chunked, tx, &CloseSignal::new()).await };
        let collect = async {
            let mut all = Vec::new();
            while let Some(chunk) = body.next_chunk().await {
                all.extend_from_slice(&chunk);
            }
            all
        };

        let (pumped, all) = tokio::join!(pump, collect);
        pumped.unwrap();
        assert_eq!(all, b"hello world");
    }

    #[tokio::test]
    async fn test_peer_close_seen_while_body_waits() {
        let mut reader = reader(&[b"first", b"second"]);
        let closed = CloseSignal::new();
        let (tx, mut body) = BodyReceiver::channel();

        let pump = async { reader.pump_body(BodyFraming::Length(11), tx, &closed).await };
        let consume = async {
            closed.token().cancelled().await;
            let mut chunks = Vec::new();
            while let Some(chunk) = body.next_chunk().await {
                chunks.push(chunk);
            }
            chunks
        };

        let (pumped, chunks) = tokio::join!(pump, consume);
        pumped.unwrap();
        assert!(closed.is_fired());
        assert_eq!(chunks, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn test_body_drained_when_receiver_dropped() {
        let mut reader = reader(&[b"abcdef", b"GET /next HTTP/1.1\r\n\r\n"]);
        let (tx, body) = BodyReceiver::channel();
        drop(body);

        reader.pump_body(BodyFraming::Length(6), tx, &CloseSignal::new()).await.unwrap();
        let next = reader.read_head().await.unwrap().unwrap();
        assert_eq!(next.path.as_deref(), Some("/next"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let mut reader = reader(&[b"abc"]);
        let (tx, _body) = BodyReceiver::channel();
        let err = reader.pump_body(BodyFraming::Length(10), tx, &CloseSignal::new()).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_framing() {
        let mut head = RequestHead {
            method: Some(Method::POST),
            path: Some("/".into()),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Empty);

        head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("abc"));
        assert!(head.body_framing().is_err());

        head.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        assert!(head.body_framing().is_err());
    }

    #[tokio::test]
    async fn test_empty_body_receiver() {
        let mut body = BodyReceiver::empty();
        assert!(!body.is_readable());
        assert!(body.next_chunk().await.is_none());
    }
}
