//! Per-request context.
//!
//! An [`HttpContext`] gives a handler one normalized view of a request,
//! whichever response surface the transport produced for it:
//!
//! - `"http"` contexts wrap the framework [`ServerResponse`](crate::transport::ServerResponse).
//! - `"ws"` contexts wrap the raw socket of an upgrade request. They can
//!   [`upgrade`](HttpContext::upgrade), or answer with a plain response.
//!
//! # Response Commit
//!
//! Status and headers stay pending until [`write`](HttpContext::write) or
//! [`write_file`](HttpContext::write_file) commits them. Before emission:
//!
//! 1. `content-encoding` is set when compression is in effect
//! 2. a buffer body gets `content-length` (unless the request is `HEAD`);
//!    a compressed stream loses any caller-set `content-length`
//! 3. `content-length` is moved behind every other pending header
//!
//! After the head is out, the cancellation signal no longer fires.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::io::SeekFrom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, HeaderMap, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compression::{BodySink, CompressionMethod, compress_buffer, compress_stream};
use crate::error::{Error, Result};
use crate::identifiers::UpgradeId;
use crate::transport::{
    CloseSignal, ConnectionEvents, HeaderList, MessageKind, RawSocket, Request, ResponseHead,
    ResponseSink, WsConnection,
};

use super::Dispatch;
use super::output::ResponseOutput;
use super::ws::{UserData, WsContext, WsEventKind};

// ============================================================================
// Constants
// ============================================================================

/// WebSocket protocol version accepted by the handshake.
const WEBSOCKET_VERSION: &str = "13";

// ============================================================================
// Types
// ============================================================================

/// Which transport shape a context was built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Plain request with a framework response object.
    Http,
    /// Upgrade request with a raw socket.
    Ws,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Ws => "ws",
        })
    }
}

/// One piece of a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    /// Chunk bytes; empty for the terminal chunk.
    pub data: Bytes,
    /// `true` exactly once, after the last data chunk.
    pub is_last: bool,
}

/// Response body handed to [`HttpContext::write`].
pub enum Payload {
    /// Complete in-memory body.
    Buffer(Bytes),
    /// Body produced by a reader.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Payload {
    /// Wraps a reader.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Stream(Box::new(reader))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(bytes) => f.debug_tuple("Buffer").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Buffer(Bytes::from(text))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Self::Buffer(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Buffer(Bytes::from_static(bytes))
    }
}

/// Body after the compression decision.
enum Body {
    Ready(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

// ============================================================================
// HttpContext
// ============================================================================

/// Request/response context handed to the `http` handler.
pub struct HttpContext {
    kind: ConnectionKind,
    request: Request,
    output: Option<ResponseOutput>,
    close: CloseSignal,
    head: Option<Bytes>,
    status: u16,
    status_message: String,
    headers: HeaderList,
    compression: CompressionMethod,
    body_done: bool,
    dispatch: Arc<Dispatch>,
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("kind", &self.connection_kind())
            .field("method", &self.request.method())
            .field("path", &self.request.path())
            .field("status", &self.status)
            .field("committed", &self.is_committed())
            .finish_non_exhaustive()
    }
}

impl HttpContext {
    /// Builds a context. `head` is `Some` only for upgrade requests.
    pub(crate) fn new(
        request: Request,
        output: ResponseOutput,
        close: CloseSignal,
        head: Option<Bytes>,
        dispatch: Arc<Dispatch>,
    ) -> Self {
        let compression = if dispatch.compression() {
            request
                .headers()
                .get(ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(CompressionMethod::negotiate)
                .unwrap_or_default()
        } else {
            CompressionMethod::None
        };

        let kind = if head.is_some() {
            ConnectionKind::Ws
        } else {
            ConnectionKind::Http
        };

        Self {
            kind,
            request,
            output: Some(output),
            close,
            head,
            status: 200,
            status_message: "OK".to_string(),
            headers: HeaderList::new(),
            compression,
            body_done: false,
            dispatch,
        }
    }
}

// ============================================================================
// HttpContext - Request
// ============================================================================

impl HttpContext {
    /// Returns a token cancelled when the peer goes away before the
    /// response is committed.
    #[must_use]
    pub fn cancellation_signal(&self) -> CancellationToken {
        self.close.token()
    }

    /// Returns `Ws` for contexts built from an upgrade request.
    #[inline]
    #[must_use]
    pub fn connection_kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Request method; `GET` when the transport did not report one.
    #[must_use]
    pub fn method(&self) -> Method {
        self.request.method().cloned().unwrap_or(Method::GET)
    }

    /// Request target; `/` when the transport did not report one.
    #[must_use]
    pub fn path(&self) -> &str {
        self.request.path().unwrap_or("/")
    }

    /// Peer IP; `127.0.0.1` when unknown.
    #[must_use]
    pub fn client_address(&self) -> IpAddr {
        self.request
            .remote_addr()
            .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
    }

    /// Peer port; `0` when unknown.
    #[must_use]
    pub fn client_port(&self) -> u16 {
        self.request.remote_addr().map_or(0, |addr| addr.port())
    }

    /// Request headers as delivered.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Pulls the next body chunk.
    ///
    /// Yields data chunks in arrival order, then one empty chunk with
    /// `is_last` set, then `None`. The transport reads no further than one
    /// chunk ahead of the caller.
    pub async fn next_body_chunk(&mut self) -> Option<BodyChunk> {
        if self.body_done {
            return None;
        }

        match self.request.body_mut().next_chunk().await {
            Some(data) => Some(BodyChunk {
                data,
                is_last: false,
            }),
            None => {
                self.body_done = true;
                Some(BodyChunk {
                    data: Bytes::new(),
                    is_last: true,
                })
            }
        }
    }

    /// Feeds every body chunk to `on_chunk`, waiting for each call to
    /// resolve before the next chunk is pulled.
    ///
    /// `on_chunk` is called with an empty chunk and `true` exactly once at
    /// the end, even when the request has no body.
    pub async fn read_body<F, Fut>(&mut self, mut on_chunk: F)
    where
        F: FnMut(Bytes, bool) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        while let Some(chunk) = self.next_body_chunk().await {
            on_chunk(chunk.data, chunk.is_last).await;
        }
    }
}

// ============================================================================
// HttpContext - Response State
// ============================================================================

impl HttpContext {
    /// Sets the status line. No effect once committed.
    pub fn set_status(&mut self, code: u16, message: impl Into<String>) -> &mut Self {
        if !self.is_committed() {
            self.status = code;
            self.status_message = message.into();
        }
        self
    }

    /// Appends a response header value. No effect once committed.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if !self.is_committed() {
            self.headers.append(key, value);
        }
        self
    }

    /// Returns the pending status code.
    #[inline]
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the pending response headers.
    #[inline]
    #[must_use]
    pub fn response_headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Returns the compression method in effect.
    #[inline]
    #[must_use]
    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    /// Overrides the compression method. No effect once committed.
    pub fn set_compression(&mut self, method: CompressionMethod) -> &mut Self {
        if !self.is_committed() {
            self.compression = method;
        }
        self
    }

    /// Returns `true` once a response was written or the connection upgraded.
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.output.is_none()
    }
}

// ============================================================================
// HttpContext - Writing
// ============================================================================

impl HttpContext {
    /// Commits the response and writes `payload` as its body.
    ///
    /// A buffer is compressed completely before the head is sent; a stream
    /// is compressed on the fly.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyCommitted`] if a response was already written
    /// - [`Error::Compression`] if buffer compression fails (nothing is sent)
    /// - [`Error::Io`] if writing the head or a buffer body fails
    pub async fn write(&mut self, payload: impl Into<Payload>) -> Result<()> {
        if self.is_committed() {
            return Err(Error::AlreadyCommitted);
        }

        let body = match payload.into() {
            Payload::Buffer(data) => Body::Ready(compress_buffer(self.compression, data).await?),
            Payload::Stream(reader) => Body::Stream(reader),
        };

        self.send(body).await
    }

    /// Commits the response and streams a file as its body.
    ///
    /// `start` and `end` select an inclusive byte range; either may be
    /// omitted.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyCommitted`] if a response was already written
    /// - [`Error::Io`] if the file cannot be opened (nothing is sent)
    pub async fn write_file(
        &mut self,
        path: impl AsRef<Path>,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<()> {
        if self.is_committed() {
            return Err(Error::AlreadyCommitted);
        }

        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        let offset = start.unwrap_or(0);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let reader: Box<dyn AsyncRead + Send + Unpin> = match end {
            Some(end) => Box::new(file.take(end.saturating_add(1).saturating_sub(offset))),
            None => Box::new(file),
        };

        self.send(Body::Stream(reader)).await
    }

    /// Fixes up headers, commits the head, then writes the body.
    async fn send(&mut self, body: Body) -> Result<()> {
        let mut output = self.output.take().ok_or(Error::AlreadyCommitted)?;
        let head_request = self.method() == Method::HEAD;
        let method = self.compression;

        if let Some(token) = method.content_encoding() {
            self.headers.set("content-encoding", token);
        }
        match &body {
            Body::Ready(bytes) if !head_request => {
                self.headers.set("content-length", bytes.len().to_string());
            }
            Body::Stream(_) if method.is_enabled() => {
                self.headers.remove("content-length");
            }
            _ => {}
        }
        self.headers.move_to_end("content-length");

        let head = ResponseHead {
            status: self.status,
            message: self.status_message.clone(),
            headers: self.headers.clone(),
        };

        output.commit(&head).await?;
        self.close.disarm();

        debug!(
            status = self.status,
            kind = %self.kind,
            compression = %method,
            "Response committed"
        );

        match body {
            Body::Ready(bytes) => {
                if !head_request {
                    output.write_chunk(&bytes).await?;
                }
                output.finish().await?;
            }
            Body::Stream(_) if head_request => output.finish().await?,
            Body::Stream(reader) => compress_stream(method, reader, &mut output).await,
        }

        Ok(())
    }
}

// ============================================================================
// HttpContext - Upgrade
// ============================================================================

impl HttpContext {
    /// Promotes the connection to a WebSocket.
    ///
    /// Returns `false` without side effects when the context was not built
    /// from an upgrade request, a response was already committed, or the
    /// request carries no `sec-websocket-key`. Otherwise the handshake runs
    /// in the background with the pending headers attached to the `101`
    /// response, and `data` is handed to every event of the connection.
    ///
    /// The `open` handler completes before any `message` or `close` handler
    /// runs.
    pub fn upgrade<T: Any + Send + Sync>(&mut self, data: T) -> bool {
        self.upgrade_with(Arc::new(data))
    }

    /// Like [`upgrade`](Self::upgrade), with an already shared value.
    pub fn upgrade_with(&mut self, data: UserData) -> bool {
        if self.kind != ConnectionKind::Ws || !self.output.as_ref().is_some_and(ResponseOutput::is_raw) {
            return false;
        }

        let Some(key) = self
            .request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .map(|v| v.as_bytes().to_vec())
        else {
            return false;
        };

        let Some(ResponseOutput::Raw(socket)) = self.output.take() else {
            return false;
        };

        let version_ok = self
            .request
            .headers()
            .get(SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v.as_bytes() == WEBSOCKET_VERSION.as_bytes());

        self.close.disarm();

        let handshake = Handshake {
            id: UpgradeId::generate(),
            key,
            version_ok,
            headers: std::mem::take(&mut self.headers),
            socket,
            head: self.head.take().unwrap_or_default(),
            remote_addr: self.request.remote_addr(),
            user_data: data,
            dispatch: Arc::clone(&self.dispatch),
        };

        debug!(upgrade = %handshake.id, path = self.path(), "Upgrade accepted");
        tokio::spawn(handshake.run());
        true
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// An upgrade in flight, carrying its own pending headers.
struct Handshake {
    id: UpgradeId,
    key: Vec<u8>,
    version_ok: bool,
    headers: HeaderList,
    socket: RawSocket,
    head: Bytes,
    remote_addr: Option<SocketAddr>,
    user_data: UserData,
    dispatch: Arc<Dispatch>,
}

impl Handshake {
    async fn run(self) {
        let id = self.id;
        let (mut stream, early) = match self.socket.into_stream().await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(upgrade = %id, error = %e, "Upgrade socket unavailable");
                return;
            }
        };

        if !self.version_ok {
            debug!(upgrade = %id, "Unsupported WebSocket version");
            reject_version(&mut stream).await;
            return;
        }

        let mut response = ResponseHead::new(101, "Switching Protocols");
        response.headers.append("upgrade", "websocket");
        response.headers.append("connection", "Upgrade");
        response
            .headers
            .append("sec-websocket-accept", derive_accept_key(&self.key));
        for (name, value) in self.headers.iter() {
            response.headers.append(name, value);
        }

        if let Err(e) = stream.write_all(&response.encode()).await {
            debug!(upgrade = %id, error = %e, "Handshake response failed");
            return;
        }

        let mut leftover = self.head.to_vec();
        leftover.extend_from_slice(&early);
        let ws = WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;
        let (connection, reader) = WsConnection::new(ws, self.remote_addr);
        self.dispatch.clients().insert(connection.clone());

        info!(upgrade = %id, id = %connection.id(), "WebSocket upgrade completed");

        let bridge = Bridge {
            dispatch: self.dispatch,
            user_data: self.user_data,
        };

        bridge.open(&connection).await;
        reader.run(&bridge).await;
    }
}

/// Answers a handshake with an unsupported version.
async fn reject_version(stream: &mut TcpStream) {
    let mut head = ResponseHead::new(400, "Bad Request");
    head.headers.append("sec-websocket-version", WEBSOCKET_VERSION);
    head.headers.append("connection", "close");
    head.headers.append("content-length", "0");

    if stream.write_all(&head.encode()).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Turns connection events into message contexts for the `Serve` handlers.
struct Bridge {
    dispatch: Arc<Dispatch>,
    user_data: UserData,
}

impl Bridge {
    fn context(&self, kind: WsEventKind, connection: &WsConnection) -> WsContext {
        WsContext::lifecycle(
            kind,
            connection.clone(),
            Arc::clone(&self.user_data),
            self.dispatch.registry(),
        )
    }

    async fn open(&self, connection: &WsConnection) {
        let handler = self.dispatch.serve().ws_open;
        handler(self.context(WsEventKind::Open, connection)).await;
    }
}

#[async_trait]
impl ConnectionEvents for Bridge {
    async fn on_message(&self, connection: &WsConnection, payload: Bytes, kind: MessageKind) {
        let ctx = WsContext::new(
            WsEventKind::Message,
            connection.clone(),
            payload,
            kind,
            Arc::clone(&self.user_data),
            self.dispatch.registry(),
        );

        let handler = self.dispatch.serve().ws_message;
        handler(ctx).await;
    }

    async fn on_close(&self, connection: &WsConnection) {
        let ctx = self.context(WsEventKind::Close, connection);

        self.dispatch.registry().remove_connection(connection.id());
        self.dispatch.clients().remove(connection.id());

        let handler = self.dispatch.serve().ws_close;
        handler(ctx).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use http::header::{HeaderName, HeaderValue};
    use http::Version;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::transport::request::RequestHead;
    use crate::transport::{BodyReceiver, ServerResponse};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    fn request(method: Method, headers: &[(&str, &str)], body: BodyReceiver) -> Request {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }

        RequestHead {
            method: Some(method),
            path: Some("/file".to_string()),
            version: Version::HTTP_11,
            headers: map,
        }
        .into_request("10.0.0.2:4567".parse().ok(), body)
    }

    fn dispatch(compression: bool) -> Arc<Dispatch> {
        Arc::new(Dispatch::new(Default::default(), compression))
    }

    /// `"http"` context over loopback TCP; the response closes the socket.
    async fn http_context(method: Method, headers: &[(&str, &str)], compression: bool) -> (HttpContext, TcpStream) {
        let (server, client) = tcp_pair().await;
        let (_read, write) = server.into_split();
        let (done, _) = oneshot::channel();
        let head_request = method == Method::HEAD;
        let response = ServerResponse::new(write, Version::HTTP_11, head_request, false, done);

        let ctx = HttpContext::new(
            request(method, headers, BodyReceiver::empty()),
            ResponseOutput::Server(response),
            CloseSignal::new(),
            None,
            dispatch(compression),
        );
        (ctx, client)
    }

    /// `"ws"` context over a raw loopback socket.
    async fn ws_context(headers: &[(&str, &str)]) -> (HttpContext, TcpStream, CloseSignal) {
        let (server, client) = tcp_pair().await;
        let close = CloseSignal::new();
        let socket = RawSocket::new(server, close.clone());

        let ctx = HttpContext::new(
            request(Method::GET, headers, BodyReceiver::empty()),
            ResponseOutput::Raw(socket),
            close.clone(),
            Some(Bytes::new()),
            dispatch(false),
        );
        (ctx, client, close)
    }

    async fn read_all(mut client: TcpStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    fn header_lines(response: &str) -> Vec<&str> {
        let head = response.split("\r\n\r\n").next().unwrap_or_default();
        head.split("\r\n").skip(1).collect()
    }

    #[tokio::test]
    async fn test_accessors_and_defaults() {
        let (ctx, _client) = http_context(Method::POST, &[("x-test", "1")], false).await;

        assert_eq!(ctx.connection_kind(), ConnectionKind::Http);
        assert_eq!(ctx.method(), Method::POST);
        assert_eq!(ctx.path(), "/file");
        assert_eq!(ctx.client_address(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.client_port(), 4567);
        assert_eq!(ctx.headers().get("x-test").unwrap(), "1");
        assert_eq!(ctx.status(), 200);
        assert_eq!(ctx.compression(), CompressionMethod::None);
        assert!(!ctx.is_committed());
    }

    #[tokio::test]
    async fn test_missing_request_fields_fall_back() {
        let (server, _client) = tcp_pair().await;
        let request = RequestHead {
            method: None,
            path: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
        .into_request(None, BodyReceiver::empty());

        let ctx = HttpContext::new(
            request,
            ResponseOutput::Raw(RawSocket::new(server, CloseSignal::new())),
            CloseSignal::new(),
            Some(Bytes::new()),
            dispatch(false),
        );

        assert_eq!(ctx.connection_kind(), ConnectionKind::Ws);
        assert_eq!(ctx.method(), Method::GET);
        assert_eq!(ctx.path(), "/");
        assert_eq!(ctx.client_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(ctx.client_port(), 0);
    }

    #[tokio::test]
    async fn test_raw_socket_framing_and_header_order() {
        let (mut ctx, client, _close) = ws_context(&[]).await;

        ctx.set_status(404, "Not Found")
            .set_header("content-length", "5")
            .set_header("x-foo", "1")
            .set_header("set-cookie", "a=1")
            .set_header("set-cookie", "b=2");
        ctx.write("nope!").await.unwrap();

        assert_eq!(
            read_all(client).await,
            "HTTP/1.1 404 Not Found\r\n\
             x-foo: 1\r\n\
             set-cookie: a=1\r\n\
             set-cookie: b=2\r\n\
             content-length: 5\r\n\r\nnope!"
        );
    }

    #[tokio::test]
    async fn test_server_response_header_order() {
        let (mut ctx, client) = http_context(Method::GET, &[], false).await;

        ctx.set_header("content-length", "5").set_header("x-foo", "1");
        ctx.write("hello").await.unwrap();

        let response = read_all(client).await;
        let lines = header_lines(&response);
        let foo = lines.iter().position(|l| *l == "x-foo: 1").unwrap();
        let length = lines.iter().position(|l| *l == "content-length: 5").unwrap();
        assert!(foo < length);
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_multi_value_headers_in_call_order() {
        let (mut ctx, client) = http_context(Method::GET, &[], false).await;

        ctx.set_header("set-cookie", "first=1").set_header("set-cookie", "second=2");
        ctx.write(Bytes::new()).await.unwrap();

        let response = read_all(client).await;
        let lines = header_lines(&response);
        let first = lines.iter().position(|l| *l == "set-cookie: first=1").unwrap();
        let second = lines.iter().position(|l| *l == "set-cookie: second=2").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_head_request_has_no_length_or_body() {
        let (mut ctx, client) = http_context(Method::HEAD, &[], false).await;
        ctx.write("hello").await.unwrap();

        let response = read_all(client).await;
        assert!(!response.contains("content-length"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_compressed_buffer_gets_encoding_and_length() {
        let (mut ctx, client) = http_context(Method::GET, &[("accept-encoding", "gzip")], true).await;
        assert_eq!(ctx.compression(), CompressionMethod::Gzip);

        ctx.write("hello hello hello hello").await.unwrap();

        let response = read_all(client).await;
        let lines = header_lines(&response);
        assert!(lines.contains(&"content-encoding: gzip"));
        assert!(lines.iter().any(|l| l.starts_with("content-length: ")));
    }

    #[tokio::test]
    async fn test_compressed_stream_drops_length() {
        let (mut ctx, client) = http_context(Method::GET, &[], false).await;
        ctx.set_compression(CompressionMethod::Deflate)
            .set_header("content-length", "999");

        ctx.write(Payload::stream(&b"streamed body"[..])).await.unwrap();

        let response = read_all(client).await;
        let lines = header_lines(&response);
        assert!(lines.contains(&"content-encoding: deflate"));
        assert!(lines.contains(&"transfer-encoding: chunked"));
        assert!(!lines.iter().any(|l| l.starts_with("content-length")));
    }

    #[tokio::test]
    async fn test_second_write_is_rejected() {
        let (mut ctx, _client) = http_context(Method::GET, &[], false).await;
        ctx.write("one").await.unwrap();

        assert!(matches!(ctx.write("two").await, Err(Error::AlreadyCommitted)));
        ctx.set_status(500, "Ignored");
        assert_eq!(ctx.status(), 200);
    }

    #[tokio::test]
    async fn test_write_file_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"0123456789").unwrap();

        let (mut ctx, client, _close) = ws_context(&[]).await;
        ctx.write_file(file.path(), Some(2), Some(5)).await.unwrap();

        let response = read_all(client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n2345"));
    }

    #[tokio::test]
    async fn test_write_file_compressed_has_no_length() {
        let contents = b"0123456789".repeat(20);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &contents).unwrap();

        let (mut ctx, mut client, _close) = ws_context(&[]).await;
        ctx.set_compression(CompressionMethod::Gzip)
            .set_header("content-length", "20");
        ctx.write_file(file.path(), Some(10), Some(29)).await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = String::from_utf8_lossy(&raw[..split]).into_owned();
        let lines: Vec<&str> = head.split("\r\n").skip(1).collect();

        assert!(lines.contains(&"content-encoding: gzip"));
        assert!(!lines.iter().any(|l| l.starts_with("content-length")));

        let mut decoded = Vec::new();
        let mut decoder = flate2::read::GzDecoder::new(&raw[split + 4..]);
        std::io::Read::read_to_end(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded, &contents[10..30]);
    }

    #[tokio::test]
    async fn test_write_file_open_ended_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"0123456789").unwrap();

        let (mut ctx, client, _close) = ws_context(&[]).await;
        ctx.write_file(file.path(), Some(7), Some(u64::MAX)).await.unwrap();

        let response = read_all(client).await;
        assert!(response.ends_with("\r\n\r\n789"));
    }

    #[tokio::test]
    async fn test_write_file_missing_commits_nothing() {
        let (mut ctx, _client) = http_context(Method::GET, &[], false).await;
        let result = ctx.write_file("/definitely/not/here", None, None).await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!ctx.is_committed());
    }

    #[tokio::test]
    async fn test_read_body_on_empty_request() {
        let (mut ctx, _client) = http_context(Method::GET, &[], false).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        ctx.read_body(move |chunk, is_last| {
            let seen = Arc::clone(&seen);
            async move { seen.lock().push((chunk, is_last)) }
        })
        .await;

        assert_eq!(*calls.lock(), vec![(Bytes::new(), true)]);
        assert!(ctx.next_body_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_read_body_in_order_with_backpressure() {
        let (server, _client) = tcp_pair().await;
        let (_read, write) = server.into_split();
        let (done, _) = oneshot::channel();
        let (tx, body) = BodyReceiver::channel();

        let mut ctx = HttpContext::new(
            request(Method::POST, &[], body),
            ResponseOutput::Server(ServerResponse::new(write, Version::HTTP_11, false, false, done)),
            CloseSignal::new(),
            None,
            dispatch(false),
        );

        tokio::spawn(async move {
            for chunk in ["a", "b", "c"] {
                tx.send(Bytes::from(chunk)).await.unwrap();
            }
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(Mutex::new(false));

        let seen = Arc::clone(&calls);
        let flag = Arc::clone(&busy);
        ctx.read_body(move |chunk, is_last| {
            let seen = Arc::clone(&seen);
            let flag = Arc::clone(&flag);
            async move {
                assert!(!std::mem::replace(&mut *flag.lock(), true));
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().push((chunk, is_last));
                *flag.lock() = false;
            }
        })
        .await;

        assert_eq!(
            *calls.lock(),
            vec![
                (Bytes::from("a"), false),
                (Bytes::from("b"), false),
                (Bytes::from("c"), false),
                (Bytes::new(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_upgrade_refused_on_http_context() {
        let (mut ctx, _client) = http_context(Method::GET, &[("sec-websocket-key", "abc")], false).await;
        assert!(!ctx.upgrade(()));
        assert!(!ctx.is_committed());
    }

    #[tokio::test]
    async fn test_upgrade_refused_without_key() {
        let (mut ctx, _client, _close) = ws_context(&[("upgrade", "websocket")]).await;
        assert!(!ctx.upgrade(()));
        assert!(!ctx.is_committed());
    }

    #[tokio::test]
    async fn test_upgrade_only_once() {
        let (mut ctx, _client, _close) = ws_context(&[
            ("upgrade", "websocket"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-version", "13"),
        ])
        .await;

        assert!(ctx.upgrade(42u32));
        assert!(!ctx.upgrade(42u32));
        assert!(matches!(ctx.write("late").await, Err(Error::AlreadyCommitted)));
    }

    #[tokio::test]
    async fn test_upgrade_sends_pending_headers() {
        let (mut ctx, mut client, _close) = ws_context(&[
            ("upgrade", "websocket"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-version", "13"),
        ])
        .await;

        ctx.set_header("x-session", "abc");
        assert!(ctx.upgrade(()));

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        while !out.ends_with(b"\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }

        let response = String::from_utf8(out).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("x-session: abc\r\n"));
    }

    #[tokio::test]
    async fn test_cancellation_signal_on_raw_close() {
        let (ctx, client, _close) = ws_context(&[]).await;
        let token = ctx.cancellation_signal();

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }
}
