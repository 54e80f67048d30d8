//! Runtime control surface.
//!
//! A [`Runtime`] owns the listener, turns transport events into contexts for
//! the installed [`Serve`] handlers, pings live WebSockets, and fans
//! published frames out to topic subscribers.
//!
//! # Lifecycle
//!
//! ```ignore
//! let runtime = Runtime::builder().port(0).build()?;
//! runtime.handle(serve);
//! runtime.start().await?;
//! println!("listening on {}", runtime.port());
//!
//! runtime.ws_publish(MessageKind::Text, 7, "tick", false)?;
//! runtime.stop().await;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Runtime builder.
pub mod builder;

/// Runtime options.
pub mod options;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::context::{Dispatch, Serve};
use crate::error::{Error, Result};
use crate::identifiers::TopicId;
use crate::registry::SubscriptionRegistry;
use crate::transport::{HttpServer, MessageKind, WsConnection};

pub use builder::RuntimeBuilder;
pub use options::RuntimeOptions;

// ============================================================================
// Types
// ============================================================================

/// Tasks and addresses of a started runtime.
struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
    ping: JoinHandle<()>,
}

// ============================================================================
// Runtime
// ============================================================================

/// HTTP and WebSocket runtime.
///
/// Thread-safe; all methods take `&self`.
pub struct Runtime {
    options: RuntimeOptions,
    dispatch: Arc<Dispatch>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Runtime - Constructors
// ============================================================================

impl Runtime {
    /// Creates a stopped runtime with no-op handlers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` fail validation.
    pub fn new(options: RuntimeOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            dispatch: Arc::new(Dispatch::new(Serve::default(), options.compression)),
            options,
            running: Mutex::new(None),
        })
    }

    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }
}

// ============================================================================
// Runtime - Accessors
// ============================================================================

impl Runtime {
    /// Package name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        env!("CARGO_PKG_NAME")
    }

    /// Package version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Bound port while running, otherwise the configured one.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr().map_or(self.options.port, |addr| addr.port())
    }

    /// Bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of live WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.dispatch.clients().len()
    }

    /// Returns the subscription registry.
    #[must_use]
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.dispatch.registry()
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }
}

// ============================================================================
// Runtime - Control
// ============================================================================

impl Runtime {
    /// Installs the handler set. Requests already in flight keep the
    /// handlers they started with.
    pub fn handle(&self, serve: Serve) {
        self.dispatch.set_serve(serve);
        debug!("Handlers installed");
    }

    /// Binds the listener and starts accepting. Resolves once listening.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the runtime is running
    /// - [`Error::Io`] if binding fails
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyStarted);
        }

        let server = HttpServer::bind(self.options.socket_addr(), self.options.limits()).await?;
        let local_addr = server.local_addr();

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(server.serve(Arc::clone(&self.dispatch), shutdown.clone()));
        let ping = tokio::spawn(ping_loop(
            Arc::clone(&self.dispatch),
            self.options.ping_interval,
            shutdown.clone(),
        ));

        *running = Some(Running {
            local_addr,
            shutdown,
            accept,
            ping,
        });

        info!(%local_addr, name = self.name(), version = self.version(), "Runtime started");
        Ok(())
    }

    /// Closes the listener and cancels the ping timer.
    ///
    /// Connections already established are left alone. Calling this on a
    /// stopped runtime does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        let _ = running.accept.await;
        let _ = running.ping.await;

        info!(local_addr = %running.local_addr, "Runtime stopped");
    }

    /// Sends a frame to every open, unpaused subscriber of `topic`.
    ///
    /// Returns how many connections the frame was queued to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUtf8`] for a text frame that is not UTF-8.
    pub fn ws_publish(
        &self,
        kind: MessageKind,
        topic: impl Into<TopicId>,
        data: impl Into<Bytes>,
        compressed: bool,
    ) -> Result<usize> {
        let topic = topic.into();
        let message = WsConnection::frame(kind, data.into())?;

        let mut sent = 0;
        for connection in self.dispatch.registry().subscribers(topic) {
            if !connection.is_open() || connection.is_paused() {
                continue;
            }
            if connection.send_message(message.clone()).is_ok() {
                sent += 1;
            }
        }

        trace!(%topic, ?kind, compressed, sent, "Published");
        Ok(sent)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

// ============================================================================
// Ping Loop
// ============================================================================

/// Pings every open, unpaused connection once per `interval`.
async fn ping_loop(dispatch: Arc<Dispatch>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                dispatch.clients().ping_all();
            }
        }
    }

    debug!("Ping loop terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{WebSocketStream, client_async};

    use crate::context::WsEventKind;

    const TIMEOUT: Duration = Duration::from_secs(5);

    type Client = WebSocketStream<TcpStream>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn started(serve: Serve) -> Runtime {
        init_tracing();
        let runtime = Runtime::builder().serve(serve).build().unwrap();
        runtime.start().await.unwrap();
        runtime
    }

    async fn connect(runtime: &Runtime) -> Client {
        let stream = TcpStream::connect(runtime.local_addr().unwrap()).await.unwrap();
        let url = format!("ws://127.0.0.1:{}/ws", runtime.port());
        let (client, _response) = client_async(url, stream).await.unwrap();
        client
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return text.as_str().to_string();
            }
        }
    }

    /// Upgrades every upgrade request; answers plain requests with "plain".
    fn upgrading() -> Serve {
        Serve::new().http(|mut ctx| async move {
            if !ctx.upgrade(()) {
                ctx.set_header("content-type", "text/plain");
                let _ = ctx.write("plain").await;
            }
        })
    }

    #[tokio::test]
    async fn test_metadata() {
        let runtime = Runtime::new(RuntimeOptions::default()).unwrap();
        assert_eq!(runtime.name(), "rjweb-runtime-tokio");
        assert!(!runtime.version().is_empty());
        assert_eq!(runtime.port(), 0);
        assert!(runtime.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runtime = started(Serve::new()).await;
        assert!(runtime.is_running());
        assert!(runtime.port() > 0);
        assert!(matches!(runtime.start().await, Err(Error::AlreadyStarted)));

        let addr = runtime.local_addr().unwrap();
        runtime.stop().await;
        assert!(!runtime.is_running());
        assert!(TcpStream::connect(addr).await.is_err());

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let runtime = Runtime::new(RuntimeOptions::default()).unwrap();
        runtime.stop().await;
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_http_request_reaches_handler() -> anyhow::Result<()> {
        let runtime = started(upgrading()).await;
        let addr = runtime.local_addr().ok_or_else(|| anyhow::anyhow!("not listening"))?;
        let mut stream = TcpStream::connect(addr).await?;

        stream
            .write_all(b"GET /hello HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n")
            .await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-type: text/plain\r\n"));
        assert!(response.contains("content-length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\nplain"));

        runtime.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_compression_negotiated_from_options() {
        let runtime = Runtime::builder()
            .compression(true)
            .serve(upgrading())
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let mut stream = TcpStream::connect(runtime.local_addr().unwrap()).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\naccept-encoding: gzip, br;q=0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("content-encoding: gzip\r\n"));

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_upgrade_refused_without_handshake_answers_plainly() {
        let runtime = started(upgrading()).await;
        let mut stream = TcpStream::connect(runtime.local_addr().unwrap()).await.unwrap();

        stream
            .write_all(b"GET /ws HTTP/1.1\r\nupgrade: websocket\r\nconnection: upgrade\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nplain"));

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_open_precedes_message_and_close_cleans_up() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed_rx) = oneshot::channel();
        let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));

        let recorder = Arc::clone(&events);
        let serve = upgrading().websocket(move |ctx| {
            let recorder = Arc::clone(&recorder);
            let closed_tx = Arc::clone(&closed_tx);
            async move {
                recorder.lock().push(ctx.event_kind());
                match ctx.event_kind() {
                    WsEventKind::Open => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ctx.subscribe(1u32);
                        ctx.subscribe(2u32);
                    }
                    WsEventKind::Message => {
                        let text = ctx.message_text().unwrap_or_default().to_string();
                        let _ = ctx.send(MessageKind::Text, format!("echo:{text}"), false);
                    }
                    WsEventKind::Close => {
                        if let Some(tx) = closed_tx.lock().take() {
                            let _ = tx.send(());
                        }
                    }
                }
            }
        });

        let runtime = started(serve).await;
        let mut client = connect(&runtime).await;
        client.send(Message::text("hi")).await.unwrap();

        assert_eq!(next_text(&mut client).await, "echo:hi");
        assert_eq!(runtime.connection_count(), 1);
        assert_eq!(runtime.registry().topic_count(), 2);

        client.close(None).await.unwrap();
        tokio::time::timeout(TIMEOUT, closed_rx).await.unwrap().unwrap();

        assert_eq!(
            *events.lock(),
            vec![WsEventKind::Open, WsEventKind::Message, WsEventKind::Close]
        );
        assert_eq!(runtime.registry().topic_count(), 0);
        assert_eq!(runtime.connection_count(), 0);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_close_handler_cannot_resubscribe() {
        let (closed_tx, closed_rx) = oneshot::channel();
        let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));

        let serve = upgrading()
            .ws_open(|ctx| async move {
                ctx.subscribe(9u32);
            })
            .ws_close(move |ctx| {
                let closed_tx = Arc::clone(&closed_tx);
                async move {
                    let added = ctx.subscribe(9u32);
                    if let Some(tx) = closed_tx.lock().take() {
                        let _ = tx.send(added);
                    }
                }
            });

        let runtime = started(serve).await;
        let mut client = connect(&runtime).await;
        client.send(Message::text("ready?")).await.unwrap();
        client.close(None).await.unwrap();

        let added = tokio::time::timeout(TIMEOUT, closed_rx).await.unwrap().unwrap();
        assert!(!added);
        assert_eq!(runtime.registry().topic_count(), 0);
        assert_eq!(runtime.registry().subscriber_count(TopicId::new(9)), 0);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_publish_and_unsubscribe() {
        let (opened_tx, opened_rx) = oneshot::channel();
        let opened_tx = Arc::new(Mutex::new(Some(opened_tx)));

        let serve = upgrading()
            .ws_open(move |ctx| {
                let opened_tx = Arc::clone(&opened_tx);
                async move {
                    ctx.subscribe(7u32);
                    if let Some(tx) = opened_tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
            })
            .ws_message(|ctx| async move {
                if ctx.message_text() == Some("leave") {
                    ctx.unsubscribe(7u32);
                    let _ = ctx.send(MessageKind::Text, "left", false);
                }
            });

        let runtime = started(serve).await;
        let mut client = connect(&runtime).await;
        tokio::time::timeout(TIMEOUT, opened_rx).await.unwrap().unwrap();

        assert_eq!(runtime.ws_publish(MessageKind::Text, 7u32, "news", false).unwrap(), 1);
        assert_eq!(next_text(&mut client).await, "news");

        client.send(Message::text("leave")).await.unwrap();
        assert_eq!(next_text(&mut client).await, "left");

        assert_eq!(runtime.ws_publish(MessageKind::Text, 7u32, "more", false).unwrap(), 0);
        assert_eq!(runtime.ws_publish(MessageKind::Binary, 8u32, vec![1u8], true).unwrap(), 0);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_publish_skips_paused_and_closing() {
        let opened_conn = Arc::new(Mutex::new(None::<WsConnection>));
        let (opened_tx, opened_rx) = oneshot::channel();
        let opened_tx = Arc::new(Mutex::new(Some(opened_tx)));

        let slot = Arc::clone(&opened_conn);
        let serve = upgrading().ws_open(move |ctx| {
            let slot = Arc::clone(&slot);
            let opened_tx = Arc::clone(&opened_tx);
            async move {
                ctx.subscribe(3u32);
                *slot.lock() = Some(ctx.connection().clone());
                if let Some(tx) = opened_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        let runtime = started(serve).await;
        let _client = connect(&runtime).await;
        tokio::time::timeout(TIMEOUT, opened_rx).await.unwrap().unwrap();

        let connection = opened_conn.lock().clone().unwrap();
        connection.pause();
        assert_eq!(runtime.ws_publish(MessageKind::Text, 3u32, "x", false).unwrap(), 0);

        connection.resume();
        assert_eq!(runtime.ws_publish(MessageKind::Text, 3u32, "x", false).unwrap(), 1);

        connection.close(None, None);
        assert_eq!(runtime.ws_publish(MessageKind::Text, 3u32, "x", false).unwrap(), 0);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_text() {
        let runtime = Runtime::new(RuntimeOptions::default()).unwrap();
        let result = runtime.ws_publish(MessageKind::Text, 1u32, vec![0xffu8], false);
        assert!(matches!(result, Err(Error::InvalidUtf8(_))));
    }

    #[tokio::test]
    async fn test_keepalive_ping() {
        let runtime = Runtime::builder()
            .ping_interval(Duration::from_millis(50))
            .serve(upgrading())
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let mut client = connect(&runtime).await;
        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Ping(_)));

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_fires_while_body_unread() {
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let cancelled_tx = Arc::new(Mutex::new(Some(cancelled_tx)));

        let serve = Serve::new().http(move |ctx| {
            let cancelled_tx = Arc::clone(&cancelled_tx);
            async move {
                ctx.cancellation_signal().cancelled().await;
                if let Some(tx) = cancelled_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        let runtime = started(serve).await;
        let mut stream = TcpStream::connect(runtime.local_addr().unwrap()).await.unwrap();
        stream
            .write_all(b"POST /upload HTTP/1.1\r\ncontent-length: 100\r\n\r\n")
            .await
            .unwrap();
        for _ in 0..3 {
            stream.write_all(&[b'x'; 10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        drop(stream);

        tokio::time::timeout(TIMEOUT, cancelled_rx).await.unwrap().unwrap();
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_signal_fires_on_disconnect() {
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let cancelled_tx = Arc::new(Mutex::new(Some(cancelled_tx)));
        let started_flag = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&started_flag);
        let serve = Serve::new().http(move |ctx| {
            let cancelled_tx = Arc::clone(&cancelled_tx);
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                ctx.cancellation_signal().cancelled().await;
                if let Some(tx) = cancelled_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        let runtime = started(serve).await;
        let mut stream = TcpStream::connect(runtime.local_addr().unwrap()).await.unwrap();
        stream.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();

        while !started_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(stream);

        tokio::time::timeout(TIMEOUT, cancelled_rx).await.unwrap().unwrap();
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_stop_keeps_established_connections() {
        let runtime = started(upgrading().ws_message(|ctx| async move {
            let _ = ctx.send(MessageKind::Text, ctx.message().clone(), false);
        }))
        .await;

        let mut client = connect(&runtime).await;
        runtime.stop().await;

        client.send(Message::text("still here")).await.unwrap();
        assert_eq!(next_text(&mut client).await, "still here");
    }
}
