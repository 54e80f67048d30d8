//! Contexts handed to application handlers.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `http` | [`HttpContext`], one per request |
//! | `ws` | [`WsContext`], one per WebSocket event |
//! | `output` | The two response surfaces behind one sink |
//!
//! # Handlers
//!
//! [`Serve`] holds the four callbacks a framework installs with
//! [`Runtime::handle`](crate::Runtime::handle). Until then every callback is
//! a no-op.
//!
//! ```ignore
//! let serve = Serve::new()
//!     .http(|mut ctx| async move {
//!         if !ctx.upgrade(()) {
//!             let _ = ctx.write("hello").await;
//!         }
//!     })
//!     .ws_message(|ctx| async move {
//!         let _ = ctx.send(MessageKind::Text, ctx.message().clone(), false);
//!     });
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Per-request context.
pub mod http;

/// Response surfaces.
pub mod output;

/// Per-event WebSocket context.
pub mod ws;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::registry::SubscriptionRegistry;
use crate::transport::{ClientPool, CloseSignal, HttpResponse, RawSocket, Request, TransportEvents};

pub use http::{BodyChunk, ConnectionKind, HttpContext, Payload};
pub use output::ResponseOutput;
pub use ws::{UserData, WsContext, WsEventKind};

// ============================================================================
// Handler Types
// ============================================================================

/// Handler for plain and pre-upgrade requests.
pub type HttpHandler = Arc<dyn Fn(HttpContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for one kind of WebSocket event.
pub type WsHandler = Arc<dyn Fn(WsContext) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// Serve
// ============================================================================

/// The callback set a framework installs on the runtime.
#[derive(Clone)]
pub struct Serve {
    pub(crate) http: HttpHandler,
    pub(crate) ws_open: WsHandler,
    pub(crate) ws_message: WsHandler,
    pub(crate) ws_close: WsHandler,
}

impl Default for Serve {
    fn default() -> Self {
        let noop_ws: WsHandler = Arc::new(|_| Box::pin(async {}));
        Self {
            http: Arc::new(|_| Box::pin(async {})),
            ws_open: Arc::clone(&noop_ws),
            ws_message: Arc::clone(&noop_ws),
            ws_close: noop_ws,
        }
    }
}

impl fmt::Debug for Serve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serve").finish_non_exhaustive()
    }
}

impl Serve {
    /// Creates a set of no-op handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request handler.
    #[must_use]
    pub fn http<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.http = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self
    }

    /// Binds one handler to open, message and close.
    #[must_use]
    pub fn websocket<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = ws_handler(handler);
        self.ws_open = Arc::clone(&handler);
        self.ws_message = Arc::clone(&handler);
        self.ws_close = handler;
        self
    }

    /// Sets the open handler.
    #[must_use]
    pub fn ws_open<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_open = ws_handler(handler);
        self
    }

    /// Sets the message handler.
    #[must_use]
    pub fn ws_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_message = ws_handler(handler);
        self
    }

    /// Sets the close handler.
    #[must_use]
    pub fn ws_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_close = ws_handler(handler);
        self
    }
}

fn ws_handler<F, Fut>(handler: F) -> WsHandler
where
    F: Fn(WsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(handler(ctx)))
}

// ============================================================================
// Dispatch
// ============================================================================

/// Builds contexts for transport events and runs the installed handlers.
#[derive(Debug)]
pub(crate) struct Dispatch {
    serve: RwLock<Serve>,
    registry: Arc<SubscriptionRegistry>,
    clients: Arc<ClientPool>,
    compression: bool,
}

impl Dispatch {
    pub(crate) fn new(serve: Serve, compression: bool) -> Self {
        Self {
            serve: RwLock::new(serve),
            registry: Arc::new(SubscriptionRegistry::new()),
            clients: Arc::new(ClientPool::new()),
            compression,
        }
    }

    /// Returns the current handlers.
    pub(crate) fn serve(&self) -> Serve {
        self.serve.read().clone()
    }

    /// Replaces the handlers. Contexts already running keep the old ones.
    pub(crate) fn set_serve(&self, serve: Serve) {
        *self.serve.write() = serve;
    }

    pub(crate) fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub(crate) fn clients(&self) -> &ClientPool {
        &self.clients
    }

    pub(crate) fn compression(&self) -> bool {
        self.compression
    }
}

impl TransportEvents for Dispatch {
    fn on_request(self: Arc<Self>, request: Request, response: HttpResponse, close: CloseSignal) {
        let handler = self.serve().http;
        let ctx = HttpContext::new(request, ResponseOutput::Server(response), close, None, self);
        tokio::spawn(handler(ctx));
    }

    fn on_upgrade(self: Arc<Self>, request: Request, socket: RawSocket, head: Bytes, close: CloseSignal) {
        let handler = self.serve().http;
        let ctx = HttpContext::new(request, ResponseOutput::Raw(socket), close, Some(head), self);
        tokio::spawn(handler(ctx));
    }
}

// ============================================================================
// Tests
// ============================================================================
