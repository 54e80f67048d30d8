//! rjweb-runtime-tokio - HTTP and WebSocket runtime on tokio.
//!
//! This library is the I/O layer under an rjweb-style web framework. It
//! owns the listening socket, speaks HTTP/1.1, upgrades connections to
//! WebSocket, and hands every request and socket event to handlers the
//! framework installs.
//!
//! # Architecture
//!
//! - **Transport**: accept loop, request parser, response writers and
//!   WebSocket connections, one tokio task per connection
//! - **Contexts**: [`HttpContext`] per request, [`WsContext`] per socket
//!   event, both built by the runtime and moved into the handler
//! - **Registry**: topic to subscriber map used by
//!   [`Runtime::ws_publish`]
//!
//! # Quick Start
//!
//! ```no_run
//! use rjweb_runtime_tokio::{MessageKind, Result, Runtime, Serve};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let serve = Serve::new()
//!         .http(|mut ctx| async move {
//!             if !ctx.upgrade(()) {
//!                 ctx.set_header("content-type", "text/plain");
//!                 let _ = ctx.write("hello").await;
//!             }
//!         })
//!         .ws_open(|ctx| async move {
//!             ctx.subscribe(1u32);
//!         });
//!
//!     let runtime = Runtime::builder().port(8080).serve(serve).build()?;
//!     runtime.start().await?;
//!
//!     runtime.ws_publish(MessageKind::Text, 1u32, "welcome", false)?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`compression`] | Content-encoding negotiation and encoders |
//! | [`context`] | [`HttpContext`], [`WsContext`] and [`Serve`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection and topic IDs |
//! | [`registry`] | Topic subscriptions |
//! | [`runtime`] | [`Runtime`], its builder and options |
//! | [`transport`] | HTTP/1.1 and WebSocket plumbing (internal) |

// ============================================================================
// Modules
// ============================================================================

/// Response compression.
pub mod compression;

/// Handler contexts.
///
/// - [`HttpContext`] - one request, one response
/// - [`WsContext`] - one open, message or close event
pub mod context;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Topic subscription registry.
pub mod registry;

/// Runtime control surface.
///
/// Use [`Runtime::builder()`] to create a configured runtime.
pub mod runtime;

/// Transport layer.
///
/// Internal module handling the listener, HTTP/1.1 framing and WebSocket
/// connections.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Compression
pub use compression::{CompressionMethod, compress_buffer, compress_stream};

// Context types
pub use context::{
    BodyChunk, ConnectionKind, HttpContext, Payload, Serve, UserData, WsContext, WsEventKind,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, TopicId};

// Registry
pub use registry::SubscriptionRegistry;

// Runtime types
pub use runtime::{Runtime, RuntimeBuilder, RuntimeOptions};

// Transport types
pub use transport::{ConnectionState, MessageKind, WsConnection};
