//! HTTP/1.1 and WebSocket transport layer.
//!
//! This module owns the sockets. It parses request heads, frames response
//! bodies, and keeps upgraded WebSocket connections running.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   plain request    ┌──────────────────────────────┐
//! │              │───────────────────►│ Request + ServerResponse     │
//! │  HttpServer  │                    │ (keep-alive, chunked bodies) │
//! │  (accept)    │   Upgrade header   ├──────────────────────────────┤
//! │              │───────────────────►│ Request + RawSocket          │
//! └──────────────┘                    │ (handshake or manual reply)  │
//!                                     └──────────────┬───────────────┘
//!                                                    │ 101
//!                                                    ▼
//!                                     ┌──────────────────────────────┐
//!                                     │ WsConnection → ClientPool    │
//!                                     └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `server` | Listener and per-connection driver |
//! | `request` | Request head parsing and body channel |
//! | `head` | Response head and header list |
//! | `response` | Framework response object |
//! | `socket` | Raw socket and close signal |
//! | `connection` | Upgraded WebSocket connection |
//! | `pool` | Live connection registry |

// ============================================================================
// Submodules
// ============================================================================

/// Upgraded WebSocket connection and event loop.
pub mod connection;

/// Response head and ordered header list.
pub mod head;

/// Live WebSocket connection registry.
pub mod pool;

/// Request heads and bodies.
pub mod request;

/// Framework response object.
pub mod response;

/// HTTP listener and connection driver.
pub mod server;

/// Raw upgrade socket and close signal.
pub mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ConnectionEvents, ConnectionReader, ConnectionState, MessageKind, WsConnection};
pub use head::{HeaderList, ResponseHead, ResponseSink};
pub use pool::ClientPool;
pub use request::{BodyReceiver, Limits, Request};
pub use response::ServerResponse;
pub use server::{HttpResponse, HttpServer, TransportEvents};
pub use socket::{CloseSignal, RawSocket};
