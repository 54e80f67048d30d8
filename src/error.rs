//! Error types for the runtime.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```no_run
//! use rjweb_runtime_tokio::{HttpContext, Result};
//!
//! async fn hello(mut ctx: HttpContext) -> Result<()> {
//!     ctx.set_header("content-type", "text/plain");
//!     ctx.write("hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::AlreadyStarted`] |
//! | Request | [`Error::MalformedRequest`], [`Error::AlreadyCommitted`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::WebSocket`], [`Error::InvalidUtf8`] |
//! | Compression | [`Error::Compression`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::str::Utf8Error;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::compression::CompressionMethod;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when runtime options fail validation.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The runtime is already listening.
    #[error("Runtime already started")]
    AlreadyStarted,

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// Request head could not be parsed.
    ///
    /// Returned by the transport before any context exists.
    #[error("Malformed request: {message}")]
    MalformedRequest {
        /// Description of the parse failure.
        message: String,
    },

    /// The response was already committed.
    ///
    /// Returned when `write`/`write_file` is called twice, or after an upgrade.
    #[error("Response already committed")]
    AlreadyCommitted,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The peer went away while the response was being written.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Compression Errors
    // ========================================================================
    /// Buffer compression failed.
    ///
    /// Carries the codec error reported by the compressor.
    #[error("Compression failed ({method}): {source}")]
    Compression {
        /// Method that was being applied.
        method: CompressionMethod,
        /// Underlying codec error.
        #[source]
        source: IoError,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Text frame payload is not UTF-8.
    #[error("Invalid UTF-8 in text frame: {0}")]
    InvalidUtf8(#[from] Utf8Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a malformed request error.
    #[inline]
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Creates a compression error.
    #[inline]
    pub fn compression(method: CompressionMethod, source: IoError) -> Self {
        Self::Compression { method, source }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::WebSocket(_))
            || matches!(self, Self::Io(e) if is_disconnect(e.kind()))
    }

    /// Returns `true` if this is a compression error.
    #[inline]
    #[must_use]
    pub fn is_compression_error(&self) -> bool {
        matches!(self, Self::Compression { .. })
    }
}

/// IO error kinds that mean the peer is gone.
fn is_disconnect(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;

    matches!(
        kind,
        BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof | NotConnected
    )
}

// ============================================================================
// Tests
// ============================================================================
