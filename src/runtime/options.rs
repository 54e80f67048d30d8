//! Runtime configuration.
//!
//! Options can be set fluently or loaded from JSON:
//!
//! ```ignore
//! let options = RuntimeOptions::from_json(r#"{ "port": 8080, "ping_interval_ms": 10000 }"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Limits;

// ============================================================================
// Constants
// ============================================================================

/// Default liveness ping period.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Smallest accepted `max_head_size`.
pub const MIN_HEAD_SIZE: usize = 1024;

// ============================================================================
// RuntimeOptions
// ============================================================================

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Listening port; `0` lets the OS pick.
    pub port: u16,

    /// Bind address.
    pub bind: IpAddr,

    /// Period of the WebSocket liveness ping.
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,

    /// Pre-select a response compression method from `accept-encoding`.
    pub compression: bool,

    /// Largest accepted request head in bytes.
    pub max_head_size: usize,

    /// Largest accepted number of request headers.
    pub max_headers: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ping_interval: DEFAULT_PING_INTERVAL,
            compression: false,
            max_head_size: limits.max_head_size,
            max_headers: limits.max_headers,
        }
    }
}

// ============================================================================
// RuntimeOptions - Constructors
// ============================================================================

impl RuntimeOptions {
    /// Creates default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// RuntimeOptions - Builder Methods
// ============================================================================

impl RuntimeOptions {
    /// Sets the listening port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Sets the ping period.
    #[inline]
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Enables response compression negotiation.
    #[inline]
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Sets the request head size limit.
    #[inline]
    #[must_use]
    pub fn with_max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = size;
        self
    }

    /// Sets the request header count limit.
    #[inline]
    #[must_use]
    pub fn with_max_headers(mut self, count: usize) -> Self {
        self.max_headers = count;
        self
    }
}

// ============================================================================
// RuntimeOptions - Accessors
// ============================================================================

impl RuntimeOptions {
    /// Returns the listening address.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Returns the request head limits.
    #[inline]
    #[must_use]
    pub fn limits(&self) -> Limits {
        Limits {
            max_head_size: self.max_head_size,
            max_headers: self.max_headers,
        }
    }

    /// Checks the options for values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(Error::config("ping_interval must be greater than zero"));
        }

        if self.max_head_size < MIN_HEAD_SIZE {
            return Err(Error::config(format!(
                "max_head_size must be at least {MIN_HEAD_SIZE} bytes (got {})",
                self.max_head_size
            )));
        }

        if self.max_headers == 0 {
            return Err(Error::config("max_headers must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

/// `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Tests
// ============================================================================
