//! Builder pattern for runtime configuration.
//!
//! # Example
//!
//! ```ignore
//! let runtime = Runtime::builder()
//!     .port(8080)
//!     .compression(true)
//!     .serve(Serve::new().http(|mut ctx| async move {
//!         let _ = ctx.write("hello").await;
//!     }))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::IpAddr;
use std::time::Duration;

use crate::context::Serve;
use crate::error::Result;

use super::Runtime;
use super::options::RuntimeOptions;

// ============================================================================
// RuntimeBuilder
// ============================================================================

/// Builder for a [`Runtime`].
///
/// Use [`Runtime::builder()`] to create one.
#[derive(Debug, Default, Clone)]
pub struct RuntimeBuilder {
    options: RuntimeOptions,
    serve: Option<Serve>,
}

impl RuntimeBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the listening port (`0` picks one).
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn bind(mut self, bind: IpAddr) -> Self {
        self.options.bind = bind;
        self
    }

    /// Sets the liveness ping period.
    #[inline]
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Enables response compression negotiation.
    #[inline]
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.options.compression = enabled;
        self
    }

    /// Sets the request head size limit.
    #[inline]
    #[must_use]
    pub fn max_head_size(mut self, size: usize) -> Self {
        self.options.max_head_size = size;
        self
    }

    /// Sets the request header count limit.
    #[inline]
    #[must_use]
    pub fn max_headers(mut self, count: usize) -> Self {
        self.options.max_headers = count;
        self
    }

    /// Installs handlers up front.
    #[inline]
    #[must_use]
    pub fn serve(mut self, serve: Serve) -> Self {
        self.serve = Some(serve);
        self
    }

    /// Validates the options and builds the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for invalid options.
    pub fn build(self) -> Result<Runtime> {
        let runtime = Runtime::new(self.options)?;
        if let Some(serve) = self.serve {
            runtime.handle(serve);
        }
        Ok(runtime)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use crate::Error;

    #[test]
    fn test_new_uses_defaults() {
        let builder = RuntimeBuilder::new();
        assert_eq!(builder.options, RuntimeOptions::default());
        assert!(builder.serve.is_none());
    }

    #[test]
    fn test_setters_update_options() {
        let builder = RuntimeBuilder::new()
            .port(8081)
            .bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .ping_interval(Duration::from_secs(1))
            .compression(true)
            .max_head_size(2048)
            .max_headers(10);

        assert_eq!(builder.options.port, 8081);
        assert_eq!(builder.options.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(builder.options.ping_interval, Duration::from_secs(1));
        assert!(builder.options.compression);
        assert_eq!(builder.options.max_head_size, 2048);
        assert_eq!(builder.options.max_headers, 10);
    }

    #[test]
    fn test_build_valid() {
        let runtime = RuntimeBuilder::new().port(8082).serve(Serve::new()).build().unwrap();
        assert_eq!(runtime.port(), 8082);
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_build_rejects_zero_ping_interval() {
        let err = RuntimeBuilder::new()
            .ping_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_rejects_small_head_limit() {
        let result = RuntimeBuilder::new().max_head_size(512).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_is_clone() {
        let builder = RuntimeBuilder::new().port(1234);
        let cloned = builder.clone();
        assert_eq!(builder.options, cloned.options);
    }
}
