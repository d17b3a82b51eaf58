//! Timeout configuration for requests and pooled connections.
//!
//! - **connect**: DNS + TCP + proxy negotiation + TLS/QUIC handshake
//! - **ttfb**: task handed to a connection -> response headers received
//! - **read_idle**: maximum gap between response body chunks
//! - **write_idle**: maximum gap between request body writes
//! - **total**: absolute deadline for the whole exchange, retries included
//! - **pool_idle**: how long an idle pooled connection waits for work
//!
//! ```rust,ignore
//! use wraith::{Client, Timeouts};
//! use std::time::Duration;
//!
//! let client = Client::builder()
//!     .timeouts(Timeouts::api_defaults().ttfb(Duration::from_secs(15)))
//!     .build()?;
//! ```

use std::time::Duration;

/// Response-header bound applied when `ttfb` is unset.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(300);

/// Idle lifetime of a pooled connection when `pool_idle` is unset.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-phase timeouts. `None` means no bound for that phase, except `ttfb`
/// and `pool_idle` which fall back to the defaults above.
#[derive(Clone, Debug, Default)]
pub struct Timeouts {
    /// Deadline for establishing the connection, proxy hops included.
    pub connect: Option<Duration>,

    /// Deadline from dispatch until response headers are parsed.
    pub ttfb: Option<Duration>,

    /// Maximum time between body chunks. Resets on every chunk.
    pub read_idle: Option<Duration>,

    /// Maximum time a single request body write may take.
    pub write_idle: Option<Duration>,

    /// Absolute deadline for the request, including retries and body drain.
    pub total: Option<Duration>,

    /// How long a pooled connection stays open without work.
    pub pool_idle: Option<Duration>,
}

impl Timeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for request/response APIs.
    ///
    /// connect 10s, ttfb 30s, read_idle 30s, write_idle 30s, total 120s.
    pub fn api_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            ttfb: Some(Duration::from_secs(30)),
            read_idle: Some(Duration::from_secs(30)),
            write_idle: Some(Duration::from_secs(30)),
            total: Some(Duration::from_secs(120)),
            pool_idle: None,
        }
    }

    /// Defaults for long-lived streamed responses: no total deadline and a
    /// longer read idle window.
    pub fn streaming_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            ttfb: Some(Duration::from_secs(30)),
            read_idle: Some(Duration::from_secs(120)),
            write_idle: Some(Duration::from_secs(30)),
            total: None,
            pool_idle: None,
        }
    }

    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    pub fn ttfb(mut self, timeout: Duration) -> Self {
        self.ttfb = Some(timeout);
        self
    }

    pub fn read_idle(mut self, timeout: Duration) -> Self {
        self.read_idle = Some(timeout);
        self
    }

    pub fn write_idle(mut self, timeout: Duration) -> Self {
        self.write_idle = Some(timeout);
        self
    }

    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    pub fn pool_idle(mut self, timeout: Duration) -> Self {
        self.pool_idle = Some(timeout);
        self
    }

    /// Effective response-header bound.
    pub fn response_header(&self) -> Duration {
        self.ttfb.unwrap_or(DEFAULT_RESPONSE_HEADER_TIMEOUT)
    }

    /// Effective pooled-connection idle lifetime.
    pub fn pool_idle_or_default(&self) -> Duration {
        self.pool_idle.unwrap_or(DEFAULT_POOL_IDLE_TIMEOUT)
    }
}

/// Receive from a channel, failing if nothing arrives within `idle`.
pub async fn recv_with_idle_timeout<T>(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>,
    idle: Option<Duration>,
) -> crate::Result<Option<T>> {
    match idle {
        Some(idle) => tokio::select! {
            biased;
            v = rx.recv() => Ok(v),
            _ = tokio::time::sleep(idle) => Err(crate::Error::ReadIdleTimeout(idle)),
        },
        None => Ok(rx.recv().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_defaults() {
        let t = Timeouts::api_defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.ttfb, Some(Duration::from_secs(30)));
        assert_eq!(t.total, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_streaming_has_no_total() {
        let t = Timeouts::streaming_defaults();
        assert_eq!(t.read_idle, Some(Duration::from_secs(120)));
        assert_eq!(t.total, None);
    }

    #[test]
    fn test_response_header_default() {
        assert_eq!(Timeouts::new().response_header(), Duration::from_secs(300));
        let t = Timeouts::new().ttfb(Duration::from_secs(5));
        assert_eq!(t.response_header(), Duration::from_secs(5));
        assert_eq!(t.pool_idle_or_default(), DEFAULT_POOL_IDLE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_recv_with_idle_timeout() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        let err = recv_with_idle_timeout(&mut rx, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ReadIdleTimeout(_)));
        tx.send(7).unwrap();
        assert_eq!(recv_with_idle_timeout(&mut rx, None).await.unwrap(), Some(7));
    }
}
