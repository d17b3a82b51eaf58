//! Error types for the wraith crate.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing, tunneling or exchanging a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP protocol error (malformed response, unexpected framing).
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid request descriptor (bad URL scheme, missing host, bad header).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A low-level failure while establishing a connection. `stage` names
    /// the step ("dns lookup", "tcp connect", ...).
    #[error("{stage} error: {source}")]
    Dial {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// DNS resolution produced no usable address.
    #[error("DNS error: {0}")]
    Dns(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP proxy handshake failure (CONNECT rejected, malformed reply).
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// SOCKS5 negotiation failure.
    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    /// SOCKS5 server rejected the offered or supplied credentials.
    #[error("SOCKS5 authentication failed: {0}")]
    Socks5Auth(String),

    /// QUIC/HTTP3 error.
    #[error("QUIC error: {0}")]
    Quic(String),

    /// A wait was interrupted by a cancelled scope; `cause` is the terminal
    /// cause recorded on that scope.
    #[error("{stage} canceled: {cause}")]
    Canceled {
        stage: &'static str,
        #[source]
        cause: Arc<Error>,
    },

    /// The connection was torn down by an explicit force close.
    #[error("connection force closed")]
    ForceClosed,

    /// The connection was gracefully closed and accepts no more work.
    #[error("connection closed")]
    Closed,

    /// The peer closed the connection.
    #[error("peer closed connection: {0}")]
    PeerClosed(String),

    /// Connect timeout (TCP + TLS handshake + proxy negotiation).
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Response-header timeout.
    #[error("TTFB timeout after {0:?} - server did not respond with headers")]
    TtfbTimeout(Duration),

    /// Read idle timeout (no data received within duration).
    #[error("Read idle timeout after {0:?} - stream may be hung")]
    ReadIdleTimeout(Duration),

    /// Write idle timeout (could not send data within duration).
    #[error("Write idle timeout after {0:?}")]
    WriteIdleTimeout(Duration),

    /// Total request deadline exceeded.
    #[error("Total request deadline exceeded after {0:?}")]
    TotalTimeout(Duration),

    /// Returned by a pre-flight callback to stop the exchange and keep the
    /// previous response (manual redirect handling).
    #[error("use last response")]
    UseLastResponse,

    /// A post-flight callback rejected the response.
    #[error("Callback error: {0}")]
    Callback(String),
}

impl Error {
    /// Create an IO error with custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(io::Error::other(message.into()))
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }

    /// Create a SOCKS5 error.
    pub fn socks5(message: impl Into<String>) -> Self {
        Self::Socks5(message.into())
    }

    /// Create a QUIC error.
    pub fn quic(message: impl Into<String>) -> Self {
        Self::Quic(message.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Wrap `source` with the name of the dial stage that produced it.
    pub fn dial(stage: &'static str, source: impl Into<Error>) -> Self {
        Self::Dial {
            stage,
            source: Box::new(source.into()),
        }
    }

    /// Wrap the terminal cause of a cancelled scope.
    pub fn canceled(stage: &'static str, cause: Arc<Error>) -> Self {
        Self::Canceled { stage, cause }
    }

    /// True when this error, or any error in its cause chain, comes from a
    /// forced closure rather than the peer.
    pub fn is_force_closed(&self) -> bool {
        match self {
            Self::ForceClosed => true,
            Self::Canceled { cause, .. } => cause.is_force_closed(),
            Self::Dial { source, .. } => source.is_force_closed(),
            _ => false,
        }
    }

    /// True for any timeout variant, looking through wrappers.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ConnectTimeout(_)
            | Self::TtfbTimeout(_)
            | Self::ReadIdleTimeout(_)
            | Self::WriteIdleTimeout(_)
            | Self::TotalTimeout(_) => true,
            Self::Canceled { cause, .. } => cause.is_timeout(),
            Self::Dial { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when the error was raised before a connection existed.
    pub fn is_dial(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. }
                | Self::Dns(_)
                | Self::Proxy(_)
                | Self::Socks5(_)
                | Self::Socks5Auth(_)
                | Self::ConnectTimeout(_)
        )
    }

    /// Convert into an `io::Error`, preserving the chain as the inner error.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// Rebuild an owned error from a shared scope cause.
impl From<Arc<Error>> for Error {
    fn from(cause: Arc<Error>) -> Self {
        match &*cause {
            Error::ForceClosed => Error::ForceClosed,
            Error::Closed => Error::Closed,
            _ => Error::Canceled {
                stage: "connection",
                cause,
            },
        }
    }
}
