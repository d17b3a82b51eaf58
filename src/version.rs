//! HTTP version preference.

/// HTTP version preference for a request or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// Force HTTP/1.1 (ALPN offers only `http/1.1`).
    Http1_1,
    /// Offer `h2` first, fall back to HTTP/1.1.
    Http2,
    /// Attempt HTTP/3 on direct HTTPS requests, fall back to TCP.
    Http3,
    /// HTTP/3 only, no fallback.
    Http3Only,
    /// Negotiate via ALPN (same offer as `Http2`).
    #[default]
    Auto,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http1_1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
            Self::Http3Only => "HTTP/3 (no fallback)",
            Self::Auto => "Auto",
        }
    }

    /// Whether an HTTP/3 attempt should be made.
    pub fn wants_h3(&self) -> bool {
        matches!(self, Self::Http3 | Self::Http3Only)
    }

    /// Whether `h2` should be offered over TLS.
    pub fn offers_h2(&self) -> bool {
        !matches!(self, Self::Http1_1)
    }

    /// ALPN wire list for a TCP+TLS connection.
    pub(crate) fn alpn_protos(&self) -> &'static [u8] {
        if self.offers_h2() {
            b"\x02h2\x08http/1.1"
        } else {
            b"\x08http/1.1"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_protos() {
        assert_eq!(HttpVersion::Http1_1.alpn_protos(), b"\x08http/1.1");
        assert_eq!(HttpVersion::Auto.alpn_protos(), b"\x02h2\x08http/1.1");
        assert!(HttpVersion::Http3.offers_h2());
        assert!(!HttpVersion::Auto.wants_h3());
    }
}
