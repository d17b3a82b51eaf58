//! Browser fingerprint profiles.

use super::http2::Http2Settings;
use super::tls::TlsFingerprint;

/// Named bundle of TLS + HTTP/2 fingerprints and the matching User-Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintProfile {
    /// Chrome 131 on macOS.
    #[default]
    Chrome131,
    /// Plain BoringSSL defaults.
    None,
}

impl FingerprintProfile {
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome131 => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            Self::None => concat!("wraith/", env!("CARGO_PKG_VERSION")),
        }
    }

    /// TLS fingerprint, `None` for stock BoringSSL behaviour.
    pub fn tls_fingerprint(&self) -> Option<TlsFingerprint> {
        match self {
            Self::Chrome131 => Some(TlsFingerprint::chrome_131()),
            Self::None => None,
        }
    }

    pub fn http2_settings(&self) -> Http2Settings {
        Http2Settings::default()
    }
}
