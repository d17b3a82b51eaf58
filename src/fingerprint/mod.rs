//! TLS, HTTP/2 and TCP fingerprint configuration.

pub mod http2;
pub mod profiles;
pub mod tls;

pub use http2::Http2Settings;
pub use profiles::FingerprintProfile;
pub use tls::{CertCompression, TlsFingerprint};
