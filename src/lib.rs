//! # Wraith
//!
//! HTTP client transport with proxy chaining and fingerprint control.
//!
//! Wraith dials through any chain of HTTP, HTTPS and SOCKS5 proxies, pools
//! connections per destination and chain, and speaks HTTP/1.1, HTTP/2 and
//! HTTP/3 over BoringSSL with configurable TLS fingerprints.

pub mod address;
pub mod client;
pub mod dialer;
pub mod error;
pub mod fingerprint;
pub mod log;
pub mod pipe;
pub mod proxy;
pub mod request;
pub mod response;
pub mod scope;
pub mod timeouts;
pub mod version;

pub(crate) mod pool;
pub(crate) mod transport;

// Re-exports
pub use address::{Address, Network, Scheme};
pub use client::{
    default_client, get, Client, ClientBuilder, CookieStore, PostflightHook, PreflightHook,
    RequestBuilder, RetryPolicy,
};
pub use dialer::{AddrFamily, Dialer, DialerConfig, TcpFingerprint};
pub use error::{Error, Result};
pub use fingerprint::{FingerprintProfile, Http2Settings, TlsFingerprint};
pub use log::{LogEvent, LogKind, Logger};
pub use proxy::Socks5UdpSocket;
pub use request::{Request, RequestBody};
pub use response::{Body, Response};
pub use timeouts::Timeouts;
pub use version::HttpVersion;
