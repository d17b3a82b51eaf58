//! Connection establishment: DNS, TCP, TLS.
//!
//! Proxy-chain negotiation lives in [`crate::proxy`] as further methods on
//! [`Dialer`].

pub mod dns;
pub mod tcp;
pub mod tls;

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::fingerprint::Http2Settings;
use crate::log::{EventLog, LogKind};

pub use dns::{AddrFamily, DnsCache, FamilyPolicy, DNS_CACHE_TTL};
pub use tcp::{TcpFingerprint, TcpOptions};
pub use tls::{AlpnProtocol, BoringConnector, MaybeHttpsStream, TlsConfig};

/// Byte stream a connection can be layered on.
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncConn for T {}

/// Type-erased stream: plain TCP, TLS to a proxy, or a tunnel through one.
pub type BoxConn = Box<dyn AsyncConn>;

/// Settings a [`Dialer`] is built from.
#[derive(Debug, Clone, Default)]
pub struct DialerConfig {
    /// Fixed DNS server; system resolver when `None`.
    pub dns_server: Option<SocketAddr>,
    pub family: FamilyPolicy,
    pub tcp: TcpOptions,
    pub tls: TlsConfig,
    pub http2: Http2Settings,
    /// Sent on CONNECT requests to HTTP proxies.
    pub user_agent: String,
}

/// Shared dialing state: DNS cache, socket options and TLS context.
pub struct Dialer {
    dns: DnsCache,
    family: FamilyPolicy,
    tcp: TcpOptions,
    tls: BoringConnector,
    tls_config: TlsConfig,
    http2: Http2Settings,
    user_agent: String,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Result<Self> {
        Ok(Self {
            dns: DnsCache::new(config.dns_server),
            family: config.family,
            tcp: config.tcp,
            tls: BoringConnector::new(&config.tls)?,
            tls_config: config.tls,
            http2: config.http2,
            user_agent: config.user_agent,
        })
    }

    pub fn http2_settings(&self) -> &Http2Settings {
        &self.http2
    }

    pub(crate) fn tls_config(&self) -> &TlsConfig {
        &self.tls_config
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    /// Attach a resolved IP to `addr`. `proxy` selects the event kind.
    pub async fn resolve(&self, addr: &Address, log: &EventLog, proxy: bool) -> Result<Address> {
        if addr.ip().is_some() {
            return Ok(addr.clone());
        }
        let host = addr
            .hostname()
            .ok_or_else(|| Error::invalid_request(format!("{} has no host", addr)))?;
        let family = self.family.for_host(host);
        let ip = self
            .dns
            .lookup(host, family)
            .await
            .map_err(|e| Error::dial("dns lookup", e))?;
        let kind = if proxy {
            LogKind::ProxyDnsLookup
        } else {
            LogKind::DnsLookup
        };
        log.emit(kind, || format!("{} -> {}", host, ip));
        Ok(addr.with_ip(ip))
    }

    /// Resolve and open a TCP connection to `addr`.
    pub async fn dial_tcp(&self, addr: &Address, log: &EventLog, proxy: bool) -> Result<TcpStream> {
        let resolved = self.resolve(addr, log, proxy).await?;
        let sock = resolved
            .socket_addr()
            .ok_or_else(|| Error::invalid_request(format!("{} has no address", addr)))?;
        let stream = tcp::connect_tcp(sock, &self.tcp)
            .await
            .map_err(|e| Error::dial("tcp connect", e))?;
        tracing::debug!("TCP connected to {} ({})", addr, sock);
        let kind = if proxy {
            LogKind::ProxyTcpConnect
        } else {
            LogKind::TcpConnect
        };
        log.emit(kind, || sock.to_string());
        Ok(stream)
    }

    /// TLS handshake with `addr` over `stream`.
    pub async fn tls_handshake(
        &self,
        stream: BoxConn,
        addr: &Address,
        alpn: &[u8],
        log: &EventLog,
        proxy: bool,
    ) -> Result<SslStream<BoxConn>> {
        let host = addr.host_str();
        let tls = self
            .tls
            .handshake(stream, &host, alpn)
            .await
            .map_err(|e| Error::dial("tls handshake", e))?;
        let kind = if proxy {
            LogKind::ProxyTlsHandshake
        } else {
            LogKind::TlsHandshake
        };
        log.emit(kind, || {
            let alpn = tls
                .ssl()
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            format!("{} alpn={}", host, alpn)
        });
        Ok(tls)
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("dns", &self.dns)
            .field("family", &self.family)
            .field("tcp", &self.tcp)
            .finish()
    }
}
