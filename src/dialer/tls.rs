//! BoringSSL TLS connector with client-hello fingerprint control.
//!
//! Works over any boxed stream so the same code handshakes with a
//! destination, an HTTPS proxy hop, or a destination reached through a
//! tunnel.

use std::io;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use boring::ssl::{SslConnector, SslMethod, SslSessionCacheMode, SslVerifyMode, SslVersion};
use boring::x509::X509;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_boring::SslStream;

use crate::dialer::BoxConn;
use crate::error::{Error, Result};
use crate::fingerprint::{CertCompression, TlsFingerprint};

// FFI bindings for BoringSSL extension control
use boring_sys::{CRYPTO_BUFFER, SSL, SSL_CTX};
use std::os::raw::c_int;

extern "C" {
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int);
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int);
}

/// ALPN offer used on proxy hops: tunnels always speak HTTP/1.1.
pub const ALPN_HTTP1_ONLY: &[u8] = b"\x08http/1.1";

/// Copy a decompressed certificate into a fresh CRYPTO_BUFFER.
unsafe fn install_cert_buffer(out: *mut *mut CRYPTO_BUFFER, data: &[u8]) -> c_int {
    let buffer = boring_sys::CRYPTO_BUFFER_new(data.as_ptr(), data.len(), std::ptr::null_mut());
    if buffer.is_null() {
        return 0;
    }
    *out = buffer;
    1
}

unsafe extern "C" fn decompress_brotli_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    let mut decoder = brotli::Decompressor::new(compressed, uncompressed_len);
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) if decompressed.len() == uncompressed_len => {
            install_cert_buffer(out, &decompressed)
        }
        _ => 0,
    }
}

unsafe extern "C" fn decompress_zlib_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) if decompressed.len() == uncompressed_len => {
            install_cert_buffer(out, &decompressed)
        }
        _ => 0,
    }
}

/// TLS settings the connector is built from.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub fingerprint: Option<TlsFingerprint>,
    /// Extra trust anchors, DER or PEM.
    pub root_certs: Vec<Vec<u8>>,
    /// Skip certificate and hostname verification.
    pub insecure: bool,
}

/// Shared BoringSSL context. Cloning is cheap and keeps the session cache.
#[derive(Clone)]
pub struct BoringConnector {
    connector: SslConnector,
    insecure: bool,
}

impl BoringConnector {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL connector: {}", e)))?;

        for cert_bytes in &config.root_certs {
            let cert = X509::from_der(cert_bytes)
                .or_else(|_| X509::from_pem(cert_bytes))
                .map_err(|e| Error::tls(format!("Invalid root certificate: {}", e)))?;
            builder
                .cert_store_mut()
                .add_cert(cert)
                .map_err(|e| Error::tls(format!("Failed to add root certificate: {}", e)))?;
        }

        if config.insecure {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if let Some(fp) = &config.fingerprint {
            if !fp.cipher_list.is_empty() {
                builder
                    .set_cipher_list(&fp.cipher_list.join(":"))
                    .map_err(|e| Error::tls(format!("Failed to set cipher list: {}", e)))?;
            }
            if let Some(curves) = fp.curves_list() {
                builder
                    .set_curves_list(&curves)
                    .map_err(|e| Error::tls(format!("Failed to set curves: {}", e)))?;
            }
            if !fp.sigalgs.is_empty() {
                builder
                    .set_sigalgs_list(&fp.sigalgs.join(":"))
                    .map_err(|e| Error::tls(format!("Failed to set signature algorithms: {}", e)))?;
            }

            unsafe {
                let ctx = builder.as_ptr();
                // GREASE implies Chrome-style permutation; without it the
                // extension order is left as BoringSSL emits it.
                SSL_CTX_set_grease_enabled(ctx, fp.grease as c_int);
                SSL_CTX_set_permute_extensions(ctx, fp.grease as c_int);

                match fp.cert_compression {
                    CertCompression::Brotli => {
                        boring_sys::SSL_CTX_add_cert_compression_alg(
                            ctx,
                            boring_sys::TLSEXT_cert_compression_brotli as u16,
                            None,
                            Some(decompress_brotli_cert),
                        );
                    }
                    CertCompression::Zlib => {
                        boring_sys::SSL_CTX_add_cert_compression_alg(
                            ctx,
                            boring_sys::TLSEXT_cert_compression_zlib as u16,
                            None,
                            Some(decompress_zlib_cert),
                        );
                    }
                    CertCompression::None => {}
                }
            }
        }

        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| Error::tls(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::tls(format!("Failed to set max TLS version: {}", e)))?;
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

        Ok(Self {
            connector: builder.build(),
            insecure: config.insecure,
        })
    }

    /// Handshake over `stream`, offering `alpn` (wire format).
    pub async fn handshake(
        &self,
        stream: BoxConn,
        host: &str,
        alpn: &[u8],
    ) -> Result<SslStream<BoxConn>> {
        let mut config = self
            .connector
            .configure()
            .map_err(|e| Error::tls(format!("Failed to configure SSL: {}", e)))?;
        config
            .set_alpn_protos(alpn)
            .map_err(|e| Error::tls(format!("Failed to set ALPN: {}", e)))?;
        if self.insecure {
            config.set_verify_hostname(false);
        }
        tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))
    }
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    H2,
    Http1,
    Unknown,
}

impl AlpnProtocol {
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }
}

/// A destination stream, with or without TLS.
pub enum MaybeHttpsStream {
    Http(BoxConn),
    Https(SslStream<BoxConn>),
}

impl MaybeHttpsStream {
    /// ALPN result; `Unknown` for plain streams.
    pub fn alpn_protocol(&self) -> AlpnProtocol {
        match self {
            MaybeHttpsStream::Http(_) => AlpnProtocol::Unknown,
            MaybeHttpsStream::Https(stream) => match stream.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::Unknown,
            },
        }
    }

    pub fn is_h2(&self) -> bool {
        self.alpn_protocol().is_h2()
    }
}

impl AsyncRead for MaybeHttpsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeHttpsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_flush(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_chrome_fingerprint() {
        let config = TlsConfig {
            fingerprint: Some(TlsFingerprint::chrome_131()),
            ..Default::default()
        };
        assert!(BoringConnector::new(&config).is_ok());
    }

    #[test]
    fn test_rejects_garbage_root_cert() {
        let config = TlsConfig {
            root_certs: vec![b"not a certificate".to_vec()],
            ..Default::default()
        };
        assert!(BoringConnector::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_plain_stream_has_no_alpn() {
        let (a, _b) = tokio::io::duplex(64);
        let stream = MaybeHttpsStream::Http(Box::new(a));
        assert_eq!(stream.alpn_protocol(), AlpnProtocol::Unknown);
        assert!(!stream.is_h2());
    }
}
