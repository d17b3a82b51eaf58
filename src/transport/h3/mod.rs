//! HTTP/3 over quiche.
//!
//! A driver task owns the QUIC connection and UDP socket; connectors talk to
//! it through an [`H3Handle`]. Response bodies stream back over a channel
//! per request.

mod connection;
mod driver;
mod handle;

pub(crate) use connection::H3Connection;
pub(crate) use driver::H3Response;
pub(crate) use handle::H3Handle;

use boring::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};
use boring::x509::X509;

use crate::dialer::TlsConfig;
use crate::error::{Error, Result};

/// Chrome advertises 15663105 bytes for initial_max_data.
const CHROME_INITIAL_MAX_DATA: u64 = 15_663_105;

/// Largest UDP payload quiche may send.
pub(crate) const MAX_SEND_UDP_PAYLOAD: usize = 1350;

/// Build a quiche config applying the same TLS fingerprint and trust
/// settings as the TCP connector.
pub(crate) fn quic_config(tls: &TlsConfig) -> Result<quiche::Config> {
    let mut ssl_ctx_builder = SslContextBuilder::new(SslMethod::tls_client())
        .map_err(|e| Error::tls(format!("Failed to create SSL context: {}", e)))?;

    for cert_bytes in &tls.root_certs {
        let cert = X509::from_der(cert_bytes)
            .or_else(|_| X509::from_pem(cert_bytes))
            .map_err(|e| Error::tls(format!("Invalid root certificate: {}", e)))?;
        ssl_ctx_builder
            .cert_store_mut()
            .add_cert(cert)
            .map_err(|e| Error::tls(format!("Failed to add root certificate: {}", e)))?;
    }
    if tls.insecure {
        ssl_ctx_builder.set_verify(SslVerifyMode::NONE);
    }

    if let Some(fp) = &tls.fingerprint {
        // QUIC is TLS 1.3 only; its suites are fixed, so only the 1.2 names
        // in the list matter to BoringSSL here.
        let tls12_ciphers: Vec<&str> = fp
            .cipher_list
            .iter()
            .copied()
            .filter(|c| !c.starts_with("TLS_"))
            .collect();
        if !tls12_ciphers.is_empty() {
            ssl_ctx_builder
                .set_cipher_list(&tls12_ciphers.join(":"))
                .map_err(|e| Error::tls(format!("Failed to set cipher list: {}", e)))?;
        }
        if let Some(curves) = fp.curves_list() {
            ssl_ctx_builder
                .set_curves_list(&curves)
                .map_err(|e| Error::tls(format!("Failed to set curves: {}", e)))?;
        }
        if !fp.sigalgs.is_empty() {
            ssl_ctx_builder
                .set_sigalgs_list(&fp.sigalgs.join(":"))
                .map_err(|e| Error::tls(format!("Failed to set signature algorithms: {}", e)))?;
        }
    }

    let mut config =
        quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ssl_ctx_builder)
            .map_err(|e| Error::quic(format!("Failed to create quiche config: {}", e)))?;

    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .map_err(|e| Error::quic(format!("Failed to set ALPN: {}", e)))?;
    config.verify_peer(!tls.insecure);
    config.set_max_idle_timeout(30_000);
    config.set_max_recv_udp_payload_size(65535);
    config.set_max_send_udp_payload_size(MAX_SEND_UDP_PAYLOAD);
    config.set_initial_max_data(CHROME_INITIAL_MAX_DATA);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_stream_data_uni(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);
    config.set_disable_active_migration(true);

    Ok(config)
}
