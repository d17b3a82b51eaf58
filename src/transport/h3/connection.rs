//! HTTP/3 connection establishment.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use getrandom::fill as getrandom_fill;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::transport::h3::driver::H3Driver;
use crate::transport::h3::handle::H3Handle;
use crate::transport::h3::MAX_SEND_UDP_PAYLOAD;

/// Handshake bound when the caller gives none.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct H3Connection;

impl H3Connection {
    /// Complete a QUIC handshake with `peer` and spawn the driver, bound to
    /// `delete`.
    pub async fn connect(
        peer: SocketAddr,
        server_name: &str,
        mut config: quiche::Config,
        handshake_timeout: Option<Duration>,
        delete: Scope,
    ) -> Result<H3Handle> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local_addr = socket.local_addr()?;

        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        getrandom_fill(&mut scid).map_err(|e| Error::quic(format!("RNG error: {}", e)))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let mut conn = quiche::connect(Some(server_name), &scid, local_addr, peer, &mut config)
            .map_err(|e| Error::quic(format!("Connect failed: {}", e)))?;

        // Drive the handshake here so failures surface to the dialer.
        let limit = handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let deadline = Instant::now() + limit;
        let mut buf = vec![0u8; 65535];
        let mut out = [0u8; MAX_SEND_UDP_PAYLOAD];

        loop {
            if Instant::now() >= deadline {
                return Err(Error::ConnectTimeout(limit));
            }

            loop {
                match conn.send(&mut out) {
                    Ok((len, _)) => {
                        socket.send_to(&out[..len], peer).await?;
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => return Err(Error::quic(format!("Send error: {}", e))),
                }
            }

            if conn.is_established() {
                break;
            }
            if conn.is_closed() {
                let reason = conn
                    .peer_error()
                    .or(conn.local_error())
                    .map(|e| String::from_utf8_lossy(&e.reason).into_owned())
                    .unwrap_or_default();
                return Err(Error::quic(format!(
                    "Connection closed during handshake {}",
                    reason
                )));
            }

            let wait = conn
                .timeout()
                .unwrap_or(Duration::from_millis(100))
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = delete.cancelled() => return Err(delete.error("h3 handshake")),
                recv = tokio::time::timeout(wait, socket.recv_from(&mut buf)) => match recv {
                    Ok(Ok((len, from))) => {
                        if from == peer {
                            let info = quiche::RecvInfo { from, to: local_addr };
                            let _ = conn.recv(&mut buf[..len], info);
                        }
                    }
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => conn.on_timeout(),
                },
            }
        }

        let h3_config = quiche::h3::Config::new()
            .map_err(|e| Error::quic(format!("H3 Config error: {}", e)))?;
        let h3_conn = quiche::h3::Connection::with_transport(&mut conn, &h3_config)
            .map_err(|e| Error::quic(format!("H3 Init error: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(32);
        let driver = H3Driver::new(
            rx,
            conn,
            h3_conn,
            socket,
            local_addr,
            peer,
            delete,
            closed.clone(),
        );
        tokio::spawn(driver.drive());

        Ok(H3Handle::new(tx, closed))
    }
}
