//! Datagram socket relayed through a SOCKS5 UDP ASSOCIATE.
//!
//! Every datagram carries a 3-byte header (`RSV RSV FRAG`) followed by the
//! SOCKS5 address of the true peer. The relay stays valid only while the
//! control TCP connection is open.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;

use crate::address::Address;
use crate::dialer::BoxConn;
use crate::error::{Error, Result};
use crate::scope::Scope;

/// Largest datagram accepted from the relay.
const MAX_DATAGRAM: usize = 65_535;

pub struct Socks5UdpSocket {
    socket: Arc<UdpSocket>,
    relay: SocketAddr,
    target: Address,
    scope: Scope,
}

impl Socks5UdpSocket {
    /// Wrap `socket`, relaying through `relay`. `control` is watched until it
    /// closes or errors, which tears the relay down.
    pub(crate) fn new(
        socket: UdpSocket,
        relay: SocketAddr,
        target: Address,
        mut control: BoxConn,
    ) -> Self {
        let scope = Scope::new();
        let watch = scope.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    _ = watch.cancelled() => break,
                    read = control.read(&mut buf) => match read {
                        Ok(0) => {
                            watch.cancel(Error::PeerClosed("SOCKS5 control connection closed".into()));
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            watch.cancel(Error::Io(e));
                            break;
                        }
                    },
                }
            }
            tracing::debug!("SOCKS5 UDP relay control connection done");
        });
        Self {
            socket: Arc::new(socket),
            relay,
            target,
            scope,
        }
    }

    /// The endpoint the association was opened for, marked as UDP.
    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Send `buf` to `target` through the relay.
    pub async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let mut packet = Vec::with_capacity(buf.len() + 262);
        packet.extend_from_slice(&[0x00, 0x00, 0x00]);
        target.encode_socks5(&mut packet)?;
        let header_len = packet.len();
        packet.extend_from_slice(buf);

        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(self.scope.error("udp send")),
            sent = self.socket.send_to(&packet, self.relay) => {
                Ok(sent?.saturating_sub(header_len))
            }
        }
    }

    /// Receive one datagram, returning its payload length and origin.
    ///
    /// Datagrams from anywhere but the relay, and fragments, are dropped.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut packet = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Err(self.scope.error("udp recv")),
                recv = self.socket.recv_from(&mut packet) => recv?,
            };
            if from != self.relay {
                tracing::trace!("dropping datagram from {} (relay is {})", from, self.relay);
                continue;
            }
            if n < 4 || packet[2] != 0x00 {
                continue;
            }
            let (origin, used) = Address::decode_socks5(&packet[3..n])?;
            let payload = &packet[3 + used..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, origin));
        }
    }

    pub fn close(&self) {
        self.scope.cancel(Error::Closed);
    }
}

impl Drop for Socks5UdpSocket {
    fn drop(&mut self) {
        self.scope.cancel(Error::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Scheme;
    use std::time::Duration;

    #[tokio::test]
    async fn test_datagram_framing() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (control, _keep) = tokio::io::duplex(16);
        let target = Address::from_ip(Scheme::Socks5, "10.0.0.9".parse().unwrap(), 53);
        let sock = Socks5UdpSocket::new(local, relay_addr, target.clone(), Box::new(control));

        sock.send_to(b"ping", &target).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = relay.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x00\x00\x01\x0a\x00\x00\x09\x00\x35ping");

        relay.send_to(&buf[..n], from).await.unwrap();
        let mut out = [0u8; 16];
        let (len, origin) = sock.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..len], b"ping");
        assert_eq!(origin.port(), 53);
    }

    #[tokio::test]
    async fn test_control_close_tears_down_relay() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (control, peer) = tokio::io::duplex(16);
        let target = Address::from_ip(Scheme::Socks5, "10.0.0.9".parse().unwrap(), 53);
        let sock = Socks5UdpSocket::new(
            local,
            "127.0.0.1:9".parse().unwrap(),
            target,
            Box::new(control),
        );
        drop(peer);

        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(1), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Canceled { .. }));
        assert!(sock.is_closed());
    }
}
