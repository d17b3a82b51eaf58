//! TCP dialing with socket options applied before connect.
//!
//! Socket-level fingerprint values (buffer sizes shaping the advertised
//! window, TTL) are only observable if set before the SYN, so the socket is
//! built with socket2 and handed to tokio unconnected.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream};

/// TCP/IP fingerprint configuration.
#[derive(Debug, Clone)]
pub struct TcpFingerprint {
    /// Socket buffer size, which bounds the initial receive window.
    pub window_size: u32,
    /// Initial TTL for IPv4 packets (macOS/Linux 64, Windows 128).
    pub ttl: u8,
}

impl Default for TcpFingerprint {
    fn default() -> Self {
        // Chrome on macOS
        Self {
            window_size: 65535,
            ttl: 64,
        }
    }
}

impl TcpFingerprint {
    pub fn chrome() -> Self {
        Self::default()
    }

    pub fn windows() -> Self {
        Self {
            window_size: 65535,
            ttl: 128,
        }
    }
}

/// Options applied to every outgoing TCP socket.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    pub fingerprint: Option<TcpFingerprint>,
    /// Idle time before keep-alive probes start.
    pub keep_alive: Option<Duration>,
    /// Local address to bind before connecting.
    pub local_addr: Option<IpAddr>,
}

/// Apply fingerprint values to an unconnected socket.
pub fn configure_tcp_socket(socket: &Socket, fp: &TcpFingerprint, ipv4: bool) -> io::Result<()> {
    socket.set_recv_buffer_size(fp.window_size as usize)?;
    socket.set_send_buffer_size(fp.window_size as usize)?;
    if ipv4 {
        socket.set_ttl_v4(fp.ttl as u32)?;
    }
    Ok(())
}

/// Connect to `addr` with `opts` applied.
pub async fn connect_tcp(addr: SocketAddr, opts: &TcpOptions) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if let Some(fp) = &opts.fingerprint {
        configure_tcp_socket(&socket, fp, addr.is_ipv4())?;
    }
    if let Some(idle) = opts.keep_alive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if let Some(local) = opts.local_addr {
        if local.is_ipv4() != addr.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("local address {} does not match family of {}", local, addr),
            ));
        }
        socket.bind(&SocketAddr::new(local, 0).into())?;
    }
    socket.set_nonblocking(true)?;

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpSocket::from_std_stream(std_stream).connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_fingerprint_defaults() {
        let fp = TcpFingerprint::default();
        assert_eq!(fp.window_size, 65535);
        assert_eq!(fp.ttl, 64);
        assert_eq!(TcpFingerprint::windows().ttl, 128);
    }

    #[tokio::test]
    async fn test_connect_with_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let opts = TcpOptions {
            fingerprint: Some(TcpFingerprint::chrome()),
            keep_alive: Some(Duration::from_secs(30)),
            local_addr: Some("127.0.0.1".parse().unwrap()),
        };
        let (client, server) = tokio::join!(connect_tcp(addr, &opts), listener.accept());
        let client = client.unwrap();
        let (_, peer) = server.unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_local_addr_family_mismatch() {
        let opts = TcpOptions {
            local_addr: Some("::1".parse().unwrap()),
            ..Default::default()
        };
        let err = connect_tcp("127.0.0.1:9".parse().unwrap(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
