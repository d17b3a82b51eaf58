use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

use super::connection_tracker::ConnectionTracker;

/// Shared record of what each proxy was asked to reach, in order.
pub type HopLog = Arc<Mutex<Vec<String>>>;

pub fn hop_log() -> HopLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// SOCKS5 proxy supporting CONNECT and UDP ASSOCIATE, with optional
/// username/password authentication.
pub struct MockSocks5Proxy {
    listener: TcpListener,
    addr: SocketAddr,
    credentials: Option<(String, String)>,
    log: HopLog,
    tracker: ConnectionTracker,
}

impl MockSocks5Proxy {
    pub async fn new(log: HopLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            credentials: None,
            log,
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn with_credentials(mut self, user: &str, pass: &str) -> Self {
        self.credentials = Some((user.to_string(), pass.to_string()));
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Proxy URL, with `userinfo` (`user:pass`) when given.
    pub fn url(&self, userinfo: Option<&str>) -> String {
        match userinfo {
            Some(info) => format!("socks5://{}@{}", info, self.addr),
            None => format!("socks5://{}", self.addr),
        }
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let Self {
            listener,
            credentials,
            log,
            tracker,
            ..
        } = self;
        let credentials = Arc::new(credentials);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tracker.record(peer);
                let credentials = credentials.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_socks5(stream, &credentials, log).await {
                        tracing::debug!("mock socks5: {}", e);
                    }
                });
            }
        })
    }
}

async fn serve_socks5(
    mut stream: TcpStream,
    credentials: &Option<(String, String)>,
    log: HopLog,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    assert_eq!(head[0], 0x05, "client must speak SOCKS5");
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    match credentials {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                stream.write_all(&[0x05, 0xff]).await?;
                return Ok(());
            }
            stream.write_all(&[0x05, 0x02]).await?;
            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await?;
            assert_eq!(ver_ulen[0], 0x01);
            let mut got_user = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut got_user).await?;
            let plen = stream.read_u8().await?;
            let mut got_pass = vec![0u8; plen as usize];
            stream.read_exact(&mut got_pass).await?;
            if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
                stream.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            stream.write_all(&[0x01, 0x00]).await?;
        }
        None => stream.write_all(&[0x05, 0x00]).await?,
    }

    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    let target = read_target(&mut stream).await?;

    match request[1] {
        0x01 => {
            log.lock().unwrap().push(format!("socks5 {}", target));
            let mut upstream = match TcpStream::connect(target).await {
                Ok(s) => s,
                Err(_) => {
                    stream.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
                    return Ok(());
                }
            };
            let bound = upstream.local_addr()?;
            stream.write_all(&reply(bound)).await?;
            let _ = copy_bidirectional(&mut stream, &mut upstream).await;
        }
        0x03 => {
            log.lock().unwrap().push(format!("socks5-udp {}", target));
            let relay = UdpSocket::bind("127.0.0.1:0").await?;
            stream.write_all(&reply(relay.local_addr()?)).await?;
            let relay_task = tokio::spawn(relay_udp(relay));
            // The association lives as long as the control connection.
            let mut sink = [0u8; 64];
            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            relay_task.abort();
        }
        _ => {
            stream.write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

async fn read_target(stream: &mut TcpStream) -> std::io::Result<SocketAddr> {
    let atyp = stream.read_u8().await?;
    let ip: IpAddr = match atyp {
        0x01 => {
            let mut b = [0u8; 4];
            stream.read_exact(&mut b).await?;
            IpAddr::from(b)
        }
        0x04 => {
            let mut b = [0u8; 16];
            stream.read_exact(&mut b).await?;
            IpAddr::from(b)
        }
        0x03 => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8_lossy(&name).into_owned();
            return lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| std::io::Error::other("no address"));
        }
        other => return Err(std::io::Error::other(format!("bad atyp {}", other))),
    };
    let port = stream.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

fn reply(bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![0x05, 0x00, 0x00];
    encode_addr(&mut out, bound);
    out
}

fn encode_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(0x01);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(0x04);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Relay datagrams between the first client that talks to `relay` and the
/// peers it addresses.
async fn relay_udp(relay: UdpSocket) {
    let mut client: Option<SocketAddr> = None;
    let mut buf = vec![0u8; 65_535];
    while let Ok((n, from)) = relay.recv_from(&mut buf).await {
        let from_client = client.map_or(true, |c| c == from);
        if from_client {
            client = Some(from);
            if n < 10 || buf[2] != 0x00 || buf[3] != 0x01 {
                continue;
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            let _ = relay.send_to(&buf[10..n], SocketAddr::new(ip.into(), port)).await;
        } else if let Some(client) = client {
            let mut packet = vec![0x00, 0x00, 0x00];
            encode_addr(&mut packet, from);
            packet.extend_from_slice(&buf[..n]);
            let _ = relay.send_to(&packet, client).await;
        }
    }
}

/// HTTP proxy answering CONNECT with a fixed status.
pub struct MockConnectProxy {
    listener: TcpListener,
    addr: SocketAddr,
    status: u16,
    log: HopLog,
}

impl MockConnectProxy {
    pub async fn new(log: HopLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            status: 200,
            log,
        })
    }

    /// Refuse every CONNECT with `status`.
    pub fn refusing(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let status = self.status;
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                let log = self.log.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connect(stream, status, log).await {
                        tracing::debug!("mock connect proxy: {}", e);
                    }
                });
            }
        })
    }
}

async fn serve_connect(mut stream: TcpStream, status: u16, log: HopLog) -> std::io::Result<()> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await?);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let mut request_line = head.lines().next().unwrap_or_default().split(' ');
    assert_eq!(request_line.next(), Some("CONNECT"));
    let target = request_line.next().unwrap_or_default().to_string();
    log.lock().unwrap().push(format!("connect {}", target));

    if status != 200 {
        let response = format!(
            "HTTP/1.1 {} Refused\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let mut upstream = TcpStream::connect(target.as_str()).await?;
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    let _ = copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

/// UDP server echoing every datagram back to its sender.
pub async fn udp_echo_server() -> std::io::Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    Ok(addr)
}
