use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::connection_tracker::ConnectionTracker;

/// A request as the mock server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Default)]
struct Shared {
    tracker: ConnectionTracker,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    resets: Arc<AtomicUsize>,
}

/// HTTP/1.1 mock server that keeps connections alive.
///
/// Paths select the behaviour:
/// - `/echo` replies with the request body
/// - `/close` replies and closes the connection
/// - `/reset-once` drops the first request without a reply, then echoes
/// - `/stall` sends headers and part of the body, then goes quiet
/// - `/cookie` sets a cookie
/// - anything else replies `Hello`
pub struct MockHttpServer {
    listener: TcpListener,
    addr: SocketAddr,
    shared: Shared,
}

impl MockHttpServer {
    /// Create a new mock server bound to a random port.
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            shared: Shared::default(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the base URL for this server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.shared.tracker.clone()
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<RecordedRequest>>> {
        self.shared.requests.clone()
    }

    /// Start the server in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        self.shared.tracker.record(peer);
                        tokio::spawn(handle_connection(stream, self.shared.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

/// Serve requests on one connection until the client goes away.
async fn handle_connection(mut stream: TcpStream, shared: Shared) {
    let mut buf = Vec::new();
    loop {
        let request = match timeout(Duration::from_secs(10), read_request(&mut stream, &mut buf)).await {
            Ok(Some(request)) => request,
            _ => break,
        };
        shared.requests.lock().unwrap().push(request.clone());

        let (status, mut headers, body, close) = match request.path.as_str() {
            "/echo" => ("200 OK", vec![], request.body.clone(), false),
            "/close" => ("200 OK", vec![], b"bye".to_vec(), true),
            "/cookie" => (
                "200 OK",
                vec![("Set-Cookie", "session=abc; Path=/".to_string())],
                b"ok".to_vec(),
                false,
            ),
            "/reset-once" => {
                if shared.resets.fetch_add(1, Ordering::SeqCst) == 0 {
                    break;
                }
                ("200 OK", vec![], request.body.clone(), false)
            }
            "/hang" => {
                // Never answer; hold the connection until the client drops it.
                let mut sink = [0u8; 64];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                break;
            }
            "/stall" => {
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nHello")
                    .await;
                // Hold the connection until the client drops it.
                let mut sink = [0u8; 64];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                break;
            }
            _ => ("200 OK", vec![], b"Hello".to_vec(), false),
        };

        headers.push(("Content-Length", body.len().to_string()));
        headers.push((
            "Connection",
            if close { "close" } else { "keep-alive" }.to_string(),
        ));
        let mut response = format!("HTTP/1.1 {}\r\n", status);
        for (name, value) in &headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        let mut response = response.into_bytes();
        response.extend_from_slice(&body);

        if stream.write_all(&response).await.is_err() || stream.flush().await.is_err() {
            break;
        }
        if close {
            break;
        }
    }
}

/// Read one request (head plus content-length or chunked body). Leftover
/// bytes stay in `buf` for the next call.
async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<RecordedRequest> {
    let head_end = loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if !fill(stream, buf).await {
            return None;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    buf.drain(..head_end);

    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let body = if header("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
        read_chunked(stream, buf).await?
    } else {
        let len: usize = header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
        while buf.len() < len {
            if !fill(stream, buf).await {
                return None;
            }
        }
        buf.drain(..len).collect()
    };

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

async fn read_chunked(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find(buf, b"\r\n") {
                break pos;
            }
            if !fill(stream, buf).await {
                return None;
            }
        };
        let size_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        buf.drain(..line_end + 2);
        while buf.len() < size + 2 {
            if !fill(stream, buf).await {
                return None;
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
        if size == 0 {
            return Some(body);
        }
    }
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 8192];
    match stream.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
