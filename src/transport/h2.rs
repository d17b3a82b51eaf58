//! HTTP/2 over the h2 crate, with SETTINGS taken from the fingerprint.
//!
//! The connection future runs on its own task bound to the connector's
//! delete scope; requests go out through a cloned [`SendRequest`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2::client::{Builder, SendRequest};
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue};
use http::{Request, Uri};

use crate::dialer::MaybeHttpsStream;
use crate::error::{Error, Result};
use crate::fingerprint::Http2Settings;
use crate::request::{RequestBody, RequestHead};
use crate::scope::Scope;

/// Headers that are connection-specific and forbidden in HTTP/2.
const CONNECTION_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Live HTTP/2 connection.
#[derive(Debug)]
pub(crate) struct H2Session {
    sender: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
}

/// Response head plus the body stream.
pub(crate) struct H2Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: RecvStream,
}

impl H2Session {
    /// Perform the HTTP/2 handshake with fingerprinted SETTINGS and spawn
    /// the connection driver. The driver ends when `delete` is cancelled and
    /// cancels `delete` itself when the peer goes away.
    pub async fn handshake(
        stream: MaybeHttpsStream,
        settings: &Http2Settings,
        delete: Scope,
    ) -> Result<Self> {
        let mut builder = Builder::new();
        builder
            .header_table_size(settings.header_table_size)
            .initial_window_size(settings.initial_window_size)
            .initial_connection_window_size(settings.initial_connection_window_size)
            .max_concurrent_streams(settings.max_concurrent_streams)
            .max_frame_size(settings.max_frame_size)
            .max_header_list_size(settings.max_header_list_size)
            .enable_push(settings.enable_push);

        let handshake = builder.handshake::<_, Bytes>(stream);
        let (sender, connection) = match settings.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| Error::ConnectTimeout(limit))?,
            None => handshake.await,
        }
        .map_err(|e| Error::HttpProtocol(format!("HTTP/2 handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        // No I/O happens without this task.
        tokio::spawn(async move {
            tokio::select! {
                res = connection => {
                    let cause = match res {
                        Ok(()) => Error::PeerClosed("HTTP/2 connection closed".into()),
                        Err(e) => {
                            tracing::debug!("HTTP/2 connection error: {}", e);
                            Error::HttpProtocol(format!("HTTP/2 connection error: {}", e))
                        }
                    };
                    flag.store(true, Ordering::Release);
                    delete.cancel(cause);
                }
                _ = delete.cancelled() => {
                    flag.store(true, Ordering::Release);
                }
            }
        });

        Ok(Self { sender, closed })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one request and wait for its response head.
    pub async fn send_request(
        &self,
        head: &RequestHead,
        body: &mut RequestBody,
        write_idle: Option<Duration>,
        sent: &AtomicBool,
    ) -> Result<H2Response> {
        let request = build_request(head)?;
        let mut sender = self
            .sender
            .clone()
            .ready()
            .await
            .map_err(|e| Error::HttpProtocol(format!("HTTP/2 not ready: {}", e)))?;

        let end_of_stream = body.is_empty();
        sent.store(true, Ordering::Release);
        let (response, mut stream) = sender
            .send_request(request, end_of_stream)
            .map_err(|e| Error::HttpProtocol(format!("Failed to send HTTP/2 request: {}", e)))?;

        if !end_of_stream {
            send_body(&mut stream, body, write_idle).await?;
        }

        let response = response
            .await
            .map_err(|e| Error::HttpProtocol(format!("HTTP/2 response error: {}", e)))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(H2Response {
            status,
            headers,
            body: response.into_body(),
        })
    }
}

fn build_request(head: &RequestHead) -> Result<Request<()>> {
    let uri: Uri = head
        .url
        .as_str()
        .parse()
        .map_err(|e| Error::invalid_request(format!("Invalid URI: {}", e)))?;
    let mut request = Request::builder()
        .method(head.method.clone())
        .uri(uri)
        .body(())
        .map_err(|e| Error::HttpProtocol(format!("Failed to build request: {}", e)))?;

    let headers = request.headers_mut();
    for (name, value) in &head.headers {
        if name.starts_with(':')
            || CONNECTION_HEADERS
                .iter()
                .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        // TE is only allowed with "trailers".
        if name.eq_ignore_ascii_case("te") && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::invalid_request(format!("Invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::invalid_request(format!("Invalid header value: {}", e)))?;
        headers.append(name, value);
    }
    Ok(request)
}

async fn send_body(
    stream: &mut SendStream<Bytes>,
    body: &mut RequestBody,
    write_idle: Option<Duration>,
) -> Result<()> {
    while let Some(mut chunk) = body.chunk().await? {
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let capacity = std::future::poll_fn(|cx| stream.poll_capacity(cx));
            let capacity = match write_idle {
                Some(idle) => tokio::time::timeout(idle, capacity)
                    .await
                    .map_err(|_| Error::WriteIdleTimeout(idle))?,
                None => capacity.await,
            };
            let n = match capacity {
                Some(Ok(n)) => n.min(chunk.len()),
                Some(Err(e)) => {
                    return Err(Error::HttpProtocol(format!(
                        "Failed to send request body: {}",
                        e
                    )))
                }
                None => {
                    return Err(Error::HttpProtocol(
                        "HTTP/2 stream closed while sending body".into(),
                    ))
                }
            };
            stream
                .send_data(chunk.split_to(n), false)
                .map_err(|e| Error::HttpProtocol(format!("Failed to send request body: {}", e)))?;
        }
    }
    stream
        .send_data(Bytes::new(), true)
        .map_err(|e| Error::HttpProtocol(format!("Failed to send request body: {}", e)))
}
