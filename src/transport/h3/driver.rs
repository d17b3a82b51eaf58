//! HTTP/3 connection driver: background task that moves packets and routes
//! stream events.
//!
//! The driver owns the QUIC connection and UdpSocket. It exits when the
//! connector's delete scope is cancelled or the connection dies, failing
//! every stream still in flight.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quiche::h3::NameValue;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::transport::h3::MAX_SEND_UDP_PAYLOAD;

/// Headers that must not appear on an HTTP/3 request.
const CONNECTION_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub(crate) enum DriverCommand {
    SendRequest {
        method: http::Method,
        authority: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Bytes,
        response_tx: oneshot::Sender<Result<H3Response>>,
    },
}

/// Response head; body chunks follow on `body`.
#[derive(Debug)]
pub(crate) struct H3Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: mpsc::UnboundedReceiver<Result<Bytes>>,
}

/// Per-stream state tracked by the driver.
struct StreamState {
    response_tx: Option<oneshot::Sender<Result<H3Response>>>,
    body_tx: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    /// Request body not yet accepted by flow control.
    pending: Bytes,
}

impl StreamState {
    fn fail(mut self, err: impl Fn() -> Error) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(err()));
        } else if let Some(tx) = self.body_tx.take() {
            let _ = tx.send(Err(err()));
        }
    }
}

pub(crate) struct H3Driver {
    command_rx: mpsc::Receiver<DriverCommand>,
    conn: quiche::Connection,
    h3_conn: quiche::h3::Connection,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    streams: HashMap<u64, StreamState>,
    delete: Scope,
    closed: Arc<AtomicBool>,
}

impl H3Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_rx: mpsc::Receiver<DriverCommand>,
        conn: quiche::Connection,
        h3_conn: quiche::h3::Connection,
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        delete: Scope,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            command_rx,
            conn,
            h3_conn,
            socket,
            local_addr,
            peer_addr,
            streams: HashMap::new(),
            delete,
            closed,
        }
    }

    /// Run until the connection ends, then tear down.
    pub async fn drive(mut self) {
        let result = self.run().await;
        self.closed.store(true, Ordering::Release);

        let _ = self.conn.close(true, 0x00, b"client shutdown");
        let _ = self.flush().await;

        let cause = match result {
            Ok(()) => Error::PeerClosed("HTTP/3 connection closed".into()),
            Err(e) => {
                tracing::debug!("HTTP/3 driver stopped: {}", e);
                e
            }
        };
        let message = cause.to_string();
        for (_, stream) in self.streams.drain() {
            stream.fail(|| Error::connection(message.clone()));
        }
        self.delete.cancel(cause);
    }

    async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        let delete = self.delete.clone();

        loop {
            self.flush_pending_bodies();
            self.flush().await?;
            if self.conn.is_closed() {
                return Ok(());
            }

            // quiche's timer tells us how long until the next timeout event.
            let timeout = self.conn.timeout().unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = delete.cancelled() => {
                    return Err(delete.error("h3 driver"));
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // All handles dropped.
                    None => return Ok(()),
                },
                res = self.socket.recv_from(&mut buf) => {
                    let (len, from) = res?;
                    if from != self.peer_addr {
                        continue;
                    }
                    let info = quiche::RecvInfo { from, to: self.local_addr };
                    match self.conn.recv(&mut buf[..len], info) {
                        Ok(_) | Err(quiche::Error::Done) => {}
                        Err(e) => tracing::warn!("QUIC recv error: {}", e),
                    }
                    self.process_h3_events()?;
                }
                _ = sleep(timeout) => {
                    self.conn.on_timeout();
                }
            }
        }
    }

    /// Send every packet quiche has queued.
    async fn flush(&mut self) -> Result<()> {
        let mut out = [0u8; MAX_SEND_UDP_PAYLOAD];
        loop {
            match self.conn.send(&mut out) {
                Ok((len, _)) => {
                    self.socket.send_to(&out[..len], self.peer_addr).await?;
                }
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => return Err(Error::quic(format!("QUIC send error: {}", e))),
            }
        }
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        let DriverCommand::SendRequest {
            method,
            authority,
            path,
            headers,
            body,
            response_tx,
        } = cmd;

        let mut h3_headers = vec![
            quiche::h3::Header::new(b":method", method.as_str().as_bytes()),
            quiche::h3::Header::new(b":scheme", b"https"),
            quiche::h3::Header::new(b":authority", authority.as_bytes()),
            quiche::h3::Header::new(b":path", path.as_bytes()),
        ];
        for (name, value) in &headers {
            if name.starts_with(':')
                || CONNECTION_HEADERS
                    .iter()
                    .any(|h| name.eq_ignore_ascii_case(h))
            {
                continue;
            }
            let lower = name.to_ascii_lowercase();
            h3_headers.push(quiche::h3::Header::new(lower.as_bytes(), value.as_bytes()));
        }

        let fin = body.is_empty();
        match self.h3_conn.send_request(&mut self.conn, &h3_headers, fin) {
            Ok(stream_id) => {
                self.streams.insert(
                    stream_id,
                    StreamState {
                        response_tx: Some(response_tx),
                        body_tx: None,
                        pending: body,
                    },
                );
            }
            Err(e) => {
                let _ = response_tx.send(Err(Error::quic(format!("Send request failed: {}", e))));
            }
        }
    }

    /// Push request bodies as far as flow control allows.
    fn flush_pending_bodies(&mut self) {
        let mut failed = Vec::new();
        for (&stream_id, stream) in self.streams.iter_mut() {
            if stream.pending.is_empty() {
                continue;
            }
            match self
                .h3_conn
                .send_body(&mut self.conn, stream_id, &stream.pending, true)
            {
                Ok(written) => {
                    let _ = stream.pending.split_to(written.min(stream.pending.len()));
                }
                Err(quiche::h3::Error::Done) => {}
                Err(e) => failed.push((stream_id, e.to_string())),
            }
        }
        for (stream_id, message) in failed {
            if let Some(stream) = self.streams.remove(&stream_id) {
                stream.fail(|| Error::quic(format!("Send body failed: {}", message)));
            }
        }
    }

    fn process_h3_events(&mut self) -> Result<()> {
        loop {
            match self.h3_conn.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    self.on_headers(stream_id, list);
                }
                Ok((stream_id, quiche::h3::Event::Data)) => self.on_data(stream_id),
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        if stream.response_tx.is_some() {
                            stream.fail(|| {
                                Error::HttpProtocol("HTTP/3 stream finished without headers".into())
                            });
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Reset(code))) => {
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        stream.fail(|| Error::quic(format!("Stream reset: {}", code)));
                    }
                }
                Ok((_, quiche::h3::Event::GoAway)) => {
                    tracing::debug!("HTTP/3 GOAWAY from {}", self.peer_addr);
                }
                Ok(_) => {}
                Err(quiche::h3::Error::Done) => return Ok(()),
                Err(e) => return Err(Error::quic(format!("H3 poll error: {}", e))),
            }
        }
    }

    fn on_headers(&mut self, stream_id: u64, list: Vec<quiche::h3::Header>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let mut status = 0u16;
        let mut headers = Vec::with_capacity(list.len());
        for header in &list {
            let name = String::from_utf8_lossy(header.name());
            let value = String::from_utf8_lossy(header.value());
            if name == ":status" {
                status = value.parse().unwrap_or(0);
            } else {
                headers.push((name.into_owned(), value.into_owned()));
            }
        }
        // Interim responses and trailers carry nothing the caller needs.
        if (100..200).contains(&status) {
            return;
        }
        let Some(response_tx) = stream.response_tx.take() else {
            return;
        };
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let response = H3Response {
            status,
            headers,
            body: body_rx,
        };
        if response_tx.send(Ok(response)).is_ok() {
            stream.body_tx = Some(body_tx);
        } else {
            self.abandon(stream_id);
        }
    }

    fn on_data(&mut self, stream_id: u64) {
        let mut buf = vec![0u8; 65535];
        let mut abandoned = false;
        while let Ok(len) = self.h3_conn.recv_body(&mut self.conn, stream_id, &mut buf) {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            if let Some(tx) = &stream.body_tx {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..len]))).is_err() {
                    abandoned = true;
                    break;
                }
            }
        }
        if abandoned {
            self.abandon(stream_id);
        }
    }

    /// The reader went away; stop receiving on the stream.
    fn abandon(&mut self, stream_id: u64) {
        self.streams.remove(&stream_id);
        let _ = self
            .conn
            .stream_shutdown(stream_id, quiche::Shutdown::Read, 0x010c);
    }
}
