//! One live connection to a destination, possibly through a proxy chain.
//!
//! A connector runs one request at a time and reports back to its pool how
//! the attempt left the connection. Its lifetime is governed by three
//! scopes: *delete* tears the connection down at once, *close* stops it from
//! taking more work, and a per-response *body* scope ends when the response
//! body is finished or dropped.

use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::address::Address;
use crate::dialer::{BoxConn, Dialer, MaybeHttpsStream};
use crate::error::{Error, Result};
use crate::log::{EventLog, LogKind};
use crate::pipe::{pipe, PipeWriter};
use crate::pool::task::{ReadyHook, ReqTask};
use crate::response::{Body, BodyGuard, BodyInner, Response};
use crate::scope::Scope;
use crate::transport::h1::{self, Framing, H1Reader};
use crate::transport::h2::H2Session;
use crate::transport::h3::{self, H3Connection, H3Handle};
use crate::version::HttpVersion;

/// Read size for the HTTP/1.1 drain task.
const DRAIN_CHUNK_SIZE: usize = 16 * 1024;

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// How a task left the connector.
#[derive(Debug)]
pub(crate) enum TaskResult {
    /// The task got its reply; the connection may take more work.
    Served,
    /// The connection could not take the task, which was never sent.
    Discard(ReqTask),
    /// The connection is gone.
    Fatal,
}

struct H1Session {
    writer: AsyncMutex<WriteHalf<MaybeHttpsStream>>,
    reader: Arc<AsyncMutex<H1Reader>>,
}

enum Session {
    H1(H1Session),
    H2(H2Session),
    H3(H3Handle),
}

/// Response head and body source produced by one protocol exchange.
struct Exchange {
    status: u16,
    headers: Vec<(String, String)>,
    version: &'static str,
    inner: BodyInner,
    keep_alive: bool,
    /// Abandoning the body leaves the stream unusable.
    discard_if_unread: bool,
}

pub(crate) struct Connector {
    id: u64,
    proxies: Arc<[Address]>,
    session: Session,
    delete: Scope,
    close: Scope,
    uses: AtomicU64,
}

impl Connector {
    /// Dial `dest` (through `proxies` when non-empty) and set up the
    /// protocol `version` allows.
    pub async fn connect(
        dialer: &Dialer,
        dest: &Address,
        proxies: Arc<[Address]>,
        version: HttpVersion,
        log: &EventLog,
    ) -> Result<Self> {
        let delete = Scope::new();

        if version.wants_h3() && dest.is_https() {
            if proxies.is_empty() {
                match Self::connect_h3(dialer, dest, log, delete.clone()).await {
                    Ok(handle) => {
                        return Ok(Self::new(proxies, Session::H3(handle), delete));
                    }
                    Err(e) if version == HttpVersion::Http3Only => return Err(e),
                    Err(e) => {
                        tracing::debug!("HTTP/3 to {} failed, falling back to TCP: {}", dest, e);
                    }
                }
            } else if version == HttpVersion::Http3Only {
                return Err(Error::invalid_request(
                    "HTTP/3 cannot be carried through a proxy chain",
                ));
            }
        }

        let conn: BoxConn = if proxies.is_empty() {
            Box::new(dialer.dial_tcp(dest, log, false).await?)
        } else {
            let mut chain = proxies.to_vec();
            chain.push(dest.clone());
            dialer.dial_proxy_chain(&chain, log).await?
        };

        let stream = if dest.is_https() {
            let tls = dialer
                .tls_handshake(conn, dest, version.alpn_protos(), log, false)
                .await?;
            MaybeHttpsStream::Https(tls)
        } else {
            MaybeHttpsStream::Http(conn)
        };

        let session = if stream.is_h2() {
            Session::H2(H2Session::handshake(stream, dialer.http2_settings(), delete.clone()).await?)
        } else {
            Session::H1(Self::start_h1(stream, delete.clone()))
        };
        Ok(Self::new(proxies, session, delete))
    }

    async fn connect_h3(
        dialer: &Dialer,
        dest: &Address,
        log: &EventLog,
        delete: Scope,
    ) -> Result<H3Handle> {
        let resolved = dialer.resolve(dest, log, false).await?;
        let peer = resolved
            .socket_addr()
            .ok_or_else(|| Error::invalid_request(format!("{} has no address", dest)))?;
        let config = h3::quic_config(dialer.tls_config())?;
        let host = dest.host_str();
        let handle = H3Connection::connect(
            peer,
            &host,
            config,
            dialer.http2_settings().handshake_timeout,
            delete,
        )
        .await
        .map_err(|e| Error::dial("quic handshake", e))?;
        log.emit(LogKind::TlsHandshake, || format!("{} alpn=h3", host));
        Ok(handle)
    }

    fn new(proxies: Arc<[Address]>, session: Session, delete: Scope) -> Self {
        let close = delete.child();
        Self {
            id: NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed),
            proxies,
            session,
            delete,
            close,
            uses: AtomicU64::new(0),
        }
    }

    /// Split the stream and start draining its read half into a pipe, so a
    /// peer close is noticed even while the connection sits idle.
    fn start_h1(stream: MaybeHttpsStream, delete: Scope) -> H1Session {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, reader) = pipe(delete.clone());
        tokio::spawn(drain(read_half, writer, delete));
        H1Session {
            writer: AsyncMutex::new(write_half),
            reader: Arc::new(AsyncMutex::new(H1Reader::new(reader))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn delete_scope(&self) -> &Scope {
        &self.delete
    }

    pub fn close_scope(&self) -> &Scope {
        &self.close
    }

    /// Whether the connection can take another task.
    pub fn is_usable(&self) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        match &self.session {
            Session::H1(_) => true,
            Session::H2(s) => !s.is_closed(),
            Session::H3(h) => !h.is_closed(),
        }
    }

    /// Stop taking work; the connection ends once the current body is done.
    pub fn close(&self) {
        self.close.cancel(Error::Closed);
    }

    /// Tear the connection down now. Only the first cause is kept.
    pub fn close_with_error(&self, err: Error) {
        self.delete.cancel(err);
    }

    /// Run `task` on this connection.
    ///
    /// Returns once the reply has been delivered and, on success, the
    /// response body has been finished or dropped. `ready` is handed to the
    /// body so the pool hears about a reusable connection the moment the
    /// body completes.
    pub async fn run_task(&self, task: ReqTask, ready: ReadyHook) -> TaskResult {
        if self.delete.is_cancelled() || !self.is_usable() {
            return TaskResult::Discard(task);
        }
        if task.is_abandoned() {
            ready.fire();
            return TaskResult::Served;
        }

        let uses = self.uses.fetch_add(1, Ordering::AcqRel) + 1;
        let body_scope = self.delete.child();
        let ttfb = task.timeouts.response_header();
        let total = task.timeouts.total.unwrap_or_default();
        let mut limit = Instant::now() + ttfb;
        let mut limit_is_total = false;
        if let Some(deadline) = task.deadline {
            if deadline <= limit {
                limit = deadline;
                limit_is_total = true;
            }
        }

        let result = tokio::select! {
            biased;
            _ = self.delete.cancelled() => Err(self.delete.error("request")),
            r = tokio::time::timeout_at(limit, self.execute(&task)) => match r {
                Ok(r) => r,
                Err(_) if limit_is_total => Err(Error::TotalTimeout(total)),
                Err(_) => Err(Error::TtfbTimeout(ttfb)),
            },
        };

        let exchange = match result {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::debug!("connector {} request failed: {}", self.id, e);
                let fatal = matches!(self.session, Session::H1(_)) || !self.is_usable();
                if fatal {
                    self.close_with_error(Error::connection(format!("request failed: {}", e)));
                    task.finish(Err(e));
                    return TaskResult::Fatal;
                }
                ready.fire();
                task.finish(Err(e));
                return TaskResult::Served;
            }
        };

        let log = task.log.clone();
        log.emit(LogKind::ResponseHeader, || {
            format!("{} {}", exchange.version, exchange.status)
        });
        let guard = BodyGuard::new(
            body_scope.clone(),
            self.delete.clone(),
            self.close.clone(),
            exchange.keep_alive,
            exchange.discard_if_unread,
            Some(ready),
            log,
        );
        let body = Body::new(exchange.inner, guard, task.timeouts.read_idle);
        let response = Response::new(
            exchange.status,
            exchange.headers,
            exchange.version,
            task.head.url.clone(),
            body,
        )
        .with_connection(uses == 1, exchange.keep_alive, self.proxies.clone());

        let deadline = task.deadline;
        task.finish(Ok(response));

        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = body_scope.cancelled() => {}
            _ = expired => {
                self.close_with_error(Error::TotalTimeout(total));
                return TaskResult::Fatal;
            }
        }
        if self.delete.is_cancelled() {
            TaskResult::Fatal
        } else {
            TaskResult::Served
        }
    }

    async fn execute(&self, task: &ReqTask) -> Result<Exchange> {
        match &self.session {
            Session::H1(session) => {
                {
                    let mut body = task.body.lock().await;
                    let mut writer = session.writer.lock().await;
                    h1::write_request(
                        &mut *writer,
                        &task.head,
                        &mut body,
                        task.timeouts.write_idle,
                        &task.sent,
                    )
                    .await?;
                }
                let mut reader = session.reader.clone().lock_owned().await;
                let head = reader.read_head(&task.head.method).await?;
                let inner = if head.framing == Framing::Empty {
                    BodyInner::Empty
                } else {
                    BodyInner::H1 {
                        reader,
                        framing: head.framing,
                    }
                };
                Ok(Exchange {
                    status: head.status,
                    headers: head.headers,
                    version: head.version,
                    inner,
                    keep_alive: head.keep_alive,
                    discard_if_unread: true,
                })
            }
            Session::H2(session) => {
                let mut body = task.body.lock().await;
                let response = session
                    .send_request(&task.head, &mut body, task.timeouts.write_idle, &task.sent)
                    .await?;
                let inner = if response.body.is_end_stream() {
                    BodyInner::Empty
                } else {
                    BodyInner::H2(response.body)
                };
                Ok(Exchange {
                    status: response.status,
                    headers: response.headers,
                    version: "HTTP/2",
                    inner,
                    keep_alive: true,
                    discard_if_unread: false,
                })
            }
            Session::H3(handle) => {
                let payload = task.body.lock().await.collect().await?;
                let response = handle.send_request(&task.head, payload, &task.sent).await?;
                Ok(Exchange {
                    status: response.status,
                    headers: response.headers,
                    version: "HTTP/3",
                    inner: BodyInner::H3(response.body),
                    keep_alive: true,
                    discard_if_unread: false,
                })
            }
        }
    }
}

/// Copy the read half into the pipe until EOF, an error, or deletion.
async fn drain(mut read_half: ReadHalf<MaybeHttpsStream>, mut writer: PipeWriter, delete: Scope) {
    let mut buf = vec![0u8; DRAIN_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = delete.cancelled() => break,
            read = read_half.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                // Let the reader see EOF before the connection is deleted.
                drop(writer);
                delete.cancel(Error::PeerClosed("connection closed by peer".into()));
                return;
            }
            Ok(n) => {
                if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                delete.cancel(Error::Io(e));
                break;
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.delete.cancel(Error::Closed);
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match &self.session {
            Session::H1(_) => "HTTP/1.1",
            Session::H2(_) => "HTTP/2",
            Session::H3(_) => "HTTP/3",
        };
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("protocol", &protocol)
            .field("proxies", &self.proxies.len())
            .field("uses", &self.uses.load(Ordering::Relaxed))
            .finish()
    }
}
