//! HTTP response with a streaming body.
//!
//! The body owns the connector's *body* scope: finishing it (reading to the
//! end) releases the connection back to its pool, dropping it early either
//! discards the connection (HTTP/1.1) or resets the stream (HTTP/2, HTTP/3).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, OwnedMutexGuard};
use url::Url;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::log::{EventLog, LogKind};
use crate::pool::task::ReadyHook;
use crate::scope::Scope;
use crate::timeouts::recv_with_idle_timeout;
use crate::transport::h1::{find_header_value, Framing, H1Reader};

/// Response head plus connection introspection and the body stream.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    http_version: &'static str,
    url: Url,
    is_new_conn: bool,
    in_pool: bool,
    proxies: Arc<[Address]>,
    body: Body,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        headers: Vec<(String, String)>,
        http_version: &'static str,
        url: Url,
        body: Body,
    ) -> Self {
        Self {
            status,
            headers,
            http_version,
            url,
            is_new_conn: false,
            in_pool: false,
            proxies: Arc::from(Vec::new()),
            body,
        }
    }

    pub(crate) fn with_connection(
        mut self,
        is_new_conn: bool,
        in_pool: bool,
        proxies: Arc<[Address]>,
    ) -> Self {
        self.is_new_conn = is_new_conn;
        self.in_pool = in_pool;
        self.proxies = proxies;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Headers in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header_value(&self.headers, name)
    }

    /// All values of `name`, e.g. every `Set-Cookie`.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// "HTTP/1.1", "HTTP/2" or "HTTP/3".
    pub fn http_version(&self) -> &'static str {
        self.http_version
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether this response came over a connection dialed for it.
    pub fn is_new_conn(&self) -> bool {
        self.is_new_conn
    }

    /// Whether the connection goes back to its pool once the body is done.
    pub fn in_pool(&self) -> bool {
        self.in_pool
    }

    /// First proxy hop, if the connection was tunneled.
    pub fn proxy(&self) -> Option<&Address> {
        self.proxies.first()
    }

    /// Full proxy chain the connection was dialed through.
    pub fn proxies(&self) -> &[Address] {
        &self.proxies
    }

    /// Next body chunk, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Read the whole body as UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.body.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::HttpProtocol(format!("UTF-8 decode error: {}", e)))
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}

pub(crate) enum BodyInner {
    Empty,
    H1 {
        reader: OwnedMutexGuard<H1Reader>,
        framing: Framing,
    },
    H2(h2::RecvStream),
    H3(mpsc::UnboundedReceiver<Result<Bytes>>),
}

/// Streaming response body.
pub struct Body {
    // Declared before `guard` so the reader lock is released before the
    // guard signals the connector.
    inner: BodyInner,
    guard: Option<BodyGuard>,
    read_idle: Option<Duration>,
}

impl Body {
    pub(crate) fn empty() -> Self {
        Self {
            inner: BodyInner::Empty,
            guard: None,
            read_idle: None,
        }
    }

    pub(crate) fn new(inner: BodyInner, guard: BodyGuard, read_idle: Option<Duration>) -> Self {
        let mut body = Self {
            inner,
            guard: Some(guard),
            read_idle,
        };
        if matches!(body.inner, BodyInner::Empty) {
            body.complete();
        }
        body
    }

    /// True once the body has been read to the end or failed.
    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(guard) = self.guard.as_ref() else {
            return Ok(None);
        };
        let delete = guard.delete.clone();
        let read = next_chunk(&mut self.inner, self.read_idle);
        let result = tokio::select! {
            biased;
            r = read => r,
            _ = delete.cancelled() => Err(delete.error("body read")),
        };
        match result {
            Ok(Some(chunk)) => {
                if let Some(guard) = self.guard.as_mut() {
                    guard.received += chunk.len() as u64;
                }
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.complete();
                Ok(None)
            }
            Err(e) => {
                self.inner = BodyInner::Empty;
                self.guard = None;
                // A torn-down connector shows up as EOF on the pipe first.
                if delete.cause().is_some_and(|c| c.is_force_closed()) {
                    return Err(delete.error("body read"));
                }
                Err(e)
            }
        }
    }

    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    fn complete(&mut self) {
        self.inner = BodyInner::Empty;
        if let Some(guard) = self.guard.take() {
            guard.finish();
        }
    }
}

async fn next_chunk(inner: &mut BodyInner, idle: Option<Duration>) -> Result<Option<Bytes>> {
    match inner {
        BodyInner::Empty => Ok(None),
        BodyInner::H1 { reader, framing } => {
            with_idle(reader.read_body_chunk(framing), idle).await
        }
        BodyInner::H2(recv) => {
            let data = with_idle(async { Ok(recv.data().await) }, idle).await?;
            match data {
                Some(Ok(chunk)) => {
                    let _ = recv.flow_control().release_capacity(chunk.len());
                    Ok(Some(chunk))
                }
                Some(Err(e)) => Err(Error::HttpProtocol(format!(
                    "Failed to read response body: {}",
                    e
                ))),
                None => Ok(None),
            }
        }
        BodyInner::H3(rx) => match recv_with_idle_timeout(rx, idle).await? {
            Some(chunk) => chunk.map(Some),
            None => Ok(None),
        },
    }
}

async fn with_idle<T>(fut: impl Future<Output = Result<T>>, idle: Option<Duration>) -> Result<T> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, fut)
            .await
            .map_err(|_| Error::ReadIdleTimeout(idle))?,
        None => fut.await,
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            BodyInner::Empty => "empty",
            BodyInner::H1 { .. } => "h1",
            BodyInner::H2(_) => "h2",
            BodyInner::H3(_) => "h3",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Ties a body to the connector that produced it.
pub(crate) struct BodyGuard {
    pub body: Scope,
    pub delete: Scope,
    pub close: Scope,
    /// The connection can carry another request after this body.
    pub keep_alive: bool,
    /// An unfinished body leaves the stream unusable (HTTP/1.1).
    pub discard_if_unread: bool,
    pub ready: Option<ReadyHook>,
    pub log: EventLog,
    pub received: u64,
    done: bool,
}

impl BodyGuard {
    pub fn new(
        body: Scope,
        delete: Scope,
        close: Scope,
        keep_alive: bool,
        discard_if_unread: bool,
        ready: Option<ReadyHook>,
        log: EventLog,
    ) -> Self {
        Self {
            body,
            delete,
            close,
            keep_alive,
            discard_if_unread,
            ready,
            log,
            received: 0,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
        let received = self.received;
        self.log
            .emit(LogKind::ResponseBody, || format!("{} bytes", received));
        self.release();
    }

    fn release(&mut self) {
        if self.keep_alive {
            if let Some(ready) = self.ready.take() {
                ready.fire();
            }
        } else {
            self.close.cancel(Error::Closed);
        }
        self.body.cancel(Error::Closed);
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.discard_if_unread {
            self.delete
                .cancel(Error::connection("response body dropped before completion"));
            self.body.cancel(Error::Closed);
        } else {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn guard(keep_alive: bool, discard: bool, fired: Arc<AtomicBool>) -> (BodyGuard, Scope) {
        let delete = Scope::new();
        let g = BodyGuard::new(
            delete.child(),
            delete.clone(),
            delete.child(),
            keep_alive,
            discard,
            Some(ReadyHook::new(move || fired.store(true, Ordering::SeqCst))),
            EventLog::disabled(),
        );
        (g, delete)
    }

    #[tokio::test]
    async fn test_empty_body_releases_immediately() {
        let fired = Arc::new(AtomicBool::new(false));
        let (g, delete) = guard(true, true, fired.clone());
        let body_scope = g.body.clone();
        let mut body = Body::new(BodyInner::Empty, g, None);
        assert!(body.is_finished());
        assert!(body_scope.is_cancelled());
        assert!(fired.load(Ordering::SeqCst));
        assert!(!delete.is_cancelled());
        assert!(body.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_h3_body_streams_then_releases() {
        let fired = Arc::new(AtomicBool::new(false));
        let (g, _delete) = guard(true, false, fired.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Ok(Bytes::from_static(b"ab"))).unwrap();
        tx.send(Ok(Bytes::from_static(b"cd"))).unwrap();
        drop(tx);
        let body = Body::new(BodyInner::H3(rx), g, None);
        assert_eq!(body.bytes().await.unwrap(), "abcd");
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_h1_body_discards_connection() {
        let fired = Arc::new(AtomicBool::new(false));
        let (g, delete) = guard(true, true, fired.clone());
        let (_tx, rx) = mpsc::unbounded_channel::<Result<Bytes>>();
        drop(Body::new(BodyInner::H3(rx), g, None));
        assert!(delete.is_cancelled());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_not_keep_alive_closes_gracefully() {
        let fired = Arc::new(AtomicBool::new(false));
        let (g, delete) = guard(false, true, fired.clone());
        let close = g.close.clone();
        let _body = Body::new(BodyInner::Empty, g, None);
        assert!(close.is_cancelled());
        assert!(!delete.is_cancelled());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_force_close_interrupts_body() {
        let fired = Arc::new(AtomicBool::new(false));
        let (g, delete) = guard(true, false, fired);
        let (_tx, rx) = mpsc::unbounded_channel::<Result<Bytes>>();
        let mut body = Body::new(BodyInner::H3(rx), g, None);
        delete.cancel(Error::ForceClosed);
        let err = body.chunk().await.unwrap_err();
        assert!(err.is_force_closed());
    }
}
