//! Request descriptor handed to the transport.

use std::fmt;
use std::io::SeekFrom;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use url::Url;

use crate::address::Address;
use crate::error::Result;
use crate::timeouts::Timeouts;
use crate::version::HttpVersion;

/// Read size for streamed request bodies.
const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// A body reader that can be rewound for a retry.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

enum BodyKind {
    Empty,
    Bytes(Bytes),
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        len: Option<u64>,
    },
    Seekable {
        reader: Box<dyn SeekableRead>,
        len: Option<u64>,
    },
}

/// Request body. Tracks how much of it has been handed out so the retry
/// logic knows whether it can be replayed.
pub struct RequestBody {
    kind: BodyKind,
    consumed: u64,
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            consumed: 0,
        }
    }

    /// One-shot reader. Can only be retried if no byte was read from it.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, len: Option<u64>) -> Self {
        Self {
            kind: BodyKind::Stream {
                reader: Box::new(reader),
                len,
            },
            consumed: 0,
        }
    }

    /// Reader that is seeked back to the start before each retry.
    pub fn seekable(reader: impl SeekableRead + 'static, len: Option<u64>) -> Self {
        Self {
            kind: BodyKind::Seekable {
                reader: Box::new(reader),
                len,
            },
            consumed: 0,
        }
    }

    /// Length if known up front. `None` means chunked framing on HTTP/1.1.
    pub fn len(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Empty => Some(0),
            BodyKind::Bytes(b) => Some(b.len() as u64),
            BodyKind::Stream { len, .. } | BodyKind::Seekable { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Bytes handed out since the last rewind.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Next piece of the body, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let chunk = match &mut self.kind {
            BodyKind::Empty => None,
            BodyKind::Bytes(b) => {
                if self.consumed > 0 || b.is_empty() {
                    None
                } else {
                    Some(b.clone())
                }
            }
            BodyKind::Stream { reader, .. } => read_chunk(reader).await?,
            BodyKind::Seekable { reader, .. } => read_chunk(reader).await?,
        };
        if let Some(c) = &chunk {
            self.consumed += c.len() as u64;
        }
        Ok(chunk)
    }

    /// Collect whatever is left into one buffer.
    pub async fn collect(&mut self) -> Result<Bytes> {
        if let BodyKind::Bytes(b) = &self.kind {
            if self.consumed == 0 {
                self.consumed = b.len() as u64;
                return Ok(b.clone());
            }
        }
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Make the body readable from the start again. Returns false when that
    /// is impossible, which rules out a retry.
    pub async fn rewind(&mut self) -> bool {
        if self.consumed == 0 {
            return true;
        }
        let ok = match &mut self.kind {
            BodyKind::Empty | BodyKind::Bytes(_) => true,
            BodyKind::Stream { .. } => false,
            BodyKind::Seekable { reader, .. } => reader.seek(SeekFrom::Start(0)).await.is_ok(),
        };
        if ok {
            self.consumed = 0;
        }
        ok
    }
}

async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut buf = BytesMut::with_capacity(BODY_CHUNK_SIZE);
    let n = reader.read_buf(&mut buf).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self {
            kind: BodyKind::Bytes(b),
            consumed: 0,
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Bytes(_) => "bytes",
            BodyKind::Stream { .. } => "stream",
            BodyKind::Seekable { .. } => "seekable",
        };
        f.debug_struct("RequestBody")
            .field("kind", &kind)
            .field("len", &self.len())
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// A fully resolved request: what to send, where, and through which proxies.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: RequestBody,
    pub(crate) proxies: Option<Vec<Address>>,
    pub(crate) timeouts: Option<Timeouts>,
    pub(crate) version: Option<HttpVersion>,
    pub(crate) log_id: Option<String>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: RequestBody::empty(),
            proxies: None,
            timeouts: None,
            version: None,
            log_id: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Vec<(String, String)> {
        &mut self.headers
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }
}

/// The immutable part of a request shared with protocol executors.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Origin-form request target.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// Host header value; the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or("");
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_bytes_body_rewinds() {
        let mut body = RequestBody::from("hello");
        assert_eq!(body.chunk().await.unwrap().unwrap(), "hello");
        assert!(body.chunk().await.unwrap().is_none());
        assert!(body.rewind().await);
        assert_eq!(body.collect().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_consumed_stream_cannot_rewind() {
        let mut body = RequestBody::stream(Cursor::new(b"abc".to_vec()), None);
        assert!(body.rewind().await, "untouched stream is still replayable");
        body.chunk().await.unwrap();
        assert!(!body.rewind().await);
    }

    #[tokio::test]
    async fn test_seekable_rewinds() {
        let mut body = RequestBody::seekable(Cursor::new(b"payload".to_vec()), Some(7));
        assert_eq!(body.collect().await.unwrap(), "payload");
        assert!(body.rewind().await);
        assert_eq!(body.consumed(), 0);
        assert_eq!(body.collect().await.unwrap(), "payload");
    }

    #[test]
    fn test_head_rendering() {
        let head = RequestHead {
            method: Method::POST,
            url: Url::parse("http://example.com:8080/a/b?x=1").unwrap(),
            headers: vec![],
        };
        assert_eq!(head.path_and_query(), "/a/b?x=1");
        assert_eq!(head.host_header(), "example.com:8080");
        assert!(!head.is_idempotent());

        let head = RequestHead {
            method: Method::GET,
            url: Url::parse("https://example.com/").unwrap(),
            headers: vec![],
        };
        assert_eq!(head.host_header(), "example.com");
        assert!(head.is_idempotent());
    }
}
