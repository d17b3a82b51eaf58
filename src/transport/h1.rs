//! HTTP/1.1 request writing and streaming response parsing.
//!
//! Requests are written straight to the connection's write half; responses
//! are parsed with httparse from the connection's drain pipe, so a body can
//! be read chunk by chunk and abandoned or force-closed at any point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::pipe::PipeReader;
use crate::request::{RequestBody, RequestHead};

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Size of a single read from the drain pipe.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Build the request line and header block.
///
/// Returns the bytes and whether the body must be sent with chunked
/// transfer-encoding. Header order is preserved; `Host` always comes first.
pub(crate) fn build_request(head: &RequestHead, body_len: Option<u64>) -> Result<(Vec<u8>, bool)> {
    let mut request = Vec::with_capacity(1024);

    // Validate header names and values per RFC 9110
    for (name, value) in &head.headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    // Request line: METHOD origin-form HTTP/1.1
    request.extend_from_slice(head.method.as_str().as_bytes());
    request.push(b' ');
    request.extend_from_slice(head.path_and_query().as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\n");

    request.extend_from_slice(b"Host: ");
    request.extend_from_slice(head.host_header().as_bytes());
    request.extend_from_slice(b"\r\n");

    let mut has_connection_header = false;
    let mut has_content_length = false;
    let mut chunked = false;
    let mut has_transfer_encoding = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection_header = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            has_transfer_encoding = true;
            chunked = value
                .split(',')
                .next_back()
                .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);
        }
        request.extend_from_slice(name.as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    if !has_connection_header {
        request.extend_from_slice(b"Connection: keep-alive\r\n");
    }

    // Per RFC 9112: MUST NOT send Content-Length when Transfer-Encoding is present
    if !has_transfer_encoding && !has_content_length {
        match body_len {
            Some(0) => {
                if matches!(head.method, Method::POST | Method::PUT | Method::PATCH) {
                    request.extend_from_slice(b"Content-Length: 0\r\n");
                }
            }
            Some(len) => {
                request.extend_from_slice(b"Content-Length: ");
                request.extend_from_slice(len.to_string().as_bytes());
                request.extend_from_slice(b"\r\n");
            }
            None => {
                request.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                chunked = true;
            }
        }
    }

    request.extend_from_slice(b"\r\n");
    Ok((request, chunked))
}

/// Write a full request: head, then the body (chunk-framed if needed).
///
/// `sent` flips as soon as any byte reaches the connection.
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    head: &RequestHead,
    body: &mut RequestBody,
    write_idle: Option<Duration>,
    sent: &AtomicBool,
) -> Result<()> {
    let (request, chunked) = build_request(head, body.len())?;
    sent.store(true, Ordering::Release);
    write_timed(writer, &request, write_idle).await?;

    while let Some(chunk) = body.chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        if chunked {
            let size_line = format!("{:x}\r\n", chunk.len());
            write_timed(writer, size_line.as_bytes(), write_idle).await?;
            write_timed(writer, &chunk, write_idle).await?;
            write_timed(writer, b"\r\n", write_idle).await?;
        } else {
            write_timed(writer, &chunk, write_idle).await?;
        }
    }
    if chunked {
        write_timed(writer, b"0\r\n\r\n", write_idle).await?;
    }

    match write_idle {
        Some(idle) => tokio::time::timeout(idle, writer.flush())
            .await
            .map_err(|_| Error::WriteIdleTimeout(idle))?,
        None => writer.flush().await,
    }
    .map_err(|e| Error::HttpProtocol(format!("Failed to flush: {}", e)))
}

async fn write_timed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    idle: Option<Duration>,
) -> Result<()> {
    let write = writer.write_all(data);
    let res = match idle {
        Some(idle) => tokio::time::timeout(idle, write)
            .await
            .map_err(|_| Error::WriteIdleTimeout(idle))?,
        None => write.await,
    };
    res.map_err(|e| Error::HttpProtocol(format!("Failed to write request: {}", e)))
}

/// Parsed status line and headers of a final response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub version: &'static str,
    pub headers: Vec<(String, String)>,
    pub framing: Framing,
    /// Whether the connection may carry another request afterwards.
    pub keep_alive: bool,
}

/// How the response body is delimited, and how far reading has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    /// Bytes still to read.
    Length(u64),
    Chunked(ChunkState),
    /// Delimited by connection close.
    Eof,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Response side of an HTTP/1.1 connection, fed from the drain pipe.
#[derive(Debug)]
pub(crate) struct H1Reader {
    pipe: PipeReader,
    buf: BytesMut,
    scratch: Vec<u8>,
}

impl H1Reader {
    pub fn new(pipe: PipeReader) -> Self {
        Self {
            pipe,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            scratch: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        let n = self.pipe.read(&mut self.scratch).await?;
        self.buf.extend_from_slice(&self.scratch[..n]);
        Ok(n)
    }

    /// Read the next final response head, skipping 1xx interim responses.
    pub async fn read_head(&mut self, method: &Method) -> Result<ResponseHead> {
        loop {
            let header_end = loop {
                if let Some(end) = find_header_end(&self.buf) {
                    break end;
                }
                if self.buf.len() >= MAX_HEADERS_SIZE {
                    return Err(Error::HttpProtocol("Response headers too large".into()));
                }
                if self.fill().await? == 0 {
                    return Err(Error::PeerClosed(
                        "connection closed before response headers".into(),
                    ));
                }
            };

            let head = parse_head(&self.buf[..header_end], method)?;
            self.buf.advance(header_end);

            // Per RFC 9112 Section 6: skip 1xx responses before the final one.
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok(head);
        }
    }

    /// Next body chunk under `framing`, `None` once the body is complete.
    pub async fn read_body_chunk(&mut self, framing: &mut Framing) -> Result<Option<Bytes>> {
        loop {
            match *framing {
                Framing::Empty | Framing::Done => return Ok(None),
                Framing::Length(0) => {
                    *framing = Framing::Done;
                    return Ok(None);
                }
                Framing::Length(remaining) => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(Error::HttpProtocol(format!(
                            "Connection closed before receiving full body ({} bytes missing)",
                            remaining
                        )));
                    }
                    let n = (self.buf.len() as u64).min(remaining) as usize;
                    *framing = Framing::Length(remaining - n as u64);
                    return Ok(Some(self.buf.split_to(n).freeze()));
                }
                Framing::Eof => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        *framing = Framing::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.buf.split().freeze()));
                }
                Framing::Chunked(ChunkState::Size) => {
                    let Some(pos) = find_crlf(&self.buf) else {
                        if self.buf.len() >= MAX_HEADERS_SIZE {
                            return Err(Error::HttpProtocol("chunk size line too long".into()));
                        }
                        self.fill_or_fail("chunk size").await?;
                        continue;
                    };
                    let (size, line_end) = find_chunk_size(&self.buf).ok_or_else(|| {
                        Error::HttpProtocol(format!(
                            "Invalid chunk size line: {:?}",
                            String::from_utf8_lossy(&self.buf[..pos])
                        ))
                    })?;
                    self.buf.advance(line_end);
                    *framing = if size == 0 {
                        Framing::Chunked(ChunkState::Trailers)
                    } else {
                        Framing::Chunked(ChunkState::Data(size as u64))
                    };
                }
                Framing::Chunked(ChunkState::Data(remaining)) => {
                    if self.buf.is_empty() {
                        self.fill_or_fail("chunk data").await?;
                    }
                    let n = (self.buf.len() as u64).min(remaining) as usize;
                    let left = remaining - n as u64;
                    *framing = if left == 0 {
                        Framing::Chunked(ChunkState::DataEnd)
                    } else {
                        Framing::Chunked(ChunkState::Data(left))
                    };
                    return Ok(Some(self.buf.split_to(n).freeze()));
                }
                Framing::Chunked(ChunkState::DataEnd) => {
                    while self.buf.len() < 2 {
                        self.fill_or_fail("chunk terminator").await?;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(Error::HttpProtocol("Missing CRLF after chunk data".into()));
                    }
                    self.buf.advance(2);
                    *framing = Framing::Chunked(ChunkState::Size);
                }
                Framing::Chunked(ChunkState::Trailers) => {
                    // Per RFC 9112 Section 7.1.2: trailer lines end with an empty line.
                    match find_crlf(&self.buf) {
                        Some(0) => {
                            self.buf.advance(2);
                            *framing = Framing::Done;
                            return Ok(None);
                        }
                        Some(pos) => self.buf.advance(pos + 2),
                        None => {
                            if self.buf.len() >= MAX_HEADERS_SIZE {
                                return Err(Error::HttpProtocol("trailer line too long".into()));
                            }
                            if self.fill().await? == 0 {
                                *framing = Framing::Done;
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn fill_or_fail(&mut self, what: &str) -> Result<()> {
        if self.fill().await? == 0 {
            return Err(Error::HttpProtocol(format!(
                "Connection closed while reading {}",
                what
            )));
        }
        Ok(())
    }
}

fn parse_head(buf: &[u8], method: &Method) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    match response
        .parse(buf)
        .map_err(|e| Error::HttpProtocol(format!("Failed to parse response: {}", e)))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(Error::HttpProtocol("Incomplete response headers".into()));
        }
    }

    let status = response
        .code
        .ok_or_else(|| Error::HttpProtocol("Missing status code".into()))?;
    let http10 = response.version == Some(0);
    let version = if http10 { "HTTP/1.0" } else { "HTTP/1.1" };

    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let connection = find_header_value(&headers, "connection").map(|v| v.to_ascii_lowercase());
    let mut keep_alive = match &connection {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => !http10,
    };

    // Per RFC 9112 Section 6.1: HEAD responses, 1xx, 204 and 304 have no body.
    let has_body = !matches!(status, 100..=199 | 204 | 304) && *method != Method::HEAD;
    let framing = if !has_body {
        Framing::Empty
    } else {
        let transfer_encoding = find_header_value(&headers, "transfer-encoding");
        let is_chunked = transfer_encoding
            .and_then(|v| v.split(',').next_back())
            .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        if is_chunked {
            Framing::Chunked(ChunkState::Size)
        } else if transfer_encoding.is_some() {
            // Non-chunked Transfer-Encoding: read until close
            keep_alive = false;
            Framing::Eof
        } else if let Some(cl) = find_header_value(&headers, "content-length") {
            match parse_content_length(cl)? {
                0 => Framing::Empty,
                n => Framing::Length(n as u64),
            }
        } else {
            keep_alive = false;
            Framing::Eof
        }
    };

    Ok(ResponseHead {
        status,
        version,
        headers,
        framing,
        keep_alive,
    })
}

/// Find the end of HTTP headers (\r\n\r\n).
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    for i in 0..buffer.len().saturating_sub(3) {
        if &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

/// Find a header value by name (case-insensitive).
pub(crate) fn find_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(hname, _)| hname.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Parse a chunk size from the buffer, returning (size, end_of_line_position).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    // Find CRLF
    for i in 0..buffer.len().saturating_sub(1) {
        if &buffer[i..i + 2] == b"\r\n" {
            // Parse hex size (may have chunk extensions after ;)
            let line = &buffer[..i];
            let size_str = String::from_utf8_lossy(line);
            let size_part = size_str.split(';').next()?;
            let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
            return Some((size, i + 2));
        }
    }
    None
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| &buffer[i..i + 2] == b"\r\n")
}

/// Validate a header name per RFC 9110 Section 5.1.
///
/// Header names must be tokens: 1*tchar where tchar excludes
/// delimiters, control characters, and whitespace.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::HttpProtocol("Empty header name".into()));
    }
    for b in name.bytes() {
        if !is_tchar(b) {
            return Err(Error::HttpProtocol(format!(
                "Invalid character in header name: {:?}",
                name
            )));
        }
    }
    Ok(())
}

/// Check if a byte is a valid token character per RFC 9110.
fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Validate a header value per RFC 9110 Section 5.5.
///
/// Header values must not contain NUL, CR, or LF (prevents header injection).
fn validate_header_value(value: &str) -> Result<()> {
    for b in value.bytes() {
        if b == 0 || b == b'\r' || b == b'\n' {
            return Err(Error::HttpProtocol(
                "Invalid character in header value (CR/LF/NUL not allowed)".into(),
            ));
        }
    }
    Ok(())
}

/// Parse and validate Content-Length header value per RFC 9112 Section 6.2.
///
/// Content-Length must be a non-negative integer. If multiple values are
/// present (comma-separated), they must all be identical.
fn parse_content_length(value: &str) -> Result<usize> {
    let parts: Vec<&str> = value.split(',').map(|s| s.trim()).collect();

    if parts.is_empty() {
        return Err(Error::HttpProtocol("Empty Content-Length".into()));
    }

    // Parse first value
    let first = parts[0]
        .parse::<usize>()
        .map_err(|_| Error::HttpProtocol(format!("Invalid Content-Length: {}", value)))?;

    // Per RFC 9112: If multiple values, they must all be identical
    for part in &parts[1..] {
        let val = part
            .parse::<usize>()
            .map_err(|_| Error::HttpProtocol(format!("Invalid Content-Length: {}", value)))?;
        if val != first {
            return Err(Error::HttpProtocol(format!(
                "Conflicting Content-Length values: {}",
                value
            )));
        }
    }

    Ok(first)
}
