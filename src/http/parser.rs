// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::http::{Headers, request::HttpRequest};

/// Upper bound on an unparsed start-line + header block. A peer that
/// streams more than this without completing the head is cut off.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),
    #[error("malformed status line: {0:?}")]
    BadStatusLine(String),
    #[error("malformed header line: {0:?}")]
    BadHeader(String),
    #[error("invalid Content-Length: {0:?}")]
    BadContentLength(String),
    #[error("invalid chunk size: {0:?}")]
    BadChunkSize(String),
    #[error("header block exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
}

#[derive(Debug)]
enum ReqState {
    StartLine,
    Headers,
    Body { remaining: usize },
}

/// Incremental HTTP/1.1 request parser.
///
/// Feeding the wire one byte at a time produces exactly the same request
/// sequence as feeding it in one block; a single feed containing several
/// pipelined requests yields them all, in order, and retains any partial
/// tail for the next feed.
#[derive(Debug)]
pub struct HttpParser {
    buf: BytesMut,
    state: ReqState,
    current: HttpRequest,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ReqState::StartLine,
            current: HttpRequest::default(),
        }
    }

    /// Appends `data` and returns every request completed by it.
    ///
    /// A parse failure poisons the connection; the caller closes it
    /// without producing a body.
    pub fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<HttpRequest>, HttpParseError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match self.state {
                ReqState::StartLine => {
                    let Some(line) = take_line(&mut self.buf) else {
                        self.check_head_size()?;
                        break;
                    };
                    // Tolerate stray empty lines between pipelined
                    // requests (RFC 7230 §3.5).
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_request_line(&line)?;
                    self.state = ReqState::Headers;
                },
                ReqState::Headers => {
                    let Some(line) = take_line(&mut self.buf) else {
                        self.check_head_size()?;
                        break;
                    };
                    if line.is_empty() {
                        let remaining = content_length(&self.current.headers)?;
                        if remaining == 0 {
                            out.push(self.complete());
                        } else {
                            self.state = ReqState::Body { remaining };
                        }
                        continue;
                    }
                    let (name, value) = split_header(&line)?;
                    self.current.headers.add(&name, value);
                },
                ReqState::Body { remaining } => {
                    if self.buf.len() < remaining {
                        break;
                    }
                    self.current.body =
                        self.buf.split_to(remaining).to_vec();
                    out.push(self.complete());
                },
            }
        }
        Ok(out)
    }

    fn complete(&mut self) -> HttpRequest {
        self.state = ReqState::StartLine;
        std::mem::take(&mut self.current)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpParseError::BadRequestLine(line.to_string()));
        };
        if !version.starts_with("HTTP/") || method.is_empty() {
            return Err(HttpParseError::BadRequestLine(line.to_string()));
        }
        self.current.method = method.to_string();
        self.current.version = version.to_string();
        self.current.set_target(target);
        Ok(())
    }

    fn check_head_size(&self) -> Result<(), HttpParseError> {
        if self.buf.len() > MAX_HEAD_BYTES {
            return Err(HttpParseError::HeadTooLarge);
        }
        Ok(())
    }
}

// ── client side ──────────────────────────────────────────────────────────

/// A response parsed off an outbound client connection.
#[derive(Debug, Clone, Default)]
pub struct HttpClientResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

#[derive(Debug)]
enum RespState {
    StatusLine,
    Headers,
    FixedBody { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkEnd,
    Trailers,
    UntilClose,
}

/// Incremental parser for HTTP/1.1 responses on the client side.
///
/// Handles Content-Length and chunked bodies, the bodiless status codes
/// (1xx, 204, 304) and back-to-back keep-alive responses in one feed.
#[derive(Debug)]
pub struct HttpResponseParser {
    buf: BytesMut,
    state: RespState,
    current: HttpClientResponse,
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponseParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: RespState::StatusLine,
            current: HttpClientResponse::default(),
        }
    }

    pub fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<HttpClientResponse>, HttpParseError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match self.state {
                RespState::StatusLine => {
                    let Some(line) = take_line(&mut self.buf) else {
                        break;
                    };
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_status_line(&line)?;
                    self.state = RespState::Headers;
                },
                RespState::Headers => {
                    let Some(line) = take_line(&mut self.buf) else {
                        break;
                    };
                    if !line.is_empty() {
                        let (name, value) = split_header(&line)?;
                        self.current.headers.add(&name, value);
                        continue;
                    }
                    self.state = self.body_state()?;
                    if matches!(self.state, RespState::StatusLine) {
                        out.push(self.complete());
                    }
                },
                RespState::FixedBody { remaining } => {
                    if self.buf.len() < remaining {
                        break;
                    }
                    self.current.body = self.buf.split_to(remaining).to_vec();
                    out.push(self.complete());
                },
                RespState::ChunkSize => {
                    let Some(line) = take_line(&mut self.buf) else {
                        break;
                    };
                    let size_part =
                        line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_part, 16).map_err(
                        |_| HttpParseError::BadChunkSize(line.to_string()),
                    )?;
                    self.state = if size == 0 {
                        RespState::Trailers
                    } else {
                        RespState::ChunkData { remaining: size }
                    };
                },
                RespState::ChunkData { remaining } => {
                    if self.buf.len() < remaining {
                        break;
                    }
                    let chunk = self.buf.split_to(remaining);
                    self.current.body.extend_from_slice(&chunk);
                    self.state = RespState::ChunkEnd;
                },
                RespState::ChunkEnd => {
                    let Some(line) = take_line(&mut self.buf) else {
                        break;
                    };
                    if !line.is_empty() {
                        return Err(HttpParseError::BadChunkSize(line));
                    }
                    self.state = RespState::ChunkSize;
                },
                RespState::Trailers => {
                    let Some(line) = take_line(&mut self.buf) else {
                        break;
                    };
                    if line.is_empty() {
                        out.push(self.complete());
                    }
                },
                RespState::UntilClose => {
                    // Everything until EOF belongs to this body.
                    let chunk = self.buf.split();
                    self.current.body.extend_from_slice(&chunk);
                    break;
                },
            }
        }
        Ok(out)
    }

    /// Finalises a response whose body runs to connection close.
    pub fn finish_eof(&mut self) -> Option<HttpClientResponse> {
        if matches!(self.state, RespState::UntilClose) {
            Some(self.complete())
        } else {
            None
        }
    }

    fn complete(&mut self) -> HttpClientResponse {
        self.state = RespState::StatusLine;
        std::mem::take(&mut self.current)
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(HttpParseError::BadStatusLine(line.to_string()));
        };
        if !version.starts_with("HTTP/") {
            return Err(HttpParseError::BadStatusLine(line.to_string()));
        }
        let status: u16 = code
            .parse()
            .map_err(|_| HttpParseError::BadStatusLine(line.to_string()))?;
        self.current.version = version.to_string();
        self.current.status = status;
        self.current.reason = parts.next().unwrap_or("").to_string();
        Ok(())
    }

    fn body_state(&self) -> Result<RespState, HttpParseError> {
        let status = self.current.status;
        if status < 200 || status == 204 || status == 304 {
            return Ok(RespState::StatusLine);
        }
        if self
            .current
            .headers
            .get("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return Ok(RespState::ChunkSize);
        }
        match self.current.headers.get("Content-Length") {
            Some(_) => {
                let remaining = content_length(&self.current.headers)?;
                if remaining == 0 {
                    Ok(RespState::StatusLine)
                } else {
                    Ok(RespState::FixedBody { remaining })
                }
            },
            None => Ok(RespState::UntilClose),
        }
    }
}

// ── shared line helpers ──────────────────────────────────────────────────

/// Takes one line off the buffer, accepting both CRLF and bare LF.
fn take_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn split_header(line: &str) -> Result<(String, String), HttpParseError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| HttpParseError::BadHeader(line.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HttpParseError::BadHeader(line.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn content_length(headers: &Headers) -> Result<usize, HttpParseError> {
    match headers.get("Content-Length") {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| HttpParseError::BadContentLength(v.to_string())),
        None => Ok(0),
    }
}
