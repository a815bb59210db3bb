// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::RefCell, rc::Rc};

use chrono::Utc;

use crate::{event::EventLoop, http::Headers};

/// The status codes this framework emits itself; handlers may set any
/// numeric code via [`HttpResponse::set_status_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HttpStatus {
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    Conflict = 409,
    PayloadTooLarge = 413,
    UpgradeRequired = 426,
    TooManyRequests = 429,
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Standard reason phrase for `code`; "Unknown" otherwise.
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// SameSite attribute for [`Cookie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Attributes composed into one Set-Cookie line.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

/// An HTTP response under assembly.
///
/// Setters chain so handlers read like the registration site:
/// `resp.set_status(HttpStatus::Ok).set_body(payload, "application/json")`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    pub headers: Headers,
    body: Vec<u8>,
    deferred: bool,
    close: bool,
    handle: Option<Deferred>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            reason: "OK".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            deferred: false,
            close: false,
            handle: None,
        }
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_status(&mut self, status: HttpStatus) -> &mut Self {
        self.set_status_code(status.code())
    }

    pub fn set_status_code(&mut self, code: u16) -> &mut Self {
        self.status = code;
        self.reason = status_text(code).to_string();
        self
    }

    /// Sets the body and its Content-Type in one step.
    pub fn set_body(
        &mut self,
        body: impl Into<Vec<u8>>,
        content_type: &str,
    ) -> &mut Self {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.set(name, value);
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.add(name, value);
        self
    }

    pub fn del_header(&mut self, name: &str) -> &mut Self {
        self.headers.del(name);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Composes one Set-Cookie line from the attribute set.
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        attrs: &Cookie,
    ) -> &mut Self {
        let mut line = format!("{name}={value}");
        if let Some(path) = &attrs.path {
            line.push_str("; Path=");
            line.push_str(path);
        }
        if let Some(domain) = &attrs.domain {
            line.push_str("; Domain=");
            line.push_str(domain);
        }
        if let Some(max_age) = attrs.max_age {
            line.push_str("; Max-Age=");
            line.push_str(&max_age.to_string());
        }
        if attrs.http_only {
            line.push_str("; HttpOnly");
        }
        if attrs.secure {
            line.push_str("; Secure");
        }
        if let Some(same_site) = attrs.same_site {
            line.push_str("; SameSite=");
            line.push_str(match same_site {
                SameSite::Strict => "Strict",
                SameSite::Lax => "Lax",
                SameSite::None => "None",
            });
        }
        self.headers.add("Set-Cookie", line);
        self
    }

    /// Location + redirect status (302 unless overridden).
    pub fn redirect(&mut self, location: &str, code: u16) -> &mut Self {
        self.set_status_code(code);
        self.headers.set("Location", location);
        self
    }

    /// Marks the body as produced asynchronously and hands back the
    /// completion handle. The connection parks until
    /// [`Deferred::complete`] supplies the real response.
    pub fn defer(&mut self) -> Deferred {
        self.deferred = true;
        self.handle
            .get_or_insert_with(Deferred::new)
            .clone()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn clear_deferred(&mut self) {
        self.deferred = false;
    }

    pub(crate) fn take_handle(&mut self) -> Option<Deferred> {
        self.handle.take()
    }

    /// Forces `Connection: close` on the wire and tells the connection to
    /// stop after this response.
    pub fn set_close(&mut self) -> &mut Self {
        self.close = true;
        self.headers.set("Connection", "close");
        self
    }

    pub fn wants_close(&self) -> bool {
        self.close
    }

    /// Resets to a fresh 200 OK with no headers and no body.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Serialises status line, headers and body. Content-Length is always
    /// emitted (zero for an empty body) unless the handler already set it.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes(),
        );
        if !self.headers.contains("Date") {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            out.extend_from_slice(format!("Date: {date}\r\n").as_bytes());
        }
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.headers.contains("Content-Length") {
            out.extend_from_slice(
                format!("Content-Length: {}\r\n", self.body.len()).as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Default)]
struct DeferredState {
    response: Option<HttpResponse>,
    waker: Option<Box<dyn FnMut(&mut EventLoop)>>,
}

/// Completion handle for a deferred response.
///
/// The handler clones this into whatever continuation produces the body
/// (typically a pool callback) and calls [`Deferred::complete`] when
/// done; the parked connection then writes the response and resumes its
/// pipeline. Completing before the connection has parked is safe: the
/// response is stored and picked up as soon as the waker is installed.
#[derive(Clone, Default)]
pub struct Deferred {
    state: Rc<RefCell<DeferredState>>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies the finished response and wakes the parked connection.
    pub fn complete(&self, el: &mut EventLoop, response: HttpResponse) {
        self.state.borrow_mut().response = Some(response);
        let waker = self.state.borrow_mut().waker.take();
        if let Some(mut waker) = waker {
            waker(el);
        }
    }

    pub(crate) fn take_response(&self) -> Option<HttpResponse> {
        self.state.borrow_mut().response.take()
    }

    /// Installs the connection-side waker; fires immediately when the
    /// handler already completed.
    pub(crate) fn install_waker(
        &self,
        el: &mut EventLoop,
        waker: Box<dyn FnMut(&mut EventLoop)>,
    ) {
        let ready = self.state.borrow().response.is_some();
        if ready {
            let mut waker = waker;
            waker(el);
        } else {
            self.state.borrow_mut().waker = Some(waker);
        }
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Deferred")
            .field("completed", &state.response.is_some())
            .field("armed", &state.waker.is_some())
            .finish()
    }
}
