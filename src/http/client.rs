// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use anyhow::Result;
use tracing::{debug, warn};

use crate::{
    event::{EventLoop, Ready, TimerId},
    http::parser::{HttpClientResponse, HttpResponseParser},
    net::conn::{ReadOutcome, TcpConnection},
};

type ResponseCallback =
    Rc<RefCell<dyn FnMut(&mut EventLoop, HttpClientResponse)>>;
type ErrorCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, String)>>;

/// Timeouts for the outbound client; zero disables the corresponding
/// timer.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub connect: Duration,
    /// Armed while a request is outstanding; re-armed on any inbound
    /// bytes.
    pub idle: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            idle: Duration::from_secs(30),
        }
    }
}

struct ClientInner {
    conn: Option<TcpConnection>,
    parser: HttpResponseParser,
    timeouts: ClientTimeouts,
    timer: Option<TimerId>,
    on_response: Option<ResponseCallback>,
    on_error: Option<ErrorCallback>,
    connected: bool,
}

/// A non-blocking HTTP/1.1 client on the same EventLoop as everything
/// else.
///
/// Connect and idle timeouts are one-shot timers: when one fires the
/// connection is torn down and the error callback runs. Responses are
/// parsed incrementally (Content-Length, chunked, bodiless statuses) and
/// delivered through the response callback in arrival order.
#[derive(Clone)]
pub struct HttpClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl HttpClient {
    pub fn new(timeouts: ClientTimeouts) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ClientInner {
                conn: None,
                parser: HttpResponseParser::new(),
                timeouts,
                timer: None,
                on_response: None,
                on_error: None,
                connected: false,
            })),
        }
    }

    pub fn on_response<F>(&self, callback: F)
    where F: FnMut(&mut EventLoop, HttpClientResponse) + 'static {
        self.inner.borrow_mut().on_response =
            Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_error<F>(&self, callback: F)
    where F: FnMut(&mut EventLoop, String) + 'static {
        self.inner.borrow_mut().on_error =
            Some(Rc::new(RefCell::new(callback)));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// Starts a non-blocking connect and arms the connect timer.
    pub fn connect(&self, el: &mut EventLoop, addr: SocketAddr) -> Result<()> {
        let conn = TcpConnection::connect(addr)?;
        let fd = conn.fd();
        let connect_timeout = {
            let mut inner = self.inner.borrow_mut();
            inner.conn = Some(conn);
            inner.parser = HttpResponseParser::new();
            inner.connected = false;
            inner.timeouts.connect
        };

        let client = self.clone();
        el.add_io(
            fd,
            Ready::READABLE | Ready::WRITABLE | Ready::HANGUP,
            move |el, ready| client.on_io(el, ready),
        )?;
        self.arm_timer(el, connect_timeout, "connect timeout");
        debug!(%addr, "http client connecting");
        Ok(())
    }

    /// Queues raw request bytes and arms the idle timer.
    pub fn send(&self, el: &mut EventLoop, request: &[u8]) -> Result<()> {
        let idle = {
            let mut inner = self.inner.borrow_mut();
            let Some(conn) = inner.conn.as_mut() else {
                anyhow::bail!("client is not connected");
            };
            conn.write(request)?;
            inner.timeouts.idle
        };
        self.arm_timer(el, idle, "idle timeout");
        self.update_mask(el);
        Ok(())
    }

    /// Drops the connection and cancels timers.
    pub fn close(&self, el: &mut EventLoop) {
        let (fd, timer) = {
            let mut inner = self.inner.borrow_mut();
            let fd = inner.conn.as_ref().map(TcpConnection::fd);
            inner.conn = None;
            inner.connected = false;
            (fd, inner.timer.take())
        };
        if let Some(fd) = fd {
            el.remove_io(fd);
        }
        if let Some(timer) = timer {
            el.cancel_timer(timer);
        }
    }

    fn arm_timer(&self, el: &mut EventLoop, delay: Duration, what: &'static str) {
        let old = self.inner.borrow_mut().timer.take();
        if let Some(old) = old {
            el.cancel_timer(old);
        }
        if delay.is_zero() {
            return;
        }
        let client = self.clone();
        let timer = el.add_timer(delay, move |el| {
            warn!(what, "http client timed out");
            client.fail(el, what.to_string());
        });
        self.inner.borrow_mut().timer = Some(timer);
    }

    fn on_io(&self, el: &mut EventLoop, ready: Ready) {
        let mut responses = Vec::new();
        let mut failure: Option<String> = None;
        let mut got_bytes = false;
        {
            let inner = &mut *self.inner.borrow_mut();
            let Some(conn) = inner.conn.as_mut() else {
                return;
            };

            if ready.contains(Ready::WRITABLE) {
                if !inner.connected {
                    match conn.finish_connect() {
                        Ok(()) => {
                            inner.connected = true;
                            debug!("http client connected");
                        },
                        Err(e) => failure = Some(e.to_string()),
                    }
                }
                if failure.is_none()
                    && let Err(e) = conn.flush()
                {
                    failure = Some(e.to_string());
                }
            }

            if failure.is_none()
                && ready.intersects(Ready::READABLE | Ready::HANGUP)
            {
                let mut chunk = [0u8; 8192];
                loop {
                    match conn.read(&mut chunk) {
                        Ok(ReadOutcome::Data(n)) => {
                            got_bytes = true;
                            match inner.parser.feed(&chunk[..n]) {
                                Ok(batch) => responses.extend(batch),
                                Err(e) => {
                                    failure = Some(e.to_string());
                                    break;
                                },
                            }
                        },
                        Ok(ReadOutcome::WouldBlock) => break,
                        Ok(ReadOutcome::Eof) => {
                            if let Some(resp) = inner.parser.finish_eof() {
                                responses.push(resp);
                            }
                            failure = Some("connection closed".to_string());
                            break;
                        },
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        },
                    }
                }
            }
        }

        let on_response = self.inner.borrow().on_response.clone();
        for response in responses {
            if let Some(cb) = &on_response {
                (cb.borrow_mut())(el, response);
            }
        }
        if got_bytes {
            let idle = self.inner.borrow().timeouts.idle;
            if self.inner.borrow().conn.is_some() && failure.is_none() {
                self.arm_timer(el, idle, "idle timeout");
            }
        }
        match failure {
            Some(message) => self.fail(el, message),
            None => self.update_mask(el),
        }
    }

    fn fail(&self, el: &mut EventLoop, message: String) {
        self.close(el);
        let on_error = self.inner.borrow().on_error.clone();
        if let Some(cb) = on_error {
            (cb.borrow_mut())(el, message);
        }
    }

    fn update_mask(&self, el: &mut EventLoop) {
        let (fd, mask) = {
            let inner = self.inner.borrow();
            let Some(conn) = inner.conn.as_ref() else {
                return;
            };
            let mut mask = Ready::READABLE | Ready::HANGUP;
            if conn.wants_write() || conn.is_connecting() {
                mask |= Ready::WRITABLE;
            }
            (conn.fd(), mask)
        };
        if el.watch_mask(fd).is_some_and(|m| m != mask)
            && let Err(e) = el.modify_io(fd, mask)
        {
            warn!(fd, error = %e, "mask update failed");
        }
    }
}

/// Serialises a minimal client request head plus body.
pub fn build_request(
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH") {
        out.extend_from_slice(
            format!("Content-Length: {}\r\n", body.len()).as_bytes(),
        );
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
