// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::VecDeque;

use anyhow::Result;
use tracing::{debug, trace};

use crate::{
    http::{
        parser::HttpParser, request::HttpRequest, response::HttpResponse,
    },
    net::conn::{ReadOutcome, TcpConnection},
};

/// What the upstream dispatcher did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Response is complete and can be written.
    Handled,
    /// The handler will produce the response later; park the connection.
    Deferred,
    /// The request is a protocol upgrade; the owner takes the socket.
    Upgrade,
}

/// One client connection speaking HTTP.
///
/// Requests are processed strictly in arrival order. When a handler
/// defers its response, later pipelined requests stay queued until the
/// deferred response has been written.
#[derive(Debug)]
pub struct HttpConnection {
    conn: TcpConnection,
    parser: HttpParser,
    queue: VecDeque<HttpRequest>,
    parked: bool,
    parked_keep_alive: bool,
    upgrade: Option<HttpRequest>,
    peer_ip: String,
}

impl HttpConnection {
    pub fn new(conn: TcpConnection) -> Self {
        let peer_ip = conn.peer_ip();
        Self {
            conn,
            parser: HttpParser::new(),
            queue: VecDeque::new(),
            parked: false,
            parked_keep_alive: true,
            upgrade: None,
            peer_ip,
        }
    }

    pub fn conn(&self) -> &TcpConnection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut TcpConnection {
        &mut self.conn
    }

    /// Surrenders the underlying socket (WebSocket upgrade). The HTTP
    /// connection is dead afterwards.
    pub fn into_tcp(self) -> TcpConnection {
        self.conn
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// The upgrade request recorded by a [`Dispatch::Upgrade`] verdict;
    /// the owner replaces this connection with a WebSocket one.
    pub fn take_upgrade(&mut self) -> Option<HttpRequest> {
        self.upgrade.take()
    }

    /// Pulls bytes off the socket, feeds the parser and dispatches every
    /// completed request through `dispatch`. Returns whether the
    /// connection should stay open.
    pub fn on_readable(
        &mut self,
        dispatch: &mut dyn FnMut(&HttpRequest, &mut HttpResponse) -> Dispatch,
    ) -> Result<bool> {
        let mut saw_eof = false;
        let mut chunk = [0u8; 8192];
        loop {
            match self.conn.read(&mut chunk)? {
                ReadOutcome::Data(n) => {
                    match self.parser.feed(&chunk[..n]) {
                        Ok(requests) => self.queue.extend(requests),
                        Err(e) => {
                            // Parse failures close the connection with no
                            // response body.
                            debug!(peer = %self.peer_ip, error = %e,
                                   "http parse failure");
                            return Ok(false);
                        },
                    }
                },
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    saw_eof = true;
                    break;
                },
            }
        }

        let keep = self.pump(dispatch)?;
        if saw_eof {
            // Nothing more will arrive; stay open only while a deferred
            // response is still owed.
            return Ok(keep && self.parked);
        }
        Ok(keep)
    }

    /// Dispatches queued requests until one defers, requests an
    /// upgrade, or the queue drains.
    pub fn pump(
        &mut self,
        dispatch: &mut dyn FnMut(&HttpRequest, &mut HttpResponse) -> Dispatch,
    ) -> Result<bool> {
        while !self.parked && self.upgrade.is_none() {
            let Some(mut req) = self.queue.pop_front() else {
                return Ok(true);
            };
            req.peer = self.peer_ip.clone();
            let keep_alive = req.keep_alive();

            let mut resp = HttpResponse::new();
            match dispatch(&req, &mut resp) {
                Dispatch::Deferred => {
                    trace!(path = %req.path, "response deferred");
                    self.parked = true;
                    self.parked_keep_alive = keep_alive;
                },
                Dispatch::Upgrade => {
                    self.upgrade = Some(req);
                },
                Dispatch::Handled => {
                    if !self.write_response(keep_alive, &mut resp)? {
                        return Ok(false);
                    }
                },
            }
        }
        Ok(true)
    }

    /// Writes a deferred response produced earlier and unparks the
    /// pipeline. The caller resumes dispatching via
    /// [`HttpConnection::pump`].
    pub fn complete_deferred(
        &mut self,
        resp: &mut HttpResponse,
    ) -> Result<bool> {
        resp.clear_deferred();
        self.parked = false;
        let keep_alive = self.parked_keep_alive;
        self.write_response(keep_alive, resp)
    }

    /// Serialises and queues the response; returns whether the connection
    /// survives it.
    fn write_response(
        &mut self,
        keep_alive: bool,
        resp: &mut HttpResponse,
    ) -> Result<bool> {
        let keep = keep_alive && !resp.wants_close();
        if !keep && resp.header("Connection").is_none() {
            resp.set_header("Connection", "close");
        }
        self.conn.write(&resp.serialize())?;
        Ok(keep)
    }
}
