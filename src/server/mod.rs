//! HTTP server glue: accept loop, connection table, module dispatch,
//! WebSocket upgrades and deferred-response unparking.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    collections::HashMap,
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, SystemTime},
};

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::{
    event::{EventLoop, Ready, TimerId},
    http::{
        conn::{Dispatch, HttpConnection},
        request::HttpRequest,
        response::{Deferred, HttpResponse},
        util::reply_error,
    },
    module::{Module, ModuleManager},
    net::{TcpConnection, TcpListener},
    ws::{
        WsConnection, WsMessage,
        conn::{is_ws_upgrade, ws_upgrade},
    },
};

type WsMsgHandler =
    Rc<RefCell<dyn FnMut(&mut EventLoop, &mut WsConnection, WsMessage)>>;

enum ClientKind {
    Http(HttpConnection),
    Ws(WsConnection),
}

struct Client {
    /// Stable identity: fds are recycled by the kernel, ids are not. A
    /// deferred completion must not land on a connection that merely
    /// inherited the fd number.
    id: u64,
    kind: ClientKind,
    /// Response written, waiting for the send buffer to drain before the
    /// socket is dropped.
    closing: bool,
}

impl Client {
    fn conn_mut(&mut self) -> &mut TcpConnection {
        match &mut self.kind {
            ClientKind::Http(http) => http.conn_mut(),
            ClientKind::Ws(ws) => ws.conn_mut(),
        }
    }

    fn is_idle(&self) -> bool {
        match &self.kind {
            ClientKind::Http(http) => !http.is_parked(),
            // Long-lived by design, but nothing is in flight between
            // messages; a drain may close them.
            ClientKind::Ws(_) => true,
        }
    }
}

struct ServerInner {
    listener: Option<TcpListener>,
    clients: HashMap<RawFd, Client>,
    next_client_id: u64,
    modules: ModuleManager,
    ws_handler: Option<WsMsgHandler>,
    heartbeat: Option<TimerId>,
    draining: bool,
}

enum HttpDrive {
    Read,
    Complete(HttpResponse),
}

/// The worker's serving fabric.
///
/// Owns the listener and every accepted connection, feeds parsed
/// requests through the [`ModuleManager`] (404 when nothing handles,
/// 500 when a handler panics), parks connections behind deferred
/// responses and upgrades WebSocket handshakes in place when a handler
/// is installed.
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<RefCell<ServerInner>>,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServer {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ServerInner {
                listener: None,
                clients: HashMap::new(),
                next_client_id: 1,
                modules: ModuleManager::new(),
                ws_handler: None,
                heartbeat: None,
                draining: false,
            })),
        }
    }

    pub fn register_module(&self, module: Box<dyn Module>) {
        self.inner.borrow_mut().modules.register(module);
    }

    pub fn module_count(&self) -> usize {
        self.inner.borrow().modules.count()
    }

    /// Installs the WebSocket message handler; with one installed, valid
    /// upgrade requests are answered with a 101 and the socket switches
    /// to frames.
    pub fn set_ws_handler<F>(&self, handler: F)
    where F: FnMut(&mut EventLoop, &mut WsConnection, WsMessage) + 'static {
        self.inner.borrow_mut().ws_handler =
            Some(Rc::new(RefCell::new(handler)));
    }

    /// Starts serving on `listener`: accept watch, module `on_start` and
    /// the ~1 Hz heartbeat tick.
    pub fn listen(
        &self,
        el: &mut EventLoop,
        listener: TcpListener,
    ) -> Result<()> {
        let fd = listener.fd();
        self.inner.borrow_mut().listener = Some(listener);
        let server = self.clone();
        el.add_io(fd, Ready::READABLE, move |el, _ready| {
            server.on_accept(el);
        })?;
        self.start_background(el);
        info!("http server started");
        Ok(())
    }

    /// Module lifecycle without a listening socket (helper processes):
    /// `on_start` plus the heartbeat tick.
    pub fn start_background(&self, el: &mut EventLoop) {
        self.inner.borrow_mut().modules.on_start();
        let server = self.clone();
        let timer = el.add_periodic(
            Duration::from_secs(1),
            Duration::from_secs(1),
            move |el| {
                let inner = &mut *server.inner.borrow_mut();
                inner.modules.heartbeat(el, SystemTime::now());
            },
        );
        self.inner.borrow_mut().heartbeat = Some(timer);
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.inner.borrow().listener.as_ref().map(TcpListener::fd)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.borrow().clients.len()
    }

    /// Stops accepting; in-flight requests keep running (TERM semantics).
    pub fn stop_accepting(&self, el: &mut EventLoop) {
        let listener = {
            let mut inner = self.inner.borrow_mut();
            inner.draining = true;
            inner.listener.take()
        };
        if let Some(listener) = listener {
            el.remove_io(listener.fd());
            debug!("listener closed, draining connections");
        }
    }

    /// Closes connections with no request in flight (QUIT semantics).
    pub fn close_idle(&self, el: &mut EventLoop) {
        let idle: Vec<RawFd> = {
            let inner = self.inner.borrow();
            inner
                .clients
                .iter()
                .filter(|(_, c)| c.is_idle())
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in idle {
            self.close_client(el, fd);
        }
    }

    /// True once draining finished and nothing is connected.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.borrow();
        inner.draining && inner.clients.is_empty()
    }

    /// Full teardown: module `on_stop`, heartbeat cancel, every socket
    /// closed. Must run before the EventLoop goes away.
    pub fn shutdown(&self, el: &mut EventLoop) {
        self.stop_accepting(el);
        let (timer, fds) = {
            let mut inner = self.inner.borrow_mut();
            inner.modules.on_stop();
            let fds: Vec<RawFd> = inner.clients.keys().copied().collect();
            (inner.heartbeat.take(), fds)
        };
        if let Some(timer) = timer {
            el.cancel_timer(timer);
        }
        for fd in fds {
            self.close_client(el, fd);
        }
        info!("http server stopped");
    }

    // ── accept path ──────────────────────────────────────────────────────

    fn on_accept(&self, el: &mut EventLoop) {
        loop {
            let accepted = {
                let inner = self.inner.borrow();
                match &inner.listener {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok(Some(conn)) => self.add_client(el, conn),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                },
            }
        }
    }

    fn add_client(&self, el: &mut EventLoop, conn: TcpConnection) {
        let fd = conn.fd();
        trace!(fd, peer = %conn.peer_ip(), "client accepted");
        {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_client_id;
            inner.next_client_id += 1;
            inner.clients.insert(
                fd,
                Client {
                    id,
                    kind: ClientKind::Http(HttpConnection::new(conn)),
                    closing: false,
                },
            );
        }
        let server = self.clone();
        if let Err(e) =
            el.add_io(fd, Ready::READABLE | Ready::HANGUP, move |el, ready| {
                server.on_client(el, fd, ready);
            })
        {
            warn!(fd, error = %e, "cannot watch client socket");
            self.inner.borrow_mut().clients.remove(&fd);
        }
    }

    // ── per-connection events ────────────────────────────────────────────

    fn on_client(&self, el: &mut EventLoop, fd: RawFd, ready: Ready) {
        if ready.intersects(Ready::READABLE | Ready::HANGUP | Ready::ERROR) {
            let route = {
                let inner = self.inner.borrow();
                match inner.clients.get(&fd) {
                    Some(client) if client.closing => None,
                    Some(client) => {
                        Some(matches!(client.kind, ClientKind::Http(_)))
                    },
                    None => return,
                }
            };
            match route {
                // Peer activity on a closing connection: give up on the
                // drain and tear it down.
                None => {
                    self.close_client(el, fd);
                    return;
                },
                Some(true) => self.drive_http(el, fd, HttpDrive::Read),
                Some(false) => self.drive_ws(el, fd),
            }
        } else if ready.contains(Ready::WRITABLE) {
            self.finish_io(el, fd, true);
        }
    }

    fn drive_http(&self, el: &mut EventLoop, fd: RawFd, mode: HttpDrive) {
        let mut deferred: Vec<Deferred> = Vec::new();
        let mut upgraded: Option<HttpRequest> = None;
        let mut keep = true;
        let mut client_id = 0;
        {
            let inner = &mut *self.inner.borrow_mut();
            let ServerInner { clients, modules, ws_handler, .. } = inner;
            let Some(client) = clients.get_mut(&fd) else {
                return;
            };
            client_id = client.id;
            let ClientKind::Http(http) = &mut client.kind else {
                return;
            };

            let has_ws = ws_handler.is_some();
            let deferred = &mut deferred;
            let mut dispatch =
                |req: &HttpRequest, resp: &mut HttpResponse| -> Dispatch {
                    if has_ws && is_ws_upgrade(req) {
                        return Dispatch::Upgrade;
                    }
                    if !modules.execute(el, req, resp) {
                        reply_error(resp, 404, "Not Found");
                        return Dispatch::Handled;
                    }
                    if resp.is_deferred() {
                        if let Some(handle) = resp.take_handle() {
                            deferred.push(handle);
                        }
                        return Dispatch::Deferred;
                    }
                    Dispatch::Handled
                };

            let result = match mode {
                HttpDrive::Read => http.on_readable(&mut dispatch),
                HttpDrive::Complete(mut resp) => {
                    match http.complete_deferred(&mut resp) {
                        Ok(true) => http.pump(&mut dispatch),
                        other => other,
                    }
                },
            };
            match result {
                Ok(k) => keep = k,
                Err(e) => {
                    warn!(fd, error = %e, "client i/o failed");
                    keep = false;
                },
            }
            if keep {
                upgraded = http.take_upgrade();
            }
        }

        if keep && let Some(req) = upgraded {
            self.promote_ws(el, fd, &req);
            return;
        }
        for handle in deferred {
            self.arm_deferred(el, fd, client_id, handle);
        }
        self.finish_io(el, fd, keep);
    }

    fn drive_ws(&self, el: &mut EventLoop, fd: RawFd) {
        let mut keep = true;
        {
            let inner = &mut *self.inner.borrow_mut();
            let ServerInner { clients, ws_handler, .. } = inner;
            let Some(client) = clients.get_mut(&fd) else {
                return;
            };
            let ClientKind::Ws(ws) = &mut client.kind else {
                return;
            };
            let handler = ws_handler.clone();
            let result = ws.on_readable(&mut |ws, message| {
                if let Some(handler) = &handler {
                    (handler.borrow_mut())(el, ws, message);
                }
            });
            match result {
                Ok(k) => keep = k,
                Err(e) => {
                    warn!(fd, error = %e, "websocket i/o failed");
                    keep = false;
                },
            }
        }
        self.finish_io(el, fd, keep);
    }

    /// Swaps the HTTP connection for a WebSocket one on the same fd; the
    /// epoll watch stays in place and keeps routing events here.
    fn promote_ws(&self, el: &mut EventLoop, fd: RawFd, req: &HttpRequest) {
        let (id, http) = {
            let mut inner = self.inner.borrow_mut();
            match inner.clients.remove(&fd) {
                Some(Client { id, kind: ClientKind::Http(http), .. }) => {
                    (id, http)
                },
                Some(other) => {
                    inner.clients.insert(fd, other);
                    return;
                },
                None => return,
            }
        };
        match ws_upgrade(http, req) {
            Ok(ws) => {
                self.inner.borrow_mut().clients.insert(
                    fd,
                    Client { id, kind: ClientKind::Ws(ws), closing: false },
                );
                self.finish_io(el, fd, true);
            },
            Err(e) => {
                warn!(fd, error = %e, "websocket upgrade failed");
                el.remove_io(fd);
            },
        }
    }

    /// Wires a deferred handle to this connection; fires immediately when
    /// the handler already completed it. The client id guards against
    /// the fd having been recycled by a newer connection.
    fn arm_deferred(
        &self,
        el: &mut EventLoop,
        fd: RawFd,
        client_id: u64,
        handle: Deferred,
    ) {
        let server = self.clone();
        let taker = handle.clone();
        handle.install_waker(
            el,
            Box::new(move |el| {
                let still_there = server
                    .inner
                    .borrow()
                    .clients
                    .get(&fd)
                    .is_some_and(|c| c.id == client_id);
                if !still_there {
                    return;
                }
                if let Some(resp) = taker.take_response() {
                    server.drive_http(el, fd, HttpDrive::Complete(resp));
                }
            }),
        );
    }

    /// Flushes buffered output and settles the watch mask; removes the
    /// client once a closing connection has drained.
    fn finish_io(&self, el: &mut EventLoop, fd: RawFd, keep: bool) {
        let verdict = {
            let inner = &mut *self.inner.borrow_mut();
            let draining = inner.draining;
            let Some(client) = inner.clients.get_mut(&fd) else {
                return;
            };
            // While draining, a connection with nothing in flight does
            // not get to linger on keep-alive.
            if !keep || (draining && client.is_idle()) {
                client.closing = true;
            }
            let closing = client.closing;
            let conn = client.conn_mut();
            let flushed = conn.flush().unwrap_or(false);
            if closing && flushed {
                None
            } else if closing {
                Some(Ready::WRITABLE | Ready::HANGUP)
            } else {
                let mut mask = Ready::READABLE | Ready::HANGUP;
                if conn.wants_write() {
                    mask |= Ready::WRITABLE;
                }
                Some(mask)
            }
        };
        match verdict {
            None => self.close_client(el, fd),
            Some(mask) => {
                if el.watch_mask(fd).is_some_and(|m| m != mask)
                    && let Err(e) = el.modify_io(fd, mask)
                {
                    warn!(fd, error = %e, "mask update failed");
                    self.close_client(el, fd);
                }
            },
        }
    }

    fn close_client(&self, el: &mut EventLoop, fd: RawFd) {
        el.remove_io(fd);
        let removed = self.inner.borrow_mut().clients.remove(&fd);
        if removed.is_some() {
            trace!(fd, "client closed");
        }
    }
}
