// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail, ensure};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngExt;
use tracing::{debug, trace};

use crate::{
    http::{conn::HttpConnection, request::HttpRequest},
    net::conn::{ReadOutcome, TcpConnection},
    ws::frame::{
        Opcode, WsMessage, WsParser, build_close_payload, build_frame,
        ws_accept_key,
    },
};

/// Which side of the handshake this connection plays. Servers emit
/// unmasked frames; clients mask every frame with a fresh random key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    Server,
    Client,
}

/// True iff the request is a well-formed RFC 6455 upgrade: GET with
/// `Upgrade: websocket`, `Connection: … upgrade …` and a key.
pub fn is_ws_upgrade(req: &HttpRequest) -> bool {
    if !req.method.eq_ignore_ascii_case("GET") {
        return false;
    }
    let upgrade = req.header("Upgrade").unwrap_or("");
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return false;
    }
    let connection = req.header("Connection").unwrap_or("");
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return false;
    }
    req.header("Sec-WebSocket-Key").is_some()
}

/// Answers the handshake with a 101 and rebinds the socket as a
/// WebSocket connection. The HTTP connection is consumed; its parser
/// state is discarded.
pub fn ws_upgrade(
    http: HttpConnection,
    req: &HttpRequest,
) -> Result<WsConnection> {
    ensure!(is_ws_upgrade(req), "not a websocket upgrade request");
    let key = req
        .header("Sec-WebSocket-Key")
        .context("missing Sec-WebSocket-Key")?;
    let accept = ws_accept_key(key);

    let mut conn = http.into_tcp();
    let reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    conn.write(reply.as_bytes())?;
    debug!(peer = %conn.peer_ip(), "websocket upgrade");
    Ok(WsConnection::new(conn, WsRole::Server))
}

/// A WebSocket connection over the framework's non-blocking socket.
#[derive(Debug)]
pub struct WsConnection {
    conn: TcpConnection,
    parser: WsParser,
    role: WsRole,
    close_sent: bool,
}

impl WsConnection {
    pub fn new(conn: TcpConnection, role: WsRole) -> Self {
        Self { conn, parser: WsParser::new(), role, close_sent: false }
    }

    pub fn conn(&self) -> &TcpConnection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut TcpConnection {
        &mut self.conn
    }

    pub fn role(&self) -> WsRole {
        self.role
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Binary, payload)
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Ping, payload)
    }

    pub fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Pong, payload)
    }

    /// Sends a CLOSE with the given status; idempotent.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        let payload = build_close_payload(code, reason);
        self.send_frame_raw(Opcode::Close, &payload)
    }

    fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if self.close_sent {
            bail!("close already sent");
        }
        self.send_frame_raw(opcode, payload)
    }

    fn send_frame_raw(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mask = match self.role {
            WsRole::Server => None,
            WsRole::Client => {
                let mut key = [0u8; 4];
                rand::rng().fill(&mut key);
                Some(key)
            },
        };
        let frame = build_frame(true, opcode, payload, mask);
        self.conn.write(&frame)
    }

    /// Reads and parses whatever the socket holds. PINGs are answered
    /// with a PONG echoing the payload; a CLOSE is acknowledged and the
    /// method reports the connection should terminate. Data messages are
    /// handed to `on_message`. Returns whether to keep the connection.
    pub fn on_readable(
        &mut self,
        on_message: &mut dyn FnMut(&mut WsConnection, WsMessage),
    ) -> Result<bool> {
        let mut chunk = [0u8; 8192];
        let mut messages = Vec::new();
        let mut saw_eof = false;
        loop {
            match self.conn.read(&mut chunk)? {
                ReadOutcome::Data(n) => {
                    match self.parser.feed(&chunk[..n]) {
                        Ok(batch) => messages.extend(batch),
                        Err(e) => {
                            debug!(error = %e, "websocket parse failure");
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

        for message in messages {
            match message.opcode {
                Opcode::Ping => {
                    trace!(len = message.payload.len(), "ping");
                    self.send_pong(&message.payload)?;
                },
                Opcode::Close => {
                    let code = message.close_code().unwrap_or(1000);
                    if !self.close_sent {
                        self.send_close(code, "")?;
                    }
                    return Ok(false);
                },
                _ => on_message(self, message),
            }
        }
        Ok(!saw_eof)
    }
}

// ── client handshake ─────────────────────────────────────────────────────

/// Random Sec-WebSocket-Key: 16 random bytes, base64.
pub fn generate_client_key() -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill(&mut nonce);
    STANDARD.encode(nonce)
}

/// The upgrade request a client writes right after connecting.
pub fn client_handshake(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Validates the server's Sec-WebSocket-Accept against the key we sent.
pub fn validate_accept(key: &str, accept: &str) -> bool {
    ws_accept_key(key) == accept
}
