// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, net::ToSocketAddrs, os::fd::RawFd};

use anyhow::{Context, Result, bail};
use tracing::{debug, trace, warn};

use crate::{
    event::EventLoop,
    net::conn::{ReadOutcome, TcpConnection},
    pg::{
        protocol::{
            AuthRequest, BackendDecoder, BackendMessage, PgConnInfo,
            ScramClient, md5_password, password_message, query_message,
            sasl_initial_response, sasl_response, startup_message,
            terminate_message,
        },
        result::{PgColumn, PgResult},
    },
};

/// Completion continuation for one in-flight query batch.
pub type QueryCallback = Box<dyn FnOnce(&mut EventLoop, Vec<PgResult>)>;

/// An asynchronous notification delivered on the listener connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNotification {
    pub pid: i32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Busy,
    Error,
}

/// One non-blocking backend connection.
///
/// The owner (normally [`crate::pg::PgPool`]) wires the fd into the
/// EventLoop and forwards readiness: writable while connecting or while
/// output is buffered, readable always. All protocol work happens inside
/// [`PgConnection::on_readable`] /  [`PgConnection::on_writable`].
pub struct PgConnection {
    info: PgConnInfo,
    conn: Option<TcpConnection>,
    decoder: BackendDecoder,
    state: PgState,
    scram: Option<ScramClient>,
    server_params: HashMap<String, String>,
    backend_pid: i32,
    callback: Option<QueryCallback>,
    results: Vec<PgResult>,
    building: Option<(Vec<PgColumn>, Vec<Vec<Option<String>>>)>,
    notifications: Vec<PgNotification>,
}

impl PgConnection {
    pub fn new(info: PgConnInfo) -> Self {
        Self {
            info,
            conn: None,
            decoder: BackendDecoder::new(),
            state: PgState::Disconnected,
            scram: None,
            server_params: HashMap::new(),
            backend_pid: 0,
            callback: None,
            results: Vec::new(),
            building: None,
            notifications: Vec::new(),
        }
    }

    pub fn state(&self) -> PgState {
        self.state
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(TcpConnection::fd)
    }

    pub fn wants_write(&self) -> bool {
        self.conn.as_ref().is_some_and(TcpConnection::wants_write)
    }

    /// Starts the non-blocking connect; the fd must then be watched for
    /// writability to drive the handshake forward.
    pub fn start_connect(&mut self) -> Result<RawFd> {
        let target = format!("{}:{}", self.info.host, self.info.port);
        let addr = target
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {target}"))?
            .next()
            .with_context(|| format!("no address for {target}"))?;
        let conn = TcpConnection::connect(addr)?;
        let fd = conn.fd();
        self.conn = Some(conn);
        self.decoder = BackendDecoder::new();
        self.state = PgState::Connecting;
        trace!(fd, host = %self.info.host, "pg connect started");
        Ok(fd)
    }

    /// Drives the connect to completion and flushes buffered output.
    pub fn on_writable(&mut self) -> Result<()> {
        if self.state == PgState::Connecting {
            let startup = startup_message(&self.info);
            let Some(conn) = self.conn.as_mut() else {
                return Ok(());
            };
            if let Err(e) = conn.finish_connect() {
                self.state = PgState::Error;
                return Err(e);
            }
            conn.write(&startup)?;
            self.state = PgState::Authenticating;
            debug!(user = %self.info.user, db = %self.info.dbname,
                   "pg startup sent");
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.flush()?;
        }
        Ok(())
    }

    /// Consumes socket input and runs the protocol. Returns a completed
    /// query (callback plus its ordered result list) when ReadyForQuery
    /// closed the current batch.
    pub fn on_readable(
        &mut self,
    ) -> Result<Option<(QueryCallback, Vec<PgResult>)>> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let Some(conn) = self.conn.as_mut() else {
                bail!("pg connection is down");
            };
            match conn.read(&mut chunk) {
                Ok(ReadOutcome::Data(n)) => {
                    self.decoder.feed(&chunk[..n]);
                },
                Ok(ReadOutcome::WouldBlock) => break,
                Ok(ReadOutcome::Eof) => {
                    self.state = PgState::Error;
                    bail!("backend closed the connection");
                },
                Err(e) => {
                    self.state = PgState::Error;
                    return Err(e);
                },
            }
        }

        let mut completed = None;
        loop {
            let message = match self.decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    self.state = PgState::Error;
                    return Err(e.into());
                },
            };
            if let Some(done) = self.handle_message(message)? {
                completed = Some(done);
            }
        }
        Ok(completed)
    }

    /// Sends one simple-query batch; the connection must be Ready.
    pub fn send_query(
        &mut self,
        sql: &str,
        callback: QueryCallback,
    ) -> Result<()> {
        if self.state != PgState::Ready {
            bail!("send_query in state {:?}", self.state);
        }
        let Some(conn) = self.conn.as_mut() else {
            bail!("pg connection is down");
        };
        // Park the callback first: if the write fails, fail_inflight
        // still finds it and reports the query as failed.
        self.callback = Some(callback);
        self.results.clear();
        if let Err(e) = conn.write(&query_message(sql)) {
            self.state = PgState::Error;
            return Err(e);
        }
        self.state = PgState::Busy;
        trace!(sql, "pg query sent");
        Ok(())
    }

    /// Notifications accumulated since the last drain, in backend order.
    pub fn take_notifications(&mut self) -> Vec<PgNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Fails the in-flight query (dead peer); the caller reconnects.
    pub fn fail_inflight(
        &mut self,
        message: &str,
    ) -> Option<(QueryCallback, Vec<PgResult>)> {
        self.callback
            .take()
            .map(|cb| (cb, vec![PgResult::failure(message)]))
    }

    /// Orderly teardown: best-effort Terminate, then drop the socket.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.write(&terminate_message());
            let _ = conn.flush();
        }
        self.conn = None;
        self.state = PgState::Disconnected;
        self.scram = None;
        self.building = None;
    }

    fn handle_message(
        &mut self,
        message: BackendMessage,
    ) -> Result<Option<(QueryCallback, Vec<PgResult>)>> {
        match message {
            BackendMessage::Authentication(auth) => self.handle_auth(auth)?,
            BackendMessage::ParameterStatus { name, value } => {
                self.server_params.insert(name, value);
            },
            BackendMessage::BackendKeyData { pid, .. } => {
                self.backend_pid = pid;
            },
            BackendMessage::ReadyForQuery { .. } => {
                let was_busy = self.state == PgState::Busy;
                self.state = PgState::Ready;
                if was_busy
                    && let Some(cb) = self.callback.take()
                {
                    let results = std::mem::take(&mut self.results);
                    return Ok(Some((cb, results)));
                }
            },
            BackendMessage::RowDescription { columns } => {
                let columns = columns
                    .into_iter()
                    .map(|c| PgColumn { name: c.name, type_oid: c.type_oid })
                    .collect();
                self.building = Some((columns, Vec::new()));
            },
            BackendMessage::DataRow { values } => {
                if let Some((_, rows)) = self.building.as_mut() {
                    rows.push(
                        values
                            .into_iter()
                            .map(|v| {
                                v.map(|bytes| {
                                    String::from_utf8_lossy(&bytes)
                                        .into_owned()
                                })
                            })
                            .collect(),
                    );
                }
            },
            BackendMessage::CommandComplete { tag } => {
                let result = match self.building.take() {
                    Some((columns, rows)) => {
                        PgResult::rows(columns, rows, tag)
                    },
                    None => PgResult::command(tag),
                };
                self.results.push(result);
            },
            BackendMessage::EmptyQueryResponse => {
                self.results.push(PgResult::command(String::new()));
            },
            BackendMessage::ErrorResponse(fields) => {
                if self.state == PgState::Authenticating {
                    self.state = PgState::Error;
                    bail!(
                        "authentication failed: {} ({})",
                        fields.message(),
                        fields.code()
                    );
                }
                self.building = None;
                self.results.push(PgResult::error(fields));
            },
            BackendMessage::NoticeResponse(fields) => {
                debug!(severity = fields.severity(),
                       message = fields.message(), "pg notice");
            },
            BackendMessage::NotificationResponse { pid, channel, payload } => {
                self.notifications.push(PgNotification {
                    pid,
                    channel,
                    payload,
                });
            },
            BackendMessage::Other { tag } => {
                trace!(tag, "ignoring backend message");
            },
        }
        Ok(None)
    }

    fn handle_auth(&mut self, auth: AuthRequest) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            bail!("pg connection is down");
        };
        match auth {
            AuthRequest::Ok => {},
            AuthRequest::CleartextPassword => {
                conn.write(&password_message(&self.info.password))?;
            },
            AuthRequest::Md5Password { salt } => {
                let digest = md5_password(
                    &self.info.user,
                    &self.info.password,
                    salt,
                );
                conn.write(&password_message(&digest))?;
            },
            AuthRequest::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                    self.state = PgState::Error;
                    bail!(
                        "no supported SASL mechanism in {mechanisms:?}"
                    );
                }
                let scram = ScramClient::new(&self.info.password);
                conn.write(&sasl_initial_response(
                    "SCRAM-SHA-256",
                    &scram.first_message(),
                ))?;
                self.scram = Some(scram);
            },
            AuthRequest::SaslContinue { data } => {
                let Some(scram) = self.scram.as_mut() else {
                    self.state = PgState::Error;
                    bail!("SASLContinue without an exchange in progress");
                };
                let response = scram.continue_exchange(&data)?;
                conn.write(&sasl_response(&response))?;
            },
            AuthRequest::SaslFinal { data } => {
                let Some(scram) = self.scram.take() else {
                    self.state = PgState::Error;
                    bail!("SASLFinal without an exchange in progress");
                };
                if let Err(e) = scram.verify_final(&data) {
                    warn!(error = %e, "server SCRAM signature rejected");
                }
            },
        }
        Ok(())
    }
}
