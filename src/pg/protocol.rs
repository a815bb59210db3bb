// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PostgreSQL protocol v3, frontend side.
//!
//! Only what the framework needs: startup, the password family of
//! authentications (cleartext, md5, SCRAM-SHA-256), the simple query
//! flow and asynchronous notifications. Extended query protocol and COPY
//! are deliberately absent.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use rand::RngExt;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

const PROTOCOL_VERSION: i32 = 196608; // 3.0

#[derive(Debug, Error)]
pub enum PgProtocolError {
    #[error("truncated message (tag {tag:?}, need {need} bytes)")]
    Truncated { tag: char, need: usize },
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("unsupported authentication request {0}")]
    UnsupportedAuth(i32),
    #[error("SCRAM exchange failed: {0}")]
    Scram(String),
}

/// Connection parameters, composable from the JSON config section or the
/// standard PG* environment variables.
#[derive(Debug, Clone)]
pub struct PgConnInfo {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub application_name: String,
}

impl Default for PgConnInfo {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            application_name: "portico".to_string(),
        }
    }
}

impl PgConnInfo {
    /// Fills unset fields from PGHOST / PGPORT / PGDATABASE / PGUSER /
    /// PGPASSWORD.
    pub fn from_env() -> Self {
        let mut info = Self::default();
        if let Ok(v) = std::env::var("PGHOST") {
            info.host = v;
        }
        if let Ok(v) = std::env::var("PGPORT")
            && let Ok(port) = v.parse()
        {
            info.port = port;
        }
        if let Ok(v) = std::env::var("PGDATABASE") {
            info.dbname = v;
        }
        if let Ok(v) = std::env::var("PGUSER") {
            info.user = v;
        }
        if let Ok(v) = std::env::var("PGPASSWORD") {
            info.password = v;
        }
        info
    }
}

// ── frontend encoders ────────────────────────────────────────────────────

/// StartupMessage: no tag byte, length-prefixed key/value block.
pub fn startup_message(info: &PgConnInfo) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (key, value) in [
        ("user", info.user.as_str()),
        ("database", info.dbname.as_str()),
        ("application_name", info.application_name.as_str()),
        ("client_encoding", "UTF8"),
    ] {
        body.put_slice(key.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(&body);
    out
}

fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(tag);
    out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

/// PasswordMessage (cleartext or the md5 digest).
pub fn password_message(password: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(password.len() + 1);
    body.extend_from_slice(password.as_bytes());
    body.push(0);
    tagged(b'p', &body)
}

/// `md5` + hex(md5(hex(md5(password‖user)) ‖ salt)), the historical
/// double-hash.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut inner = Md5::new();
    inner.update(password.as_bytes());
    inner.update(user.as_bytes());
    let inner_hex = hex::encode(inner.finalize());

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    format!("md5{}", hex::encode(outer.finalize()))
}

/// SASLInitialResponse carrying the chosen mechanism and first message.
pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(mechanism.as_bytes());
    body.push(0);
    body.extend_from_slice(&(data.len() as i32).to_be_bytes());
    body.extend_from_slice(data);
    tagged(b'p', &body)
}

/// SASLResponse (continuation data only).
pub fn sasl_response(data: &[u8]) -> Vec<u8> {
    tagged(b'p', data)
}

/// Simple Query.
pub fn query_message(sql: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(sql.len() + 1);
    body.extend_from_slice(sql.as_bytes());
    body.push(0);
    tagged(b'Q', &body)
}

/// Terminate; sent on orderly shutdown.
pub fn terminate_message() -> Vec<u8> {
    tagged(b'X', &[])
}

// ── backend decoder ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PgColumnDesc {
    pub name: String,
    pub type_oid: u32,
}

/// Error/Notice field map keyed by the single-byte field codes of the
/// protocol ('S' severity, 'C' sqlstate, 'M' message, …).
#[derive(Debug, Clone, Default)]
pub struct PgErrorFields {
    fields: HashMap<u8, String>,
}

impl PgErrorFields {
    pub fn severity(&self) -> &str {
        self.fields.get(&b'S').map(String::as_str).unwrap_or("")
    }

    pub fn code(&self) -> &str {
        self.fields.get(&b'C').map(String::as_str).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        self.fields.get(&b'M').map(String::as_str).unwrap_or("")
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.get(&b'D').map(String::as_str)
    }

    pub(crate) fn insert(&mut self, code: u8, value: String) {
        self.fields.insert(code, value);
    }
}

#[derive(Debug, Clone)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { status: u8 },
    RowDescription { columns: Vec<PgColumnDesc> },
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ErrorResponse(PgErrorFields),
    NoticeResponse(PgErrorFields),
    NotificationResponse { pid: i32, channel: String, payload: String },
    /// Tags this frontend has no use for (CopyInResponse, …); skipped.
    Other { tag: u8 },
}

/// Incremental framing over backend bytes: tag byte + i32 length
/// (self-inclusive) + body.
#[derive(Debug, Default)]
pub struct BackendDecoder {
    buf: BytesMut,
}

impl BackendDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete message, or `None` when more bytes are needed.
    pub fn next_message(
        &mut self,
    ) -> Result<Option<BackendMessage>, PgProtocolError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes([
            self.buf[1],
            self.buf[2],
            self.buf[3],
            self.buf[4],
        ]);
        if len < 4 {
            return Err(PgProtocolError::Malformed("frame length"));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(5);
        let body = self.buf.split_to(len as usize - 4);
        Ok(Some(parse_message(tag, &body)?))
    }
}

fn parse_message(
    tag: u8,
    body: &[u8],
) -> Result<BackendMessage, PgProtocolError> {
    let mut cursor = body;
    Ok(match tag {
        b'R' => BackendMessage::Authentication(parse_auth(&mut cursor)?),
        b'S' => {
            let name = take_cstr(&mut cursor, "ParameterStatus")?;
            let value = take_cstr(&mut cursor, "ParameterStatus")?;
            BackendMessage::ParameterStatus { name, value }
        },
        b'K' => {
            let pid = take_i32(&mut cursor, "BackendKeyData")?;
            let secret = take_i32(&mut cursor, "BackendKeyData")?;
            BackendMessage::BackendKeyData { pid, secret }
        },
        b'Z' => {
            let status = *cursor
                .first()
                .ok_or(PgProtocolError::Malformed("ReadyForQuery"))?;
            BackendMessage::ReadyForQuery { status }
        },
        b'T' => {
            let count = take_i16(&mut cursor, "RowDescription")?;
            let mut columns = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = take_cstr(&mut cursor, "RowDescription")?;
                // table oid (4), attnum (2)
                skip(&mut cursor, 6, "RowDescription")?;
                let type_oid = take_i32(&mut cursor, "RowDescription")? as u32;
                // typlen (2), atttypmod (4), format (2)
                skip(&mut cursor, 8, "RowDescription")?;
                columns.push(PgColumnDesc { name, type_oid });
            }
            BackendMessage::RowDescription { columns }
        },
        b'D' => {
            let count = take_i16(&mut cursor, "DataRow")?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = take_i32(&mut cursor, "DataRow")?;
                if len < 0 {
                    values.push(None);
                } else {
                    let len = len as usize;
                    if cursor.len() < len {
                        return Err(PgProtocolError::Malformed("DataRow"));
                    }
                    values.push(Some(cursor[..len].to_vec()));
                    cursor = &cursor[len..];
                }
            }
            BackendMessage::DataRow { values }
        },
        b'C' => BackendMessage::CommandComplete {
            tag: take_cstr(&mut cursor, "CommandComplete")?,
        },
        b'I' => BackendMessage::EmptyQueryResponse,
        b'E' => BackendMessage::ErrorResponse(parse_fields(&mut cursor)),
        b'N' => BackendMessage::NoticeResponse(parse_fields(&mut cursor)),
        b'A' => {
            let pid = take_i32(&mut cursor, "NotificationResponse")?;
            let channel = take_cstr(&mut cursor, "NotificationResponse")?;
            let payload = take_cstr(&mut cursor, "NotificationResponse")?;
            BackendMessage::NotificationResponse { pid, channel, payload }
        },
        other => BackendMessage::Other { tag: other },
    })
}

fn parse_auth(cursor: &mut &[u8]) -> Result<AuthRequest, PgProtocolError> {
    let code = take_i32(cursor, "Authentication")?;
    Ok(match code {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            if cursor.len() < 4 {
                return Err(PgProtocolError::Malformed("AuthenticationMD5"));
            }
            let salt = [cursor[0], cursor[1], cursor[2], cursor[3]];
            AuthRequest::Md5Password { salt }
        },
        10 => {
            let mut mechanisms = Vec::new();
            while !cursor.is_empty() && cursor[0] != 0 {
                mechanisms.push(take_cstr(cursor, "AuthenticationSASL")?);
            }
            AuthRequest::Sasl { mechanisms }
        },
        11 => AuthRequest::SaslContinue { data: cursor.to_vec() },
        12 => AuthRequest::SaslFinal { data: cursor.to_vec() },
        other => return Err(PgProtocolError::UnsupportedAuth(other)),
    })
}

fn parse_fields(cursor: &mut &[u8]) -> PgErrorFields {
    let mut fields = PgErrorFields::default();
    while let Some(&code) = cursor.first() {
        if code == 0 {
            break;
        }
        *cursor = &cursor[1..];
        if let Ok(value) = take_cstr(cursor, "fields") {
            fields.fields.insert(code, value);
        } else {
            break;
        }
    }
    fields
}

fn take_cstr(
    cursor: &mut &[u8],
    what: &'static str,
) -> Result<String, PgProtocolError> {
    let pos = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or(PgProtocolError::Malformed(what))?;
    let value = String::from_utf8_lossy(&cursor[..pos]).into_owned();
    *cursor = &cursor[pos + 1..];
    Ok(value)
}

fn take_i32(
    cursor: &mut &[u8],
    what: &'static str,
) -> Result<i32, PgProtocolError> {
    if cursor.len() < 4 {
        return Err(PgProtocolError::Malformed(what));
    }
    let value =
        i32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
    *cursor = &cursor[4..];
    Ok(value)
}

fn take_i16(
    cursor: &mut &[u8],
    what: &'static str,
) -> Result<i16, PgProtocolError> {
    if cursor.len() < 2 {
        return Err(PgProtocolError::Malformed(what));
    }
    let value = i16::from_be_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Ok(value)
}

fn skip(
    cursor: &mut &[u8],
    n: usize,
    what: &'static str,
) -> Result<(), PgProtocolError> {
    if cursor.len() < n {
        return Err(PgProtocolError::Malformed(what));
    }
    *cursor = &cursor[n..];
    Ok(())
}

// ── SCRAM-SHA-256 (RFC 5802 / RFC 7677) ─────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM-SHA-256 exchange.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
    auth_message: String,
    server_signature: Vec<u8>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill(&mut raw);
        Self::with_nonce(password, &STANDARD.encode(raw))
    }

    /// Deterministic nonce; exists for protocol tests and vectors.
    pub fn with_nonce(password: &str, nonce: &str) -> Self {
        let client_first_bare = format!("n=,r={nonce}");
        Self {
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare,
            auth_message: String::new(),
            server_signature: Vec::new(),
        }
    }

    /// `n,,n=,r=<nonce>`: GS2 header without channel binding.
    pub fn first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consumes the server-first message, returns the client-final one.
    pub fn continue_exchange(
        &mut self,
        server_first: &[u8],
    ) -> Result<Vec<u8>, PgProtocolError> {
        let text = String::from_utf8_lossy(server_first).into_owned();
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in text.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                server_nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = STANDARD.decode(v).ok();
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }
        let server_nonce = server_nonce
            .ok_or_else(|| PgProtocolError::Scram("missing r=".into()))?;
        let salt = salt
            .ok_or_else(|| PgProtocolError::Scram("missing/bad s=".into()))?;
        let iterations = iterations
            .ok_or_else(|| PgProtocolError::Scram("missing i=".into()))?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(PgProtocolError::Scram(
                "server nonce does not extend ours".into(),
            ));
        }

        let salted = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let client_final_bare = format!("c=biws,r={server_nonce}");
        self.auth_message = format!(
            "{},{},{}",
            self.client_first_bare, text, client_final_bare
        );

        let client_signature =
            hmac(&stored_key, self.auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key");
        self.server_signature =
            hmac(&server_key, self.auth_message.as_bytes());

        Ok(format!("{client_final_bare},p={}", STANDARD.encode(proof))
            .into_bytes())
    }

    /// Checks the `v=` signature of the server-final message.
    pub fn verify_final(
        &self,
        server_final: &[u8],
    ) -> Result<(), PgProtocolError> {
        let text = String::from_utf8_lossy(server_final);
        let signature = text
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| PgProtocolError::Scram("missing v=".into()))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|_| PgProtocolError::Scram("bad v= base64".into()))?;
        if signature != self.server_signature {
            return Err(PgProtocolError::Scram(
                "server signature mismatch".into(),
            ));
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `Hi()` from RFC 5802: PBKDF2-HMAC-SHA-256 with a single block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}
