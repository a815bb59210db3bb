// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC 6455 framing.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| op    |M| len (7)     |  extended length (16/64)      |
//! |I|S|S|S|       |A|             |                               |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  masking key (if MASK)        |          payload …            |
//! +-------------------------------+-------------------------------+
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Handshake GUID from RFC 6455 §1.3.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Refuse frames larger than this; nothing the framework carries needs
/// more and a 63-bit length field is an invitation otherwise.
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("reserved opcode {0:#x}")]
    BadOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload exceeds 125 bytes")]
    OversizedControl,
    #[error("continuation frame without a started message")]
    StrayContinuation,
    #[error("data frame while a fragmented message is in progress")]
    InterleavedData,
    #[error("payload length {0} exceeds the {MAX_PAYLOAD} byte cap")]
    PayloadTooLarge(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    fn from_bits(bits: u8) -> Result<Self, WsError> {
        Ok(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => return Err(WsError::BadOpcode(other)),
        })
    }
}

/// A complete message: fragments already reassembled, control frames as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl WsMessage {
    /// Status code of a CLOSE payload (big-endian, RFC 6455 §5.5.1).
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Incremental frame parser with fragment reassembly.
///
/// Data messages split over CONTINUATION frames are delivered once, with
/// the opcode of the initial frame. Control frames are delivered the
/// moment they complete, even in the middle of a fragmented message.
#[derive(Debug, Default)]
pub struct WsParser {
    buf: BytesMut,
    frag_opcode: Option<Opcode>,
    frag_payload: Vec<u8>,
}

impl WsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends wire bytes and returns every message completed by them.
    /// Byte-at-a-time feeding yields the same sequence as one big feed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<WsMessage>, WsError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(message) = self.try_frame()? {
            if let Some(message) = message {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Outer `None`: need more bytes. Inner `None`: consumed a
    /// non-final fragment.
    #[allow(clippy::option_option)]
    fn try_frame(&mut self) -> Result<Option<Option<WsMessage>>, WsError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_bits(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as u64;

        let (len, header) = match len7 {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len =
                    u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64;
                (len, 4usize)
            },
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(bytes), 10usize)
            },
            n => (n, 2usize),
        };
        if len > MAX_PAYLOAD {
            return Err(WsError::PayloadTooLarge(len));
        }
        if opcode.is_control() {
            if !fin {
                return Err(WsError::FragmentedControl);
            }
            if len > 125 {
                return Err(WsError::OversizedControl);
            }
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header + mask_len + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(header);
        let mut key = [0u8; 4];
        if masked {
            key.copy_from_slice(&self.buf[..4]);
            self.buf.advance(4);
        }
        let mut payload = self.buf.split_to(len as usize).to_vec();
        if masked {
            apply_mask(&mut payload, key);
        }

        if opcode.is_control() {
            return Ok(Some(Some(WsMessage { opcode, payload })));
        }

        match (opcode, fin, self.frag_opcode) {
            // Unfragmented data frame.
            (op, true, None) if op != Opcode::Continuation => {
                Ok(Some(Some(WsMessage { opcode: op, payload })))
            },
            // First fragment.
            (op, false, None) if op != Opcode::Continuation => {
                self.frag_opcode = Some(op);
                self.frag_payload = payload;
                Ok(Some(None))
            },
            // Middle fragment.
            (Opcode::Continuation, false, Some(_)) => {
                self.frag_payload.extend_from_slice(&payload);
                Ok(Some(None))
            },
            // Final fragment: deliver with the initial opcode.
            (Opcode::Continuation, true, Some(op)) => {
                self.frag_payload.extend_from_slice(&payload);
                self.frag_opcode = None;
                Ok(Some(Some(WsMessage {
                    opcode: op,
                    payload: std::mem::take(&mut self.frag_payload),
                })))
            },
            (Opcode::Continuation, _, None) => {
                Err(WsError::StrayContinuation)
            },
            _ => Err(WsError::InterleavedData),
        }
    }
}

/// XOR (un)masking; involutive, so the same call masks and unmasks.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Assembles one frame. Servers pass `mask: None`; clients a fresh
/// random key per frame.
pub fn build_frame(
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let b0 = if fin { 0x80 } else { 0x00 } | opcode as u8;
    out.push(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, key);
            out.extend_from_slice(&masked);
        },
        None => out.extend_from_slice(payload),
    }
    out
}

/// CLOSE payload: 2-byte big-endian status code plus UTF-8 reason.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Sec-WebSocket-Accept for `key` per RFC 6455 §1.3.
pub fn ws_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}
