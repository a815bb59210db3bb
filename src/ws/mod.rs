//! RFC 6455 WebSocket: frame codec, HTTP upgrade and connection driver.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Connection driver, server upgrade and client handshake.
pub mod conn;
/// Frame parsing and assembly.
pub mod frame;

pub use conn::{WsConnection, WsRole, is_ws_upgrade, ws_upgrade};
pub use frame::{Opcode, WsError, WsMessage, WsParser, ws_accept_key};
