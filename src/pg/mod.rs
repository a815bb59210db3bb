//! Non-blocking PostgreSQL: v3 frontend codec, connection state machine
//! and pool with LISTEN/NOTIFY fan-out.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Connection state machine.
pub mod connection;
/// Pool, query queue and notification routing.
pub mod pool;
/// Wire codec (frontend encoders, backend decoder, auth helpers).
pub mod protocol;
/// Query result rows and metadata.
pub mod result;

pub use connection::{PgConnection, PgState};
pub use pool::{PgNotification, PgPool, PgPoolConfig};
pub use protocol::PgConnInfo;
pub use result::{PgColumn, PgResult};
