//! Pattern-based request routing with OpenAPI emission.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Route table, matching and dispatch.
pub mod manager;
/// OpenAPI 3.0.0 document generation.
pub mod openapi;
/// A module wrapping a route table plus /docs endpoints.
pub mod routed;

pub use manager::{PathParams, RouteBuilder, RouteManager};
pub use routed::RoutedModule;
