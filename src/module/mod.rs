//! Pluggable request handlers and their lifecycle.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{panic::AssertUnwindSafe, time::SystemTime};

use tracing::{debug, error};

use crate::{
    event::EventLoop,
    http::{request::HttpRequest, response::HttpResponse, util::reply_error},
};

/// A request handler plugged into the worker's dispatch chain.
///
/// `execute` returns true when the module handled the request: either
/// by filling the response or by deferring it (`resp.defer()`), in which
/// case the connection parks until the module completes it later. The
/// EventLoop is passed explicitly so handlers can start asynchronous
/// work (pool queries, timers) without any global state.
pub trait Module {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn execute(
        &mut self,
        el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool;

    /// Called once when the worker starts serving.
    fn on_start(&mut self) {}

    /// Called once when the worker stops.
    fn on_stop(&mut self) {}

    /// Called roughly once a second while the worker runs.
    fn heartbeat(&mut self, _el: &mut EventLoop, _now: SystemTime) {}
}

/// Insertion-ordered module chain.
///
/// Dispatch walks enabled modules in registration order and stops at the
/// first one that handles the request; when none does, the HTTP layer
/// answers 404. A panicking handler is caught here and converted into
/// the framework's JSON 500.
#[derive(Default)]
pub struct ModuleManager {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        debug!(module = module.name(), "module registered");
        self.modules.push(module);
    }

    pub fn count(&self) -> usize {
        self.modules.len()
    }

    /// First-handled-wins dispatch across enabled modules.
    pub fn execute(
        &mut self,
        el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        for module in &mut self.modules {
            if !module.enabled() {
                continue;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                module.execute(el, req, resp)
            }));
            match outcome {
                Ok(true) => return true,
                Ok(false) => {},
                Err(payload) => {
                    let message = panic_message(&payload);
                    error!(module = module.name(), message,
                           "handler panicked");
                    resp.clear();
                    reply_error(resp, 500, "internal server error");
                    return true;
                },
            }
        }
        false
    }

    pub fn on_start(&mut self) {
        for module in &mut self.modules {
            if module.enabled() {
                module.on_start();
            }
        }
    }

    pub fn on_stop(&mut self) {
        for module in &mut self.modules {
            if module.enabled() {
                module.on_stop();
            }
        }
    }

    /// One tick for every enabled module.
    pub fn heartbeat(&mut self, el: &mut EventLoop, now: SystemTime) {
        for module in &mut self.modules {
            if module.enabled() {
                module.heartbeat(el, now);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
