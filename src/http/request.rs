// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{borrow::Cow, collections::HashMap};

use crate::http::{Headers, util::url_decode};

/// One fully parsed HTTP request.
///
/// Produced by the parser, handed to handlers by reference and discarded
/// once the response has been queued.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    /// Path component only; the query string is split off at parse time.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub version: String,
    pub headers: Headers,
    /// Query parameters, URL-decoded, in wire order.
    pub params: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Peer IP captured at accept time; filled in by the server glue.
    pub peer: String,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Host header, defaulting to localhost.
    pub fn host(&self) -> &str {
        self.header("Host").unwrap_or("localhost")
    }

    /// Origin header; empty when absent.
    pub fn origin(&self) -> &str {
        self.header("Origin").unwrap_or("")
    }

    /// X-Real-IP when a proxy supplied one, otherwise the socket peer.
    pub fn real_ip(&self) -> &str {
        self.header("X-Real-IP").unwrap_or(&self.peer)
    }

    /// X-Forwarded-Proto, defaulting to "http".
    pub fn forwarded_proto(&self) -> &str {
        self.header("X-Forwarded-Proto").unwrap_or("http")
    }

    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").unwrap_or("")
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("")
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Connection persistence per RFC 7230 §6.3: HTTP/1.1 defaults to
    /// keep-alive, HTTP/1.0 to close, both overridable by the Connection
    /// header.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").unwrap_or("");
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            connection.eq_ignore_ascii_case("keep-alive")
        } else {
            !connection.eq_ignore_ascii_case("close")
        }
    }

    /// First query parameter named `name`, URL-decoded.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Cookies from the Cookie header. Absent header yields an empty map.
    pub fn cookies(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let Some(raw) = self.header("Cookie") else {
            return out;
        };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((name, value)) => {
                    out.insert(name.trim().to_string(), value.trim().to_string());
                },
                None => {
                    out.insert(pair.to_string(), String::new());
                },
            }
        }
        out
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().remove(name)
    }

    /// Splits `target` into path and query and decodes the parameters.
    pub(crate) fn set_target(&mut self, target: &str) {
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = query.to_string();
                self.params = parse_query(query);
            },
            None => {
                self.path = target.to_string();
                self.query.clear();
                self.params.clear();
            },
        }
    }
}

/// Decodes `a=1&b=x%20y` into ordered pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(kv), String::new()),
        })
        .collect()
}
