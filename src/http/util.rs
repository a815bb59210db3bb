// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde_json::{Value, json};

use crate::http::{request::HttpRequest, response::HttpResponse};

/// Percent-decoding with `+` treated as space. Invalid escapes pass
/// through untouched.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            },
            b'%' => match hex_pair(bytes.get(i + 1), bytes.get(i + 2)) {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                },
                None => {
                    out.push(b'%');
                    i += 1;
                },
            },
            b => {
                out.push(b);
                i += 1;
            },
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(hi: Option<&u8>, lo: Option<&u8>) -> Option<u8> {
    let hi = (*hi? as char).to_digit(16)?;
    let lo = (*lo? as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

/// Escapes a string for embedding in a JSON document.
pub fn json_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            },
            c => out.push(c),
        }
    }
    out
}

/// Fills `resp` with the framework's JSON error body:
/// `{"error":{"code":…,"message":"…"}}`.
pub fn reply_error(resp: &mut HttpResponse, code: u16, message: &str) {
    resp.set_status_code(code).set_body(
        format!(
            "{{\"error\":{{\"code\":{code},\"message\":\"{}\"}}}}",
            json_escape(message)
        ),
        "application/json",
    );
}

/// Decodes an `application/x-www-form-urlencoded` body.
pub fn parse_form_body(body: &str) -> Vec<(String, String)> {
    crate::http::request::parse_query(body)
}

/// Interprets the request payload as JSON: a JSON body verbatim, a form
/// body as an object, and an empty body falls back to the query
/// parameters.
pub fn content_to_json(req: &HttpRequest) -> Value {
    let body = req.body_text();
    if !body.trim().is_empty() {
        if req.content_type().starts_with("application/json") {
            if let Ok(value) = serde_json::from_str(&body) {
                return value;
            }
        }
        let mut map = serde_json::Map::new();
        for (k, v) in parse_form_body(&body) {
            map.insert(k, json!(v));
        }
        return Value::Object(map);
    }
    let mut map = serde_json::Map::new();
    for (k, v) in &req.params {
        map.insert(k.clone(), json!(v));
    }
    Value::Object(map)
}

/// Matches `path` against a pattern list where a trailing `*` matches any
/// suffix. Empty patterns are skipped.
pub fn match_path(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.is_empty() {
            false
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            path.starts_with(prefix)
        } else {
            pattern == path
        }
    })
}

/// Maps the application error-code convention onto HTTP statuses:
/// 401xx family → 401, 40300 → 403, 40400 → 404, anything else → 400.
pub fn error_code_to_status(code: i64) -> u16 {
    match code {
        40100..=40199 => 401,
        40300 => 403,
        40400 => 404,
        _ => 400,
    }
}
