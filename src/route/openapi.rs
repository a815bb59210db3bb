// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};

use crate::route::manager::RouteManager;

impl RouteManager {
    /// Emits an OpenAPI 3.0.0 document for every registered route.
    ///
    /// Paths are keyed by the full pattern (base path resolved, `{name}`
    /// placeholders kept); the tag list is deduplicated and sorted.
    pub fn openapi_spec(&self) -> Value {
        let mut info = Map::new();
        info.insert(
            "title".to_string(),
            json!(if self.title.is_empty() { "API" } else { &self.title }),
        );
        info.insert(
            "version".to_string(),
            json!(if self.version.is_empty() {
                "0.0.0"
            } else {
                &self.version
            }),
        );
        if !self.description.is_empty() {
            info.insert("description".to_string(), json!(self.description));
        }

        let mut tags: BTreeSet<&str> = BTreeSet::new();
        let mut paths = Map::new();
        for route in &self.routes {
            let key = format!("{}{}", self.base_path, route.pattern);
            let entry = paths
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()));
            let Some(operations) = entry.as_object_mut() else {
                continue;
            };
            operations.insert(
                route.method.to_ascii_lowercase(),
                operation_object(route),
            );
            for tag in &route.meta.tags {
                tags.insert(tag);
            }
        }

        let mut doc = Map::new();
        doc.insert("openapi".to_string(), json!("3.0.0"));
        doc.insert("info".to_string(), Value::Object(info));
        if !self.servers.is_empty() {
            doc.insert(
                "servers".to_string(),
                Value::Array(
                    self.servers
                        .iter()
                        .map(|url| json!({ "url": url }))
                        .collect(),
                ),
            );
        }
        if !tags.is_empty() {
            doc.insert(
                "tags".to_string(),
                Value::Array(
                    tags.iter().map(|t| json!({ "name": t })).collect(),
                ),
            );
        }
        doc.insert("paths".to_string(), Value::Object(paths));
        Value::Object(doc)
    }

    /// The same document rendered as YAML. The serializer quotes YAML
    /// reserved words and numeric-looking strings so they survive a
    /// round trip as strings.
    pub fn openapi_yaml(&self) -> String {
        serde_yaml::to_string(&self.openapi_spec()).unwrap_or_default()
    }
}

fn operation_object(route: &crate::route::manager::Route) -> Value {
    let meta = &route.meta;
    let mut op = Map::new();
    if !meta.summary.is_empty() {
        op.insert("summary".to_string(), json!(meta.summary));
    }
    if !meta.description.is_empty() {
        op.insert("description".to_string(), json!(meta.description));
    }
    if !meta.tags.is_empty() {
        op.insert("tags".to_string(), json!(meta.tags));
    }
    if meta.deprecated {
        op.insert("deprecated".to_string(), json!(true));
    }
    if !meta.params.is_empty() {
        op.insert(
            "parameters".to_string(),
            Value::Array(
                meta.params
                    .iter()
                    .map(|p| {
                        json!({
                            "name": p.name,
                            "in": p.location,
                            "required": p.required,
                            "schema": { "type": p.schema_type },
                        })
                    })
                    .collect(),
            ),
        );
    }
    if let Some(body) = &meta.request_body {
        op.insert(
            "requestBody".to_string(),
            json!({
                "description": body,
                "content": { "application/json": {} },
            }),
        );
    }

    let mut responses = Map::new();
    if meta.responses.is_empty() {
        responses
            .insert("200".to_string(), json!({ "description": "OK" }));
    } else {
        for (code, description) in &meta.responses {
            responses.insert(
                code.to_string(),
                json!({ "description": description }),
            );
        }
    }
    op.insert("responses".to_string(), Value::Object(responses));
    Value::Object(op)
}
