// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::{
    event::EventLoop,
    http::{
        request::HttpRequest,
        response::{HttpResponse, HttpStatus},
    },
};

/// Values captured from `{name}` pattern segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    params: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Captured value; empty for unknown names.
    pub fn get(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

pub type RouteHandler = Box<
    dyn FnMut(&mut EventLoop, &HttpRequest, &mut HttpResponse, &PathParams),
>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// Trailing `*`: one or more remaining segments.
    Wildcard,
}

/// OpenAPI metadata attached through the fluent builder.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouteMeta {
    pub summary: String,
    pub description: String,
    pub tags: Vec<String>,
    pub params: Vec<ParamMeta>,
    pub request_body: Option<String>,
    pub responses: Vec<(u16, String)>,
    pub deprecated: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ParamMeta {
    pub name: String,
    pub location: String,
    pub schema_type: String,
    pub required: bool,
}

pub(crate) struct Route {
    pub method: String,
    pub pattern: String,
    segments: Vec<Segment>,
    handler: RouteHandler,
    pub meta: RouteMeta,
}

/// Match ranking: exact beats parametric beats wildcard; within a rank
/// the longer literal prefix wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    rank: u8,
    neg_literal_prefix: i32,
}

/// Route table with pattern matching, 405/OPTIONS handling and OpenAPI
/// emission.
#[derive(Default)]
pub struct RouteManager {
    pub(crate) routes: Vec<Route>,
    pub(crate) base_path: String,
    pub(crate) title: String,
    pub(crate) version: String,
    pub(crate) description: String,
    pub(crate) servers: Vec<String>,
}

impl RouteManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix applied to every pattern at dispatch and in the OpenAPI
    /// paths.
    pub fn set_base_path(&mut self, base_path: &str) -> &mut Self {
        self.base_path = base_path.trim_end_matches('/').to_string();
        self
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// API title/version for the OpenAPI info block.
    pub fn set_info(&mut self, title: &str, version: &str) -> &mut Self {
        self.title = title.to_string();
        self.version = version.to_string();
        self
    }

    pub fn set_description(&mut self, description: &str) -> &mut Self {
        self.description = description.to_string();
        self
    }

    pub fn add_server(&mut self, url: &str) -> &mut Self {
        self.servers.push(url.to_string());
        self
    }

    /// Registers a handler; the returned builder attaches OpenAPI
    /// metadata fluently.
    pub fn add_route<F>(
        &mut self,
        method: &str,
        pattern: &str,
        handler: F,
    ) -> RouteBuilder<'_>
    where
        F: FnMut(&mut EventLoop, &HttpRequest, &mut HttpResponse, &PathParams)
            + 'static,
    {
        let segments = parse_pattern(pattern);
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            pattern: pattern.to_string(),
            segments,
            handler: Box::new(handler),
            meta: RouteMeta::default(),
        });
        let index = self.routes.len() - 1;
        RouteBuilder { manager: self, index }
    }

    /// True when any method is registered for a matching pattern.
    pub fn has_route(&self, path: &str) -> bool {
        let path = normalize(path);
        let segments = split_path(&path);
        self.routes.iter().any(|route| {
            self.match_route(route, &segments).is_some()
        })
    }

    /// Routes the request. Returns false only when no pattern matches
    /// the path; a method mismatch answers 405 with an Allow list and
    /// OPTIONS answers 204, both counting as handled.
    pub fn dispatch(
        &mut self,
        el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        let path = normalize(&req.path);
        let segments = split_path(&path);

        let mut best: Option<(usize, Specificity, PathParams)> = None;
        let mut allowed: BTreeSet<String> = BTreeSet::new();

        for (index, route) in self.routes.iter().enumerate() {
            let Some((specificity, params)) =
                self.match_route(route, &segments)
            else {
                continue;
            };
            allowed.insert(route.method.clone());
            if route.method != req.method.to_ascii_uppercase() {
                continue;
            }
            let better = match &best {
                Some((_, current, _)) => specificity < *current,
                None => true,
            };
            if better {
                best = Some((index, specificity, params));
            }
        }

        if let Some((index, _, params)) = best {
            trace!(method = %req.method, path = %req.path,
                   pattern = %self.routes[index].pattern, "route matched");
            (self.routes[index].handler)(el, req, resp, &params);
            return true;
        }

        if allowed.is_empty() {
            return false;
        }

        allowed.insert("OPTIONS".to_string());
        let allow = allowed.iter().cloned().collect::<Vec<_>>().join(", ");
        if req.method.eq_ignore_ascii_case("OPTIONS") {
            resp.set_status(HttpStatus::NoContent)
                .set_header("Allow", &allow);
        } else {
            resp.set_status(HttpStatus::MethodNotAllowed)
                .set_header("Allow", &allow);
        }
        true
    }

    fn match_route(
        &self,
        route: &Route,
        path_segments: &[String],
    ) -> Option<(Specificity, PathParams)> {
        let mut full: Vec<PatternPiece> = split_path(&self.base_path)
            .into_iter()
            .map(PatternPiece::Literal)
            .collect();
        full.extend(route.pattern_segments());

        let mut params = PathParams::new();
        let mut rank = 0u8;
        let mut literal_prefix = 0i32;
        let mut counting_prefix = true;

        let mut i = 0;
        for segment in &full {
            match segment {
                PatternPiece::Literal(lit) => {
                    if path_segments.get(i)? != lit {
                        return None;
                    }
                    if counting_prefix {
                        literal_prefix += 1;
                    }
                    i += 1;
                },
                PatternPiece::Param(name) => {
                    let value = path_segments.get(i)?;
                    params.insert(name.clone(), value.clone());
                    rank = rank.max(1);
                    counting_prefix = false;
                    i += 1;
                },
                PatternPiece::Wildcard => {
                    // One-or-more remaining segments.
                    if i >= path_segments.len() {
                        return None;
                    }
                    rank = 2;
                    counting_prefix = false;
                    i = path_segments.len();
                },
            }
        }
        if i != path_segments.len() {
            return None;
        }
        Some((
            Specificity { rank, neg_literal_prefix: -literal_prefix },
            params,
        ))
    }
}

enum PatternPiece {
    Literal(String),
    Param(String),
    Wildcard,
}

impl Route {
    fn pattern_segments(&self) -> Vec<PatternPiece> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => PatternPiece::Literal(lit.clone()),
                Segment::Param(name) => PatternPiece::Param(name.clone()),
                Segment::Wildcard => PatternPiece::Wildcard,
            })
            .collect()
    }
}

/// Fluent metadata attachment for the route just added.
pub struct RouteBuilder<'a> {
    manager: &'a mut RouteManager,
    index: usize,
}

impl RouteBuilder<'_> {
    fn meta(&mut self) -> &mut RouteMeta {
        &mut self.manager.routes[self.index].meta
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.meta().summary = summary.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.meta().description = description.to_string();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.meta().tags.push(tag.to_string());
        self
    }

    /// Declares a parameter for the OpenAPI document. `location` is one
    /// of `path`, `query`, `header`, `cookie`.
    pub fn param(
        mut self,
        name: &str,
        location: &str,
        schema_type: &str,
        required: bool,
    ) -> Self {
        self.meta().params.push(ParamMeta {
            name: name.to_string(),
            location: location.to_string(),
            schema_type: schema_type.to_string(),
            required,
        });
        self
    }

    pub fn request_body(mut self, description: &str) -> Self {
        self.meta().request_body = Some(description.to_string());
        self
    }

    pub fn response(mut self, code: u16, description: &str) -> Self {
        self.meta().responses.push((code, description.to_string()));
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.meta().deprecated = true;
        self
    }
}

/// Strips one trailing slash, keeping the root untouched.
fn normalize(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path.to_string()
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s == "*" {
                Segment::Wildcard
            } else if let Some(name) =
                s.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
            {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(s.to_string())
            }
        })
        .collect()
}
