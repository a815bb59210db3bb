// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    event::EventLoop,
    http::{
        request::HttpRequest,
        response::{HttpResponse, HttpStatus},
    },
    module::Module,
    route::manager::RouteManager,
};

const SWAGGER_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8"/>
  <title>API documentation</title>
  <link rel="stylesheet"
        href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css"/>
</head>
<body>
<div id="swagger-ui"></div>
<script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
<script>
  window.onload = () => {
    SwaggerUIBundle({ url: "/docs/api.json", dom_id: "#swagger-ui" });
  };
</script>
</body>
</html>
"##;

/// A module built around a route table.
///
/// Besides dispatching into its [`RouteManager`], it serves the
/// documentation endpoints: `/docs` (Swagger UI), `/docs/api.json` and
/// `/docs/api.yaml`.
pub struct RoutedModule {
    name: String,
    enabled: bool,
    routes: RouteManager,
    docs_enabled: bool,
}

impl RoutedModule {
    pub fn new(name: &str, routes: RouteManager) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            routes,
            docs_enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = enabled;
        self
    }

    pub fn set_serve_docs(&mut self, enabled: bool) -> &mut Self {
        self.docs_enabled = enabled;
        self
    }

    pub fn routes(&self) -> &RouteManager {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut RouteManager {
        &mut self.routes
    }

    fn serve_docs(
        &self,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        if !self.docs_enabled || !req.method.eq_ignore_ascii_case("GET") {
            return false;
        }
        match req.path.as_str() {
            "/docs" => {
                resp.set_status(HttpStatus::Ok)
                    .set_body(SWAGGER_HTML, "text/html; charset=utf-8");
                true
            },
            "/docs/api.json" => {
                let spec = self.routes.openapi_spec();
                resp.set_status(HttpStatus::Ok).set_body(
                    serde_json::to_string_pretty(&spec)
                        .unwrap_or_default(),
                    "application/json",
                );
                true
            },
            "/docs/api.yaml" => {
                resp.set_status(HttpStatus::Ok).set_body(
                    self.routes.openapi_yaml(),
                    "application/yaml",
                );
                true
            },
            _ => false,
        }
    }
}

impl Module for RoutedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn execute(
        &mut self,
        el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        if self.serve_docs(req, resp) {
            return true;
        }
        self.routes.dispatch(el, req, resp)
    }
}
