// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::RefCell, rc::Rc};

use portico::{
    http::{HttpRequest, HttpResponse},
    route::{PathParams, RouteManager},
};

use crate::unit_tests::test_loop;

fn request(method: &str, path: &str) -> HttpRequest {
    let mut req = HttpRequest::default();
    req.method = method.to_string();
    req.path = path.to_string();
    req.version = "HTTP/1.1".to_string();
    req
}

#[test]
fn path_params_accessors() {
    let mut params = PathParams::new();
    assert!(!params.has("id"));
    assert_eq!(params.get("id"), "");

    params.insert("id", "42");
    params.insert("name", "alice");
    assert!(params.has("id"));
    assert_eq!(params.get("id"), "42");
    assert_eq!(params.get("name"), "alice");
    assert_eq!(params.get("missing"), "");
}

#[test]
fn exact_path_match() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let called = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&called);
    rm.add_route("GET", "/ping", move |_el, _req, _resp, _params| {
        *flag.borrow_mut() = true;
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("GET", "/ping"), &mut resp));
    assert!(*called.borrow());
}

#[test]
fn unknown_path_returns_false() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    rm.add_route("GET", "/ping", |_el, _req, _resp, _params| {});

    let mut resp = HttpResponse::new();
    assert!(!rm.dispatch(&mut el, &request("GET", "/other"), &mut resp));
}

#[test]
fn method_mismatch_answers_405_with_allow() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    rm.add_route("GET", "/ping", |_el, _req, _resp, _params| {});

    let mut resp = HttpResponse::new();
    // Handled: the router owns the 405.
    assert!(rm.dispatch(&mut el, &request("POST", "/ping"), &mut resp));
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.header("Allow"), Some("GET, OPTIONS"));
}

#[test]
fn options_answers_204_with_allow() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    rm.add_route("GET", "/ping", |_el, _req, _resp, _params| {});
    rm.add_route("POST", "/ping", |_el, _req, _resp, _params| {});

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("OPTIONS", "/ping"), &mut resp));
    assert_eq!(resp.status(), 204);
    assert_eq!(resp.header("Allow"), Some("GET, OPTIONS, POST"));
}

#[test]
fn single_param_extraction() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let captured = Rc::new(RefCell::new(PathParams::new()));
    let slot = Rc::clone(&captured);
    rm.add_route("GET", "/users/{id}", move |_el, _req, _resp, params| {
        *slot.borrow_mut() = params.clone();
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("GET", "/users/42"), &mut resp));
    assert_eq!(captured.borrow().get("id"), "42");
}

#[test]
fn multiple_params_extraction() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let captured = Rc::new(RefCell::new(PathParams::new()));
    let slot = Rc::clone(&captured);
    rm.add_route(
        "GET",
        "/users/{uid}/posts/{pid}",
        move |_el, _req, _resp, params| {
            *slot.borrow_mut() = params.clone();
        },
    );

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(
        &mut el,
        &request("GET", "/users/alice/posts/99"),
        &mut resp
    ));
    assert_eq!(captured.borrow().get("uid"), "alice");
    assert_eq!(captured.borrow().get("pid"), "99");
}

#[test]
fn wildcard_matches_deep_paths() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let called = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&called);
    rm.add_route("GET", "/files/*", move |_el, _req, _resp, _params| {
        *flag.borrow_mut() = true;
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(
        &mut el,
        &request("GET", "/files/images/logo.png"),
        &mut resp
    ));
    assert!(*called.borrow());
}

#[test]
fn wildcard_requires_at_least_one_segment() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    rm.add_route("GET", "/files/*", |_el, _req, _resp, _params| {});

    let mut resp = HttpResponse::new();
    assert!(!rm.dispatch(&mut el, &request("GET", "/files"), &mut resp));
}

#[test]
fn exact_beats_parametric() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let hit = Rc::new(RefCell::new(""));

    let slot = Rc::clone(&hit);
    rm.add_route("GET", "/users/{id}", move |_el, _req, _resp, _params| {
        *slot.borrow_mut() = "param";
    });
    let slot = Rc::clone(&hit);
    rm.add_route("GET", "/users/me", move |_el, _req, _resp, _params| {
        *slot.borrow_mut() = "exact";
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("GET", "/users/me"), &mut resp));
    assert_eq!(*hit.borrow(), "exact");
}

#[test]
fn parametric_beats_wildcard() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let hit = Rc::new(RefCell::new(""));

    let slot = Rc::clone(&hit);
    rm.add_route("GET", "/api/*", move |_el, _req, _resp, _params| {
        *slot.borrow_mut() = "wildcard";
    });
    let slot = Rc::clone(&hit);
    rm.add_route("GET", "/api/{version}", move |_el, _req, _resp, _params| {
        *slot.borrow_mut() = "param";
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("GET", "/api/v1"), &mut resp));
    assert_eq!(*hit.borrow(), "param");
}

#[test]
fn base_path_is_prepended() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    rm.set_base_path("/api/v1");
    let called = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&called);
    rm.add_route("GET", "/ping", move |_el, _req, _resp, _params| {
        *flag.borrow_mut() = true;
    });

    let mut resp = HttpResponse::new();
    assert!(!rm.dispatch(&mut el, &request("GET", "/ping"), &mut resp));
    assert!(rm.dispatch(&mut el, &request("GET", "/api/v1/ping"), &mut resp));
    assert!(*called.borrow());
}

#[test]
fn has_route_ignores_method() {
    let mut rm = RouteManager::new();
    rm.add_route("GET", "/ping", |_el, _req, _resp, _params| {});
    assert!(rm.has_route("/ping"));
    assert!(rm.has_route("/ping/"));
    assert!(!rm.has_route("/pong"));
}

#[test]
fn trailing_slash_is_normalized() {
    let mut el = test_loop();
    let mut rm = RouteManager::new();
    let called = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&called);
    rm.add_route("GET", "/ping", move |_el, _req, _resp, _params| {
        *counter.borrow_mut() += 1;
    });

    let mut resp = HttpResponse::new();
    assert!(rm.dispatch(&mut el, &request("GET", "/ping/"), &mut resp));
    // Root is left untouched.
    assert!(!rm.dispatch(&mut el, &request("GET", "/"), &mut resp));
    assert_eq!(*called.borrow(), 1);
}

// ── OpenAPI emission ─────────────────────────────────────────────────────

fn documented_manager() -> RouteManager {
    let mut rm = RouteManager::new();
    rm.set_base_path("/api/v1");
    rm.set_info("Test", "1.0.0");

    rm.add_route("GET", "/ping", |_el, _req, _resp, _params| {})
        .summary("Ping")
        .tag("Health")
        .response(200, "OK");

    rm.add_route("GET", "/users/{id}", |_el, _req, _resp, _params| {})
        .summary("Get user")
        .tag("Users")
        .param("id", "path", "string", true);

    rm.add_route("POST", "/users", |_el, _req, _resp, _params| {})
        .summary("Create user")
        .tag("Users")
        .request_body("user payload")
        .response(201, "Created")
        .deprecated();
    rm
}

#[test]
fn openapi_basic_structure() {
    let rm = documented_manager();
    let spec = rm.openapi_spec();

    assert_eq!(spec["openapi"], "3.0.0");
    assert_eq!(spec["info"]["title"], "Test");
    assert_eq!(spec["info"]["version"], "1.0.0");
    assert!(spec["paths"]["/api/v1/ping"]["get"].is_object());
    assert!(spec["paths"]["/api/v1/users/{id}"]["get"].is_object());
}

#[test]
fn openapi_params_and_body() {
    let rm = documented_manager();
    let spec = rm.openapi_spec();

    let get_user = &spec["paths"]["/api/v1/users/{id}"]["get"];
    assert_eq!(get_user["parameters"][0]["name"], "id");
    assert_eq!(get_user["parameters"][0]["in"], "path");
    assert_eq!(get_user["parameters"][0]["required"], true);

    let create = &spec["paths"]["/api/v1/users"]["post"];
    assert_eq!(create["requestBody"]["description"], "user payload");
    assert_eq!(create["responses"]["201"]["description"], "Created");
    assert_eq!(create["deprecated"], true);
}

#[test]
fn openapi_tags_are_unique_and_sorted() {
    let rm = documented_manager();
    let spec = rm.openapi_spec();

    let tags: Vec<&str> = spec["tags"]
        .as_array()
        .expect("tags array")
        .iter()
        .map(|t| t["name"].as_str().expect("tag name"))
        .collect();
    assert_eq!(tags, vec!["Health", "Users"]);
}

#[test]
fn yaml_rendering_quotes_tricky_strings() {
    let mut rm = RouteManager::new();
    rm.set_info("yes", "8080");
    rm.add_route("GET", "/x", |_el, _req, _resp, _params| {});

    let yaml = rm.openapi_yaml();
    // Reserved word and numeric-looking strings stay strings.
    assert!(yaml.contains("title: 'yes'"));
    assert!(yaml.contains("version: '8080'"));
    assert!(yaml.contains("openapi: 3.0.0") || yaml.contains("openapi: '3.0.0'"));
}
