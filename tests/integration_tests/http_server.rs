// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    net::SocketAddr,
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use portico::{
    event::EventLoop,
    http::{
        ClientTimeouts, HttpClient, HttpRequest, HttpResponse, HttpStatus,
        client::build_request,
    },
    module::Module,
    net::TcpListener,
    route::{RouteManager, RoutedModule},
    server::HttpServer,
};

use crate::integration_tests::common::{connect, exchange, serve_while};

/// Echoes the request path; records every path it saw.
struct EchoModule {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(
        &mut self,
        _el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        self.seen.lock().expect("lock").push(req.path.clone());
        resp.set_status(HttpStatus::Ok)
            .set_body(req.path.clone(), "text/plain");
        true
    }
}

#[test]
fn get_is_echoed() -> Result<()> {
    let server = HttpServer::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    server.register_module(Box::new(EchoModule { seen: Arc::clone(&seen) }));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"GET /hello HTTP/1.1\r\nHost: h\r\n\r\n",
            1,
        )
        .expect("exchange");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].body, b"/hello");
    })?;

    assert_eq!(*seen.lock().expect("lock"), vec!["/hello".to_string()]);
    Ok(())
}

#[test]
fn pipelined_requests_are_answered_in_order() -> Result<()> {
    let server = HttpServer::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    server.register_module(Box::new(EchoModule { seen: Arc::clone(&seen) }));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        // Two requests in one TCP segment.
        let responses = exchange(
            &mut stream,
            b"GET /first HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /second HTTP/1.1\r\nHost: h\r\n\r\n",
            2,
        )
        .expect("exchange");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].body, b"/first");
        assert_eq!(responses[1].body, b"/second");
    })?;

    assert_eq!(
        *seen.lock().expect("lock"),
        vec!["/first".to_string(), "/second".to_string()]
    );
    Ok(())
}

#[test]
fn unknown_path_is_404() -> Result<()> {
    let server = HttpServer::new();

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"GET /nowhere HTTP/1.1\r\nHost: h\r\n\r\n",
            1,
        )
        .expect("exchange");
        assert_eq!(responses[0].status, 404);
        let body = String::from_utf8_lossy(&responses[0].body).into_owned();
        assert!(body.contains("\"code\":404"));
    })?;
    Ok(())
}

#[test]
fn wrong_method_is_405_with_allow() -> Result<()> {
    let server = HttpServer::new();
    let mut routes = RouteManager::new();
    routes.add_route("GET", "/only", |_el, _req, resp, _params| {
        resp.set_status(HttpStatus::Ok);
    });
    server.register_module(Box::new(RoutedModule::new("only", routes)));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"POST /only HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
            1,
        )
        .expect("exchange");
        assert_eq!(responses[0].status, 405);
        assert_eq!(responses[0].header("Allow"), Some("GET, OPTIONS"));
    })?;
    Ok(())
}

/// Defers every response and completes it from a timer, the way a pool
/// callback would.
struct SlowModule;

impl Module for SlowModule {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute(
        &mut self,
        el: &mut EventLoop,
        req: &HttpRequest,
        resp: &mut HttpResponse,
    ) -> bool {
        let done = resp.defer();
        let path = req.path.clone();
        el.add_timer(Duration::from_millis(50), move |el| {
            let mut resp = HttpResponse::new();
            resp.set_status(HttpStatus::Ok)
                .set_body(format!("deferred:{path}"), "text/plain");
            done.complete(el, resp);
        });
        true
    }
}

#[test]
fn deferred_response_arrives_after_completion() -> Result<()> {
    let server = HttpServer::new();
    server.register_module(Box::new(SlowModule));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"GET /later HTTP/1.1\r\nHost: h\r\n\r\n",
            1,
        )
        .expect("exchange");
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].body, b"deferred:/later");
    })?;
    Ok(())
}

#[test]
fn deferred_response_keeps_pipeline_order() -> Result<()> {
    let server = HttpServer::new();
    server.register_module(Box::new(SlowModule));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /b HTTP/1.1\r\nHost: h\r\n\r\n",
            2,
        )
        .expect("exchange");
        assert_eq!(responses[0].body, b"deferred:/a");
        assert_eq!(responses[1].body, b"deferred:/b");
    })?;
    Ok(())
}

#[test]
fn outbound_client_round_trips_on_the_same_loop() -> Result<()> {
    let mut el = EventLoop::new()?;
    let server = HttpServer::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    server.register_module(Box::new(EchoModule { seen }));

    let listener = TcpListener::bind_any(0, 16)?;
    let mut addr = listener.addr();
    addr.set_ip(match addr {
        SocketAddr::V4(_) => "127.0.0.1".parse().expect("ip"),
        SocketAddr::V6(_) => "::1".parse().expect("ip"),
    });
    server.listen(&mut el, listener)?;

    let client = HttpClient::new(ClientTimeouts::default());
    let got = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&got);
    client.on_response(move |el, response| {
        *slot.borrow_mut() = Some(response);
        el.stop();
    });
    client.on_error(|_el, message| panic!("client error: {message}"));

    client.connect(&mut el, addr)?;
    client.send(
        &mut el,
        &build_request("GET", "h", "/round-trip", &[], b""),
    )?;

    el.add_timer(Duration::from_secs(5), |el| el.stop());
    el.run()?;

    let response = got.borrow_mut().take().expect("response arrived");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"/round-trip");

    client.close(&mut el);
    server.shutdown(&mut el);
    Ok(())
}

#[test]
fn outbound_client_connect_timeout_fires() -> Result<()> {
    let mut el = EventLoop::new()?;
    let client = HttpClient::new(ClientTimeouts {
        connect: Duration::from_millis(200),
        idle: Duration::ZERO,
    });

    let failed = Rc::new(RefCell::new(false));
    let slot = Rc::clone(&failed);
    client.on_error(move |el, _message| {
        *slot.borrow_mut() = true;
        el.stop();
    });

    // A TEST-NET address that never answers; the connect timer must
    // fire. Immediate kernel-level refusal also counts as an error.
    let addr: SocketAddr = "192.0.2.1:9".parse().expect("addr");
    match client.connect(&mut el, addr) {
        Err(_) => return Ok(()),
        Ok(()) => {},
    }

    el.add_timer(Duration::from_secs(5), |el| el.stop());
    el.run()?;
    assert!(*failed.borrow(), "connect timeout did not fire");
    Ok(())
}

#[test]
fn connection_close_is_honoured() -> Result<()> {
    let server = HttpServer::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    server.register_module(Box::new(EchoModule { seen }));

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let responses = exchange(
            &mut stream,
            b"GET /bye HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
            1,
        )
        .expect("exchange");
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].header("Connection"), Some("close"));

        // The server closes; the next read hits EOF.
        use std::io::Read;
        let mut rest = Vec::new();
        let eof = stream.read_to_end(&mut rest);
        assert!(eof.is_ok());
        assert!(rest.is_empty());
    })?;
    Ok(())
}
