// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use portico::{
    event::EventLoop,
    http::{HttpResponseParser, parser::HttpClientResponse},
    net::TcpListener,
    server::HttpServer,
};

/// Runs `server` on an ephemeral loopback port while `client_work`
/// executes on a second thread; returns once the client finishes (or a
/// safety timeout trips). Client panics propagate to the test.
pub fn serve_while<F>(server: &HttpServer, client_work: F) -> Result<()>
where F: FnOnce(SocketAddr) + Send + 'static {
    let mut el = EventLoop::new()?;
    let listener = TcpListener::bind_any(0, 128)?;
    let mut addr = listener.addr();
    // Connect over loopback, not the wildcard we bound.
    addr.set_ip(match addr {
        SocketAddr::V4(_) => "127.0.0.1".parse().expect("ip"),
        SocketAddr::V6(_) => "::1".parse().expect("ip"),
    });
    server.listen(&mut el, listener)?;

    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let client = std::thread::spawn(move || {
        client_work(addr);
        flag.store(true, Ordering::SeqCst);
    });

    let flag = Arc::clone(&done);
    el.add_periodic(
        Duration::from_millis(5),
        Duration::from_millis(5),
        move |el| {
            if flag.load(Ordering::SeqCst) {
                el.stop();
            }
        },
    );
    el.add_timer(Duration::from_secs(10), |el| el.stop());

    el.run()?;
    server.shutdown(&mut el);

    match client.join() {
        Ok(()) => Ok(()),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Blocking client helper: writes `wire` and parses `expected`
/// responses off the same connection.
pub fn exchange(
    stream: &mut TcpStream,
    wire: &[u8],
    expected: usize,
) -> Result<Vec<HttpClientResponse>> {
    stream.write_all(wire).context("client write")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .context("set timeout")?;

    let mut parser = HttpResponseParser::new();
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    while collected.len() < expected {
        let n = stream.read(&mut chunk).context("client read")?;
        if n == 0 {
            break;
        }
        collected.extend(
            parser.feed(&chunk[..n]).context("client response parse")?,
        );
    }
    Ok(collected)
}

/// Connects with a bounded retry; the listener is live before
/// `serve_while` returns control to the client thread, but be lenient.
pub fn connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("cannot connect to {addr}");
}
