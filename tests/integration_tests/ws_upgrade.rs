// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    time::Duration,
};

use anyhow::Result;
use portico::{
    server::HttpServer,
    ws::{
        Opcode, WsParser, ws_accept_key,
        conn::{client_handshake, generate_client_key},
        frame::build_frame,
    },
};

use crate::integration_tests::common::{connect, serve_while};

fn read_until(
    stream: &mut std::net::TcpStream,
    marker: &[u8],
) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf
        .windows(marker.len())
        .any(|window| window == marker)
    {
        let n = stream.read(&mut chunk).expect("read");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[test]
fn upgrade_and_masked_echo() -> Result<()> {
    let server = HttpServer::new();
    server.set_ws_handler(|_el, ws, message| {
        if message.opcode == Opcode::Text {
            let text = String::from_utf8_lossy(&message.payload).into_owned();
            ws.send_text(&text).expect("echo");
        }
    });

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let key = generate_client_key();
        stream
            .write_all(client_handshake("h", "/chat", &key).as_bytes())
            .expect("handshake write");

        // 101 with the RFC accept value.
        let head = read_until(&mut stream, b"\r\n\r\n");
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(head.starts_with("HTTP/1.1 101"));
        let expected = format!("Sec-WebSocket-Accept: {}", ws_accept_key(&key));
        assert!(head.contains(&expected), "missing accept in {head:?}");

        // Masked client TEXT frame is echoed back unmasked.
        let frame =
            build_frame(true, Opcode::Text, b"hello", Some([7, 7, 7, 7]));
        stream.write_all(&frame).expect("frame write");

        let mut parser = WsParser::new();
        let mut chunk = [0u8; 1024];
        let message = loop {
            let n = stream.read(&mut chunk).expect("frame read");
            assert!(n > 0, "connection closed before echo");
            let mut messages =
                parser.feed(&chunk[..n]).expect("frame parse");
            if let Some(message) = messages.pop() {
                break message;
            }
        };
        assert_eq!(message.opcode, Opcode::Text);
        assert_eq!(message.payload, b"hello");
    })?;
    Ok(())
}

#[test]
fn rfc_example_key_round_trips_through_server() -> Result<()> {
    let server = HttpServer::new();
    server.set_ws_handler(|_el, _ws, _message| {});

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        stream
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: h\r\n\
                  Upgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .expect("handshake write");
        let head = read_until(&mut stream, b"\r\n\r\n");
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(head.contains(
            "Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        ));
    })?;
    Ok(())
}

#[test]
fn ping_gets_pong_and_close_terminates() -> Result<()> {
    let server = HttpServer::new();
    server.set_ws_handler(|_el, _ws, _message| {});

    serve_while(&server, |addr| {
        let mut stream = connect(addr);
        let key = generate_client_key();
        stream
            .write_all(client_handshake("h", "/", &key).as_bytes())
            .expect("handshake write");
        read_until(&mut stream, b"\r\n\r\n");

        // PING is answered with a PONG echoing the payload.
        let ping =
            build_frame(true, Opcode::Ping, b"marco", Some([1, 2, 3, 4]));
        stream.write_all(&ping).expect("ping write");

        let mut parser = WsParser::new();
        let mut chunk = [0u8; 1024];
        let pong = loop {
            let n = stream.read(&mut chunk).expect("pong read");
            assert!(n > 0);
            let mut messages = parser.feed(&chunk[..n]).expect("parse");
            if let Some(message) = messages.pop() {
                break message;
            }
        };
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"marco");

        // CLOSE is acknowledged and the socket goes away.
        let close_payload = portico::ws::frame::build_close_payload(1000, "");
        let close = build_frame(
            true,
            Opcode::Close,
            &close_payload,
            Some([4, 3, 2, 1]),
        );
        stream.write_all(&close).expect("close write");

        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        // The close reply (if any) parses; then EOF.
        if !rest.is_empty() {
            let mut parser = WsParser::new();
            let messages = parser.feed(&rest).expect("close parse");
            assert!(messages
                .iter()
                .all(|m| m.opcode == Opcode::Close));
        }
    })?;
    Ok(())
}
