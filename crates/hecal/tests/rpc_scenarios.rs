// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service call scenarios over a full node: server discovery through the
//! registration plane, framed TCP sessions, blocking and async calls.

use hecal::{CallState, Configuration, Node};
use std::time::{Duration, Instant};

fn node_pair(port: u16) -> (Node, Node) {
    let domain = fastrand::u16(1..);
    let build = |name: &str| {
        let mut config = Configuration::default();
        config.registration.period = Duration::from_millis(100);
        config.registration.ttl = Duration::from_millis(800);
        config.registration.port = port;
        config.registration.domain_id = domain;
        Node::builder(name).configuration(config).build().expect("node")
    };
    (build("server_node"), build("client_node"))
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

/// Echo service: client sends "PING", server replies "PONG" within one
/// call deadline, `call_state` is executed.
#[test]
fn blocking_call_roundtrip() {
    let (server_node, client_node) = node_pair(24_601);

    let server = server_node
        .create_service_server("echo_service")
        .expect("server");
    server.add_method("echo", |request| {
        assert_eq!(request, b"PING");
        Ok(b"PONG".to_vec())
    });

    let client = client_node
        .create_service_client("echo_service")
        .expect("client");

    assert!(
        wait_until(Duration::from_secs(5), || {
            !client_node.registry().query_servers().is_empty()
        }),
        "server never discovered"
    );

    let response = client.call("echo", b"PING");
    assert_eq!(response.call_state, CallState::Executed);
    assert_eq!(response.payload, b"PONG");
    assert!(response.error_message.is_empty());

    server_node.shutdown();
    client_node.shutdown();
}

/// Unknown methods fail with a message; the session keeps working.
#[test]
fn failed_and_recovered_calls() {
    let (server_node, client_node) = node_pair(24_602);

    let server = server_node
        .create_service_server("fallible")
        .expect("server");
    server.add_method("works", |_| Ok(b"ok".to_vec()));

    let client = client_node
        .create_service_client("fallible")
        .expect("client");
    assert!(wait_until(Duration::from_secs(5), || {
        !client_node.registry().query_servers().is_empty()
    }));

    let response = client.call("missing", b"");
    assert_eq!(response.call_state, CallState::Failed);
    assert!(!response.error_message.is_empty());

    let response = client.call("works", b"");
    assert_eq!(response.call_state, CallState::Executed);
    assert_eq!(response.payload, b"ok");

    server_node.shutdown();
    client_node.shutdown();
}

/// Async calls deliver their response through the callback.
#[test]
fn async_call_roundtrip() {
    let (server_node, client_node) = node_pair(24_603);

    let server = server_node.create_service_server("math").expect("server");
    server.add_method("double", |request| {
        let value = request.first().copied().unwrap_or(0);
        Ok(vec![value * 2])
    });

    let client = client_node.create_service_client("math").expect("client");
    assert!(wait_until(Duration::from_secs(5), || {
        !client_node.registry().query_servers().is_empty()
    }));

    let (tx, rx) = std::sync::mpsc::channel();
    assert!(client.call_async("double", &[21], move |response| {
        tx.send(response).ok();
    }));
    let response = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert_eq!(response.call_state, CallState::Executed);
    assert_eq!(response.payload, vec![42]);

    server_node.shutdown();
    client_node.shutdown();
}

/// A client with no discovered server fails cleanly.
#[test]
fn call_without_server_fails() {
    let (_server_node, client_node) = node_pair(24_604);
    let client = client_node
        .create_service_client("nobody_home")
        .expect("client");
    let response = client.call("anything", b"");
    assert_eq!(response.call_state, CallState::Failed);
    assert!(response.error_message.contains("nobody_home"));
    client_node.shutdown();
}
