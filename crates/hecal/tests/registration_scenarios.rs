// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery-plane scenarios: two nodes in the same domain observing each
//! other's entities through the registration bus.

use hecal::{Configuration, DataTypeInformation, Node};
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
    (build("node_a"), build("node_b"))
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

/// Three publishers and two subscribers on node A become visible in node
/// B's registry within two TTL intervals; destroying one publisher brings
/// the count down to four.
#[test]
fn peer_registry_tracks_entity_lifecycle() {
    let (node_a, node_b) = node_pair(24_501);

    let _p1 = node_a
        .create_publisher("t1", DataTypeInformation::raw())
        .expect("p1");
    let _p2 = node_a
        .create_publisher("t2", DataTypeInformation::raw())
        .expect("p2");
    let p3 = node_a
        .create_publisher("t3", DataTypeInformation::raw())
        .expect("p3");
    let _s1 = node_a
        .create_subscriber("t1", DataTypeInformation::raw())
        .expect("s1");
    let _s2 = node_a
        .create_subscriber("t2", DataTypeInformation::raw())
        .expect("s2");

    // Two TTL intervals to see all five entities.
    let all_seen = wait_until(Duration::from_millis(1_600), || {
        let mon = node_b.monitoring();
        mon.publishers.len() == 3 && mon.subscribers.len() == 2
    });
    assert!(
        all_seen,
        "node B sees {} publishers / {} subscribers",
        node_b.monitoring().publishers.len(),
        node_b.monitoring().subscribers.len()
    );

    drop(p3);

    // The explicit unregister (or at worst the TTL) removes exactly one.
    let four_left = wait_until(Duration::from_millis(1_600), || {
        let mon = node_b.monitoring();
        mon.publishers.len() == 2 && mon.subscribers.len() == 2
    });
    assert!(
        four_left,
        "node B still sees {} publishers",
        node_b.monitoring().publishers.len()
    );

    node_a.shutdown();
    node_b.shutdown();
}

/// Process-state samples surface the peer process in monitoring.
#[test]
fn peer_processes_appear_in_monitoring() {
    let (node_a, node_b) = node_pair(24_502);

    let seen = wait_until(Duration::from_secs(3), || {
        node_b
            .monitoring()
            .processes
            .iter()
            .any(|s| s.process.unit_name == "node_a")
    });
    assert!(seen, "node_a's process sample never arrived");

    node_a.shutdown();

    // The explicit unregisters do not cover process samples; those age out
    // via the TTL sweep.
    let gone = wait_until(Duration::from_secs(3), || {
        !node_b
            .monitoring()
            .processes
            .iter()
            .any(|s| s.process.unit_name == "node_a")
    });
    assert!(gone, "node_a's process sample never expired");
    node_b.shutdown();
}

/// Cross-node matching: a subscriber on node B receives from a publisher
/// on node A (same host, shared memory layer).
#[test]
fn cross_node_pubsub_via_discovery() {
    let (node_a, node_b) = node_pair(24_503);

    let subscriber = node_b
        .create_subscriber("xnode", DataTypeInformation::raw())
        .expect("subscriber");
    let (tx, rx) = std::sync::mpsc::channel();
    subscriber.set_receive_callback(move |topic, _datatype, data| {
        tx.send((topic.clone(), data.buffer.to_vec())).ok();
    });

    let mut publisher = node_a
        .create_publisher("xnode", DataTypeInformation::raw())
        .expect("publisher");

    assert!(
        wait_until(Duration::from_secs(5), || subscriber.publisher_count() == 1),
        "cross-node match failed"
    );
    std::thread::sleep(Duration::from_millis(150));

    publisher.send(b"across nodes").expect("send");
    let (topic, payload) = rx.recv_timeout(Duration::from_secs(5)).expect("receive");
    assert_eq!(payload, b"across nodes");
    assert_eq!(topic.topic_name, "xnode");
    assert_eq!(topic.entity, publisher.id().entity);

    node_a.shutdown();
    node_b.shutdown();
}
