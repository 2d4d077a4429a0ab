// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end pub/sub scenarios over a full node (registration bus,
//! shared memory transport, callback dispatch).

use hecal::{Configuration, DataTypeInformation, Node, PayloadWriter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// Every test gets its own registration port + domain so parallel test
/// execution cannot crosstalk.
fn test_node(name: &str, port: u16, tweak: impl FnOnce(&mut Configuration)) -> Node {
    let mut config = Configuration::default();
    config.registration.period = Duration::from_millis(50);
    config.registration.ttl = Duration::from_millis(600);
    config.registration.port = port;
    config.registration.domain_id = fastrand::u16(1..);
    config.pool.max_workers = 4;
    tweak(&mut config);
    Node::builder(name).configuration(config).build().expect("node")
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// One publisher sends ten bytes once; the matched subscriber receives
/// exactly one callback with the exact payload and clock 1.
#[test]
fn basic_echo() {
    let node = test_node("echo", 24_401, |_| {});
    let subscriber = node
        .create_subscriber("A", DataTypeInformation::raw())
        .expect("subscriber");
    let (tx, rx) = mpsc::channel();
    subscriber.set_receive_callback(move |_topic, _datatype, data| {
        tx.send((data.buffer.to_vec(), data.clock)).ok();
    });

    let mut publisher = node
        .create_publisher("A", DataTypeInformation::raw())
        .expect("publisher");

    assert!(
        wait_until(Duration::from_secs(5), || subscriber.publisher_count() == 1),
        "subscriber never matched"
    );
    std::thread::sleep(Duration::from_millis(150)); // reader settle

    let payload: Vec<u8> = (0u8..10).collect();
    publisher.send(&payload).expect("send");

    let (received, clock) = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert_eq!(received, payload);
    assert_eq!(received.len(), 10);
    assert_eq!(clock, 1);

    // Exactly one callback.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    node.shutdown();
}

struct PatchWriter {
    index: usize,
    value: u8,
}

impl PayloadWriter for PatchWriter {
    fn size(&self) -> usize {
        10
    }
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        buf.fill(42);
        true
    }
    fn write_modify(&mut self, buf: &mut [u8]) -> bool {
        buf[self.index] = self.value;
        true
    }
}

fn run_partial_write_scenario(port: u16, buffer_count: usize) -> u64 {
    let node = test_node("partial", port, |config| {
        config.shm.buffer_count = buffer_count;
        config.shm.zero_copy = true;
        config.shm.ack_timeout = Duration::from_millis(500);
    });

    let subscriber = node
        .create_subscriber("patched", DataTypeInformation::raw())
        .expect("subscriber");
    let sum = Arc::new(AtomicU64::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));
    let (s, c) = (Arc::clone(&sum), Arc::clone(&callbacks));
    subscriber.set_receive_callback(move |_topic, _datatype, data| {
        let payload_sum: u64 = data.buffer.iter().map(|&b| u64::from(b)).sum();
        s.fetch_add(payload_sum, Ordering::SeqCst);
        c.fetch_add(1, Ordering::SeqCst);
    });

    let mut publisher = node
        .create_publisher("patched", DataTypeInformation::raw())
        .expect("publisher");
    assert!(
        wait_until(Duration::from_secs(5), || subscriber.publisher_count() == 1),
        "no match"
    );
    std::thread::sleep(Duration::from_millis(150));

    // Initial full write (all 42s), then ten patches.
    let mut writer = PatchWriter { index: 0, value: 0 };
    publisher.send_with(&mut writer).expect("initial write");
    for i in 0..10u8 {
        writer.index = usize::from(i) % 10;
        writer.value = i;
        publisher.send_with(&mut writer).expect("partial write");
    }

    assert!(
        wait_until(Duration::from_secs(5), || callbacks
            .load(Ordering::SeqCst)
            == 11),
        "expected 11 callbacks, got {}",
        callbacks.load(Ordering::SeqCst)
    );
    node.shutdown();
    sum.load(Ordering::SeqCst)
}

/// Single buffer + zero copy: the ten patch writes go through the modify
/// path, each callback observes the accumulated payload.
#[test]
fn zero_copy_partial_writes_single_buffer() {
    assert_eq!(run_partial_write_scenario(24_402, 1), 2475);
}

/// Two buffers: zero copy is ineffective, every write is a full write of
/// all 42s.
#[test]
fn partial_writes_fall_back_to_full_with_two_buffers() {
    assert_eq!(run_partial_write_scenario(24_403, 2), 11 * 10 * 42);
}

/// Subscribers coming and going while the publisher keeps sending at
/// 10 Hz; every new subscription receives within five seconds.
#[test]
fn reconnecting_subscribers_keep_receiving() {
    let node = Arc::new(test_node("reconnect", 24_404, |_| {}));
    let publisher = Arc::new(Mutex::new(
        node.create_publisher("beat", DataTypeInformation::raw())
            .expect("publisher"),
    ));

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pump = {
        let publisher = Arc::clone(&publisher);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                publisher.lock().expect("lock").send(b"tick").ok();
                std::thread::sleep(Duration::from_millis(100));
            }
        })
    };

    let receives_within = |deadline: Duration| {
        let subscriber = node
            .create_subscriber("beat", DataTypeInformation::raw())
            .expect("subscriber");
        let (tx, rx) = mpsc::channel();
        subscriber.set_receive_callback(move |_t, _d, data| {
            tx.send(data.clock).ok();
        });
        let got = rx.recv_timeout(deadline).is_ok();
        drop(subscriber);
        got
    };

    assert!(receives_within(Duration::from_secs(5)), "first subscription");

    // An unrelated topic in between; it must see nothing from "beat".
    {
        let other = node
            .create_subscriber("other_topic", DataTypeInformation::raw())
            .expect("subscriber");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        other.set_receive_callback(move |_t, _d, _data| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    assert!(receives_within(Duration::from_secs(5)), "re-subscription");

    stop.store(true, Ordering::Release);
    pump.join().expect("pump");
    node.shutdown();
}

/// P1 -> T1 -> S1 republishes on T2 -> S2: chained callbacks preserve
/// count and order.
#[test]
fn chained_callback_preserves_order() {
    let node = test_node("chain", 24_405, |config| {
        config.shm.ack_timeout = Duration::from_millis(500);
    });

    let s2 = node
        .create_subscriber("T2", DataTypeInformation::raw())
        .expect("s2");
    let (tx, rx) = mpsc::channel();
    s2.set_receive_callback(move |_t, _d, data| {
        tx.send(data.buffer.to_vec()).ok();
    });

    let p2 = Arc::new(Mutex::new(
        node.create_publisher("T2", DataTypeInformation::raw())
            .expect("p2"),
    ));
    let s1 = node
        .create_subscriber("T1", DataTypeInformation::raw())
        .expect("s1");
    {
        let p2 = Arc::clone(&p2);
        s1.set_receive_callback(move |_t, _d, data| {
            p2.lock().expect("lock").send(data.buffer).ok();
        });
    }
    let mut p1 = node
        .create_publisher("T1", DataTypeInformation::raw())
        .expect("p1");

    assert!(
        wait_until(Duration::from_secs(5), || {
            s1.publisher_count() == 1 && s2.publisher_count() == 1
        }),
        "chain never matched"
    );
    std::thread::sleep(Duration::from_millis(150));

    const N: usize = 10;
    for i in 0..N {
        p1.send(format!("msg-{i}").as_bytes()).expect("send");
    }

    let mut received = Vec::new();
    for _ in 0..N {
        received.push(rx.recv_timeout(Duration::from_secs(5)).expect("chained message"));
    }
    let expected: Vec<Vec<u8>> = (0..N).map(|i| format!("msg-{i}").into_bytes()).collect();
    assert_eq!(received, expected);
    node.shutdown();
}
