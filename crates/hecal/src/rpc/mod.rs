// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed TCP request/response protocol.
//!
//! Servers listen on ephemeral ports discovered via registration; clients
//! open sessions and issue blocking or async calls. One I/O event loop
//! (shared by both managers) drives every socket; handlers run on the
//! thread pool.
//!
//! # Session state machines
//!
//! ```text
//! server: Accepted -> ReadHeaderStart(8) -> ReadHeaderRest(hs-8)
//!           -> ReadPayload(package_size) -> Dispatch -> WriteResponse
//!           -> ReadHeaderStart ...            (socket error -> Closed)
//! client: mirrored; one outstanding call per session
//! ```

mod client;
mod error;
mod io;
mod protocol;
mod server;

pub use client::{ClientEvent, ClientManager, ClientSession};
pub use error::{CallState, RpcError, ServiceResponse};
pub use io::IoContext;
pub use protocol::{
    decode_call_payload, decode_response_payload, encode_call_payload, encode_response_payload,
    Frame, FrameDecoder, FrameHeader, MessageType, ProtocolError, HEADER_SIZE_V1,
    PROTOCOL_VERSION,
};
pub use server::{MethodHandler, Server, ServerEvent, ServerManager};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::core::threadpool::{PoolConfig, ThreadPool};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Rig {
        io: Arc<IoContext>,
        servers: ServerManager,
        clients: ClientManager,
    }

    fn rig() -> Rig {
        let io = IoContext::spawn().expect("io");
        let pool = ThreadPool::new(PoolConfig::default());
        let config = RpcConfig {
            call_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            parallel_sessions: true,
        };
        Rig {
            io: Arc::clone(&io),
            servers: ServerManager::new(Arc::clone(&io), pool.clone(), config.clone()),
            clients: ClientManager::new(io, pool, config),
        }
    }

    #[test]
    fn blocking_echo_call() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("echo", |req| {
            assert_eq!(req, b"PING");
            Ok(b"PONG".to_vec())
        });

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");
        let response = session.call("echo", b"PING");
        assert_eq!(response.call_state, CallState::Executed);
        assert_eq!(response.payload, b"PONG");
        assert!(response.error_message.is_empty());
        rig.io.stop();
    }

    #[test]
    fn unknown_method_fails_without_teardown() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("echo", |req| Ok(req.to_vec()));

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");

        let response = session.call("no_such_method", b"x");
        assert_eq!(response.call_state, CallState::Failed);
        assert!(response.error_message.contains("unknown method"));

        // The session survives and still works.
        let response = session.call("echo", b"still alive");
        assert_eq!(response.call_state, CallState::Executed);
        assert_eq!(response.payload, b"still alive");
        rig.io.stop();
    }

    #[test]
    fn handler_error_reaches_caller() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("fail", |_| Err("handler exploded".to_string()));

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");
        let response = session.call("fail", b"");
        assert_eq!(response.call_state, CallState::Failed);
        assert_eq!(response.error_message, "handler exploded");
        rig.io.stop();
    }

    #[test]
    fn slow_handler_times_out_and_session_recovers() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("slow", |_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(b"late".to_vec())
        });
        server.add_method("fast", |_| Ok(b"quick".to_vec()));

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");

        let response = session.call_with_timeout("slow", b"", Duration::from_millis(50));
        assert_eq!(response.call_state, CallState::TimedOut);

        // The late response is swallowed; the next call gets its own.
        std::thread::sleep(Duration::from_millis(500));
        let response = session.call("fast", b"");
        assert_eq!(response.call_state, CallState::Executed);
        assert_eq!(response.payload, b"quick");
        rig.io.stop();
    }

    #[test]
    fn async_call_lands_on_callback() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("echo", |req| Ok(req.to_vec()));

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");

        let (tx, rx) = std::sync::mpsc::channel();
        assert!(session.call_async("echo", b"async", move |resp| {
            tx.send(resp).ok();
        }));
        let response = rx.recv_timeout(Duration::from_secs(2)).expect("callback");
        assert_eq!(response.call_state, CallState::Executed);
        assert_eq!(response.payload, b"async");
        rig.io.stop();
    }

    #[test]
    fn multiple_sessions_are_independent() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        server.add_method("count", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        });

        let s1 = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("s1");
        let s2 = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("s2");
        assert!(s1.call("count", b"").is_executed());
        assert!(s2.call("count", b"").is_executed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(server.connection_count(), 2);
        rig.io.stop();
    }

    #[test]
    fn manager_stop_cancels_sessions() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");
        assert!(session.is_connected());

        rig.clients.stop();
        // The loop notified the session while tearing down.
        assert!(!session.is_connected());
        let response = session.call("anything", b"");
        assert_eq!(response.call_state, CallState::Failed);
    }

    #[test]
    fn server_events_fire_on_connect_and_disconnect() {
        let rig = rig();
        let server = rig.servers.create_server().expect("server");
        server.add_method("noop", |_| Ok(vec![]));
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (c, d) = (Arc::clone(&connects), Arc::clone(&disconnects));
        server.set_event_callback(move |event| match event {
            ServerEvent::Connected => {
                c.fetch_add(1, Ordering::SeqCst);
            }
            ServerEvent::Disconnected => {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        let session = rig
            .clients
            .create_session("127.0.0.1", server.port())
            .expect("session");
        assert!(session.call("noop", b"").is_executed());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        drop(session);
        rig.clients.stop();
        // Stopping the shared loop closes the server-side socket too.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while disconnects.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
