// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC server side: manager, server handle and session dispatch.
//!
//! A server listens on an ephemeral port (peers discover it via
//! registration) and owns a method table. The session state machine lives
//! in the I/O loop; this module dispatches complete requests onto the
//! thread pool and writes the responses back.

use super::error::RpcError;
use super::io::{IoCmd, IoContext, ReplyHandle};
use super::protocol::{decode_call_payload, encode_response_payload, Frame};
use crate::config::RpcConfig;
use crate::core::threadpool::ThreadPool;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Server-side session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client session connected.
    Connected,
    /// A client session disconnected.
    Disconnected,
}

/// Request handler: raw request bytes in, response bytes or error out.
pub type MethodHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

type EventCallback = Box<dyn Fn(ServerEvent) + Send + Sync>;

/// Shared state between the server handle and the I/O loop.
pub(crate) struct ServerCore {
    methods: DashMap<String, MethodHandler>,
    pool: ThreadPool,
    /// Present when sessions must be processed one at a time.
    serial: Option<Arc<Mutex<()>>>,
    connections: AtomicUsize,
    event_cb: Mutex<Option<EventCallback>>,
}

impl ServerCore {
    fn new(pool: ThreadPool, parallel_sessions: bool) -> Self {
        Self {
            methods: DashMap::new(),
            pool,
            serial: (!parallel_sessions).then(|| Arc::new(Mutex::new(()))),
            connections: AtomicUsize::new(0),
            event_cb: Mutex::new(None),
        }
    }

    pub(crate) fn on_connect(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
        self.emit(ServerEvent::Connected);
    }

    pub(crate) fn on_disconnect(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
        self.emit(ServerEvent::Disconnected);
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(cb) = self.event_cb.lock().as_ref() {
            cb(event);
        }
    }

    /// Dispatch one complete request frame (called from the I/O thread;
    /// handler work moves to the pool immediately).
    pub(crate) fn on_frame(&self, reply: ReplyHandle, frame: Frame) {
        let (method, body) = match decode_call_payload(&frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                reply.respond(&encode_response_payload(Some(&e.to_string()), &[]));
                return;
            }
        };
        let handler = self.methods.get(&method).map(|h| Arc::clone(h.value()));
        let body = body.to_vec();
        let serial = self.serial.clone();

        let posted = self.pool.post(move || {
            let _guard = serial.as_ref().map(|m| m.lock());
            let payload = match handler {
                Some(h) => match h(&body) {
                    Ok(out) => encode_response_payload(None, &out),
                    Err(msg) => encode_response_payload(Some(&msg), &[]),
                },
                None => {
                    encode_response_payload(Some(&format!("unknown method: {method}")), &[])
                }
            };
            reply.respond(&payload);
        });
        if !posted {
            log::debug!("[RPC] request dropped, pool is shut down");
        }
    }
}

/// One RPC server: listener plus method table.
pub struct Server {
    core: Arc<ServerCore>,
    port: u16,
}

impl Server {
    /// Register (or replace) a method handler.
    pub fn add_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.core.methods.insert(name.to_string(), Arc::new(handler));
    }

    /// Remove a method handler.
    pub fn remove_method(&self, name: &str) {
        self.core.methods.remove(name);
    }

    /// Listening port (ephemeral; advertised via registration).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Currently connected sessions.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.core.connections.load(Ordering::Acquire)
    }

    /// Install the session lifecycle callback.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        *self.core.event_cb.lock() = Some(Box::new(callback));
    }
}

/// Factory for [`Server`] handles; owns no sockets itself, the shared
/// [`IoContext`] does. At most one per process; one-shot.
pub struct ServerManager {
    io: Arc<IoContext>,
    pool: ThreadPool,
    config: RpcConfig,
    stopped: AtomicBool,
}

impl ServerManager {
    /// Create a manager on an existing I/O context.
    #[must_use]
    pub fn new(io: Arc<IoContext>, pool: ThreadPool, config: RpcConfig) -> Self {
        Self {
            io,
            pool,
            config,
            stopped: AtomicBool::new(false),
        }
    }

    /// Bind an ephemeral port and start accepting sessions.
    pub fn create_server(&self) -> Result<Server, RpcError> {
        if self.stopped.load(Ordering::Acquire) || self.io.is_stopped() {
            return Err(RpcError::Cancelled);
        }
        let bind: SocketAddr = "0.0.0.0:0".parse().map_err(|_| {
            RpcError::Protocol("unparseable bind address".to_string())
        })?;
        let std_listener = std::net::TcpListener::bind(bind)?;
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();
        let listener = mio::net::TcpListener::from_std(std_listener);

        let core = Arc::new(ServerCore::new(
            self.pool.clone(),
            self.config.parallel_sessions,
        ));
        if !self.io.sender().send(IoCmd::AddListener {
            listener,
            server: Arc::clone(&core),
        }) {
            return Err(RpcError::Cancelled);
        }
        log::info!("[RPC] server listening on port {port}");
        Ok(Server { core, port })
    }

    /// Stop accepting work and cancel all outstanding I/O on the shared
    /// event loop. The manager (and its servers) cannot be reused.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.io.stop();
    }
}
