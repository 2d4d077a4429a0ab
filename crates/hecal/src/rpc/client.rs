// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC client side: manager and sessions.
//!
//! A session carries one outstanding call at a time over an ordered byte
//! stream, so responses need no correlation ids: the next response frame
//! answers the oldest unanswered request. Calls that time out leave the
//! session connected; a skip counter swallows the late response so the
//! pipeline stays aligned.

use super::error::{RpcError, ServiceResponse};
use super::io::{IoCmd, IoContext, IoSender};
use super::protocol::{
    decode_response_payload, encode_call_payload, Frame, MessageType,
};
use crate::config::RpcConfig;
use crate::core::threadpool::ThreadPool;
use parking_lot::{Condvar, Mutex};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client-side session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session connected.
    Connected,
    /// The session disconnected.
    Disconnected,
    /// A call deadline elapsed (session stays up).
    TimedOut,
}

/// How a pending call ended.
enum CallOutcome {
    Response(Vec<u8>),
    Failed(String),
    Cancelled,
}

struct CallSlot {
    /// A call is waiting for the next response frame.
    waiting: bool,
    /// Responses to swallow (their calls already timed out).
    skip: u64,
    outcome: Option<CallOutcome>,
}

type EventCallback = Box<dyn Fn(ClientEvent) + Send + Sync>;

/// Shared state between the session handle and the I/O loop.
pub(crate) struct SessionCore {
    slot: Mutex<CallSlot>,
    cv: Condvar,
    connected: AtomicBool,
    /// Connection link (token + command sender) once registered.
    link: Mutex<Option<(usize, IoSender)>>,
    event_cb: Mutex<Option<EventCallback>>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            slot: Mutex::new(CallSlot {
                waiting: false,
                skip: 0,
                outcome: None,
            }),
            cv: Condvar::new(),
            connected: AtomicBool::new(false),
            link: Mutex::new(None),
            event_cb: Mutex::new(None),
        }
    }

    pub(crate) fn on_connected(&self, token: usize, sender: IoSender) {
        *self.link.lock() = Some((token, sender));
        self.connected.store(true, Ordering::Release);
        self.cv.notify_all();
        self.emit(ClientEvent::Connected);
    }

    pub(crate) fn on_frame(&self, frame: Frame) {
        let mut slot = self.slot.lock();
        if slot.skip > 0 {
            // Response to a call that already timed out.
            slot.skip -= 1;
            return;
        }
        if slot.waiting {
            slot.outcome = Some(CallOutcome::Response(frame.payload));
            slot.waiting = false;
            self.cv.notify_all();
        } else {
            log::debug!("[RPC] unsolicited response frame dropped");
        }
    }

    pub(crate) fn on_disconnect(&self, reason: &RpcError) {
        self.connected.store(false, Ordering::Release);
        *self.link.lock() = None;
        let mut slot = self.slot.lock();
        if slot.waiting {
            slot.outcome = Some(match reason {
                RpcError::Cancelled => CallOutcome::Cancelled,
                other => CallOutcome::Failed(other.to_string()),
            });
            slot.waiting = false;
            self.cv.notify_all();
        }
        drop(slot);
        self.emit(ClientEvent::Disconnected);
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(cb) = self.event_cb.lock().as_ref() {
            cb(event);
        }
    }
}

struct SessionInner {
    core: Arc<SessionCore>,
    /// Serializes calls: one outstanding per session.
    call_lock: Mutex<()>,
    call_timeout: Duration,
    pool: ThreadPool,
    peer: SocketAddr,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Last session handle gone: drop the connection quietly.
        if let Some((token, sender)) = self.core.link.lock().take() {
            sender.send(IoCmd::Close { token });
        }
        self.core.connected.store(false, Ordering::Release);
    }
}

/// One client session to one server.
///
/// Cheap to clone; clones share the connection and the one-outstanding-call
/// constraint.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Whether the session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.core.connected.load(Ordering::Acquire)
    }

    /// Peer address this session points at.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Install the session lifecycle callback.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        *self.inner.core.event_cb.lock() = Some(Box::new(callback));
    }

    /// Blocking call with the manager's default deadline.
    #[must_use]
    pub fn call(&self, method: &str, request: &[u8]) -> ServiceResponse {
        self.call_with_timeout(method, request, self.inner.call_timeout)
    }

    /// Blocking call with an explicit deadline.
    ///
    /// A timeout does not tear the session down; the next call reuses it.
    #[must_use]
    pub fn call_with_timeout(
        &self,
        method: &str,
        request: &[u8],
        timeout: Duration,
    ) -> ServiceResponse {
        let _call_guard = self.inner.call_lock.lock();
        let core = &self.inner.core;

        if !core.connected.load(Ordering::Acquire) {
            return ServiceResponse::failed("session not connected");
        }
        let Some((token, sender)) = core.link.lock().clone() else {
            return ServiceResponse::failed("session not connected");
        };

        {
            let mut slot = core.slot.lock();
            slot.waiting = true;
            slot.outcome = None;
        }

        let bytes = Frame::encode(
            MessageType::Request,
            &encode_call_payload(method, request),
        );
        if !sender.send(IoCmd::Send { token, bytes }) {
            let mut slot = core.slot.lock();
            slot.waiting = false;
            return ServiceResponse::failed("manager stopped");
        }

        let deadline = Instant::now() + timeout;
        let mut slot = core.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.take() {
                return match outcome {
                    CallOutcome::Response(payload) => match decode_response_payload(&payload) {
                        Ok((None, body)) => ServiceResponse::executed(body.to_vec()),
                        Ok((Some(error), _)) => ServiceResponse::failed(error),
                        Err(e) => ServiceResponse::failed(e.to_string()),
                    },
                    CallOutcome::Failed(msg) => ServiceResponse::failed(msg),
                    CallOutcome::Cancelled => ServiceResponse::failed("manager stopped"),
                };
            }
            if self.inner.cv_wait_until(&mut slot, deadline) {
                // Deadline elapsed: the eventual response belongs to nobody.
                if slot.waiting {
                    slot.waiting = false;
                    slot.skip += 1;
                }
                drop(slot);
                core.emit(ClientEvent::TimedOut);
                return ServiceResponse::timed_out();
            }
        }
    }

    /// Non-blocking call: runs the blocking call on the thread pool and
    /// hands the response to `callback`. Returns false if the pool is
    /// shut down.
    pub fn call_async<F>(&self, method: &str, request: &[u8], callback: F) -> bool
    where
        F: FnOnce(ServiceResponse) + Send + 'static,
    {
        let session = self.clone();
        let method = method.to_string();
        let request = request.to_vec();
        self.inner
            .pool
            .post(move || callback(session.call(&method, &request)))
    }
}

impl SessionInner {
    /// Wait on the call condvar; true when the deadline elapsed.
    fn cv_wait_until(&self, slot: &mut parking_lot::MutexGuard<'_, CallSlot>, deadline: Instant) -> bool {
        self.core.cv.wait_until(slot, deadline).timed_out()
    }
}

/// Factory for [`ClientSession`] handles. At most one per process;
/// one-shot.
pub struct ClientManager {
    io: Arc<IoContext>,
    pool: ThreadPool,
    config: RpcConfig,
    stopped: AtomicBool,
}

impl ClientManager {
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

    /// Connect a session to `host:port`.
    pub fn create_session(&self, host: &str, port: u16) -> Result<ClientSession, RpcError> {
        if self.stopped.load(Ordering::Acquire) || self.io.is_stopped() {
            return Err(RpcError::Cancelled);
        }
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(RpcError::NotConnected)?;

        let stream = std::net::TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_std(stream);

        let core = Arc::new(SessionCore::new());
        if !self.io.sender().send(IoCmd::AddClient {
            stream,
            session: Arc::clone(&core),
        }) {
            return Err(RpcError::Cancelled);
        }

        // Wait for the loop to register the socket.
        let deadline = Instant::now() + self.config.connect_timeout;
        while !core.connected.load(Ordering::Acquire) {
            if Instant::now() >= deadline || self.io.is_stopped() {
                return Err(RpcError::NotConnected);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        log::debug!("[RPC] session connected to {addr}");
        Ok(ClientSession {
            inner: Arc::new(SessionInner {
                core,
                call_lock: Mutex::new(()),
                call_timeout: self.config.call_timeout,
                pool: self.pool.clone(),
                peer: addr,
            }),
        })
    }

    /// Stop accepting work and cancel all outstanding I/O on the shared
    /// event loop. The manager (and its sessions) cannot be reused.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.io.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::threadpool::PoolConfig;

    #[test]
    fn session_to_nowhere_fails_fast() {
        let io = IoContext::spawn().expect("io");
        let mut config = RpcConfig::default();
        config.connect_timeout = Duration::from_millis(200);
        let manager = ClientManager::new(io, ThreadPool::new(PoolConfig::default()), config);
        // Port 1 is essentially never listening.
        let result = manager.create_session("127.0.0.1", 1);
        assert!(result.is_err());
        manager.stop();
    }

    #[test]
    fn stopped_manager_refuses_sessions() {
        let io = IoContext::spawn().expect("io");
        let manager = ClientManager::new(
            io,
            ThreadPool::new(PoolConfig::default()),
            RpcConfig::default(),
        );
        manager.stop();
        assert!(matches!(
            manager.create_session("127.0.0.1", 65000),
            Err(RpcError::Cancelled)
        ));
    }
}
