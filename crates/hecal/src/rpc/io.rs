// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared I/O event loop for RPC sessions.
//!
//! One thread drives a `mio::Poll` instance handling every listener and
//! session socket in the process:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        hecal-rpcio                            |
//! |  mio::Poll                                                    |
//! |   - Waker          <- commands from managers / pool jobs      |
//! |   - TcpListeners   -> accept server sessions                  |
//! |   - TcpStreams     -> read frames / flush write buffers       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Frames are decoded incrementally and handed to the owning side
//! (`ServerCore` or `SessionCore`); handler execution happens on the
//! thread pool, never on this thread. Stopping the context cancels all
//! outstanding I/O and notifies every session; the context is one-shot.

use super::client::SessionCore;
use super::error::RpcError;
use super::protocol::{Frame, FrameDecoder, MessageType};
use super::server::ServerCore;
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const WAKER_TOKEN: Token = Token(0);
const MAX_EVENTS: usize = 256;
const READ_CHUNK: usize = 16 * 1024;

/// Commands accepted by the event loop.
pub(crate) enum IoCmd {
    /// Start accepting sessions for a server.
    AddListener {
        listener: TcpListener,
        server: Arc<ServerCore>,
    },
    /// Register an already-connected client session socket.
    AddClient {
        stream: TcpStream,
        session: Arc<SessionCore>,
    },
    /// Queue bytes on a connection.
    Send { token: usize, bytes: Vec<u8> },
    /// Drop a connection without notifying its owner.
    Close { token: usize },
}

/// Cheap handle for posting commands into the loop from any thread.
#[derive(Clone)]
pub(crate) struct IoSender {
    tx: Sender<IoCmd>,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
}

impl IoSender {
    /// Post a command; false once the context is stopped.
    pub(crate) fn send(&self, cmd: IoCmd) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.send(cmd).is_err() {
            return false;
        }
        self.waker.wake().is_ok()
    }
}

/// Reply path handed to server frame handlers.
#[derive(Clone)]
pub(crate) struct ReplyHandle {
    token: usize,
    sender: IoSender,
}

impl ReplyHandle {
    /// Send a response frame back on the originating session.
    pub(crate) fn respond(&self, payload: &[u8]) {
        let bytes = Frame::encode(MessageType::Response, payload);
        self.sender.send(IoCmd::Send {
            token: self.token,
            bytes,
        });
    }
}

/// Owner of the event loop thread. One per process; one-shot.
pub struct IoContext {
    sender: IoSender,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoContext {
    /// Start the loop thread.
    pub fn spawn() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();

        let sender = IoSender {
            tx,
            waker,
            stopped: Arc::clone(&stopped),
        };

        let loop_sender = sender.clone();
        let handle = std::thread::Builder::new()
            .name("hecal-rpcio".to_string())
            .spawn(move || {
                EventLoop::new(poll, rx, loop_sender, stopped).run();
            })?;

        Ok(Arc::new(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn sender(&self) -> IoSender {
        self.sender.clone()
    }

    /// Whether `stop` ran.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.sender.stopped.load(Ordering::Acquire)
    }

    /// Cancel all outstanding I/O and join the loop thread. One-shot: a
    /// stopped context cannot be restarted.
    pub fn stop(&self) {
        if self.sender.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.waker.wake().ok();
        if let Some(handle) = self.handle.lock().take() {
            handle.join().ok();
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Peer {
    Server(Arc<ServerCore>),
    Client(Arc<SessionCore>),
}

struct Conn {
    stream: TcpStream,
    decoder: FrameDecoder,
    out: Vec<u8>,
    out_pos: usize,
    peer: Peer,
}

/// What to do with a connection after one read pass.
enum ReadOutcome {
    /// Socket drained for now.
    Done,
    /// More data may be pending; read again.
    Again,
    /// Tear the connection down.
    Close(RpcError),
}

struct EventLoop {
    poll: Poll,
    rx: Receiver<IoCmd>,
    sender: IoSender,
    stopped: Arc<AtomicBool>,
    conns: HashMap<usize, Conn>,
    listeners: HashMap<usize, (TcpListener, Arc<ServerCore>)>,
    next_token: usize,
}

impl EventLoop {
    fn new(
        poll: Poll,
        rx: Receiver<IoCmd>,
        sender: IoSender,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            rx,
            sender,
            stopped,
            conns: HashMap::new(),
            listeners: HashMap::new(),
            next_token: 1, // 0 is the waker
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(e) = self
                .poll
                .poll(&mut events, Some(Duration::from_millis(100)))
            {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[RPC] poll failed, stopping loop: {e}");
                break;
            }

            for event in &events {
                match event.token() {
                    WAKER_TOKEN => self.drain_cmds(),
                    Token(t) if self.listeners.contains_key(&t) => self.accept_all(t),
                    Token(t) => {
                        if event.is_readable() {
                            self.read_conn(t);
                        }
                        if event.is_writable() {
                            self.flush_conn(t);
                        }
                    }
                }
            }
            // Commands may arrive while the waker edge was already consumed.
            self.drain_cmds();
        }
        self.shutdown_all();
    }

    fn alloc_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn drain_cmds(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                IoCmd::AddListener {
                    mut listener,
                    server,
                } => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut listener,
                        Token(token),
                        Interest::READABLE,
                    ) {
                        log::error!("[RPC] listener registration failed: {e}");
                        continue;
                    }
                    self.listeners.insert(token, (listener, server));
                }
                IoCmd::AddClient {
                    mut stream,
                    session,
                } => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(token),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        session.on_disconnect(&RpcError::Io(e));
                        continue;
                    }
                    session.on_connected(token, self.sender.clone());
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            decoder: FrameDecoder::new(),
                            out: Vec::new(),
                            out_pos: 0,
                            peer: Peer::Client(session),
                        },
                    );
                }
                IoCmd::Send { token, bytes } => {
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.out.extend_from_slice(&bytes);
                        self.flush_conn(token);
                    }
                }
                IoCmd::Close { token } => {
                    if let Some(mut conn) = self.conns.remove(&token) {
                        self.poll.registry().deregister(&mut conn.stream).ok();
                    }
                }
            }
        }
    }

    fn accept_all(&mut self, listener_token: usize) {
        loop {
            let accepted = {
                let Some((listener, server)) = self.listeners.get(&listener_token) else {
                    return;
                };
                match listener.accept() {
                    Ok((stream, addr)) => Ok((stream, addr, Arc::clone(server))),
                    Err(e) => Err(e),
                }
            };
            match accepted {
                Ok((mut stream, addr, server)) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(token),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::debug!("[RPC] registering session from {addr} failed: {e}");
                        continue;
                    }
                    log::debug!("[RPC] accepted session from {addr}");
                    server.on_connect();
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            decoder: FrameDecoder::new(),
                            out: Vec::new(),
                            out_pos: 0,
                            peer: Peer::Server(server),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::debug!("[RPC] accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn read_conn(&mut self, token: usize) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let outcome = {
                let Some(conn) = self.conns.get_mut(&token) else {
                    return;
                };
                read_pass(conn, token, &self.sender, &mut buf)
            };
            match outcome {
                ReadOutcome::Again => {}
                ReadOutcome::Done => return,
                ReadOutcome::Close(reason) => {
                    self.close_conn(token, &reason);
                    return;
                }
            }
        }
    }

    fn flush_conn(&mut self, token: usize) {
        let result = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            flush_pass(conn)
        };
        if let Err(reason) = result {
            self.close_conn(token, &reason);
        }
    }

    fn close_conn(&mut self, token: usize, reason: &RpcError) {
        if let Some(mut conn) = self.conns.remove(&token) {
            self.poll.registry().deregister(&mut conn.stream).ok();
            match conn.peer {
                Peer::Server(server) => server.on_disconnect(),
                Peer::Client(session) => session.on_disconnect(reason),
            }
        }
    }

    fn shutdown_all(&mut self) {
        let tokens: Vec<usize> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_conn(token, &RpcError::Cancelled);
        }
        self.listeners.clear();
    }
}

/// One non-blocking read plus frame decoding.
fn read_pass(
    conn: &mut Conn,
    token: usize,
    sender: &IoSender,
    buf: &mut [u8],
) -> ReadOutcome {
    match conn.stream.read(buf) {
        Ok(0) => ReadOutcome::Close(RpcError::Io(io::ErrorKind::UnexpectedEof.into())),
        Ok(n) => {
            let mut input = &buf[..n];
            while !input.is_empty() {
                match conn.decoder.decode(&mut input) {
                    Ok(Some(frame)) => dispatch_frame(&conn.peer, token, sender, frame),
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("[RPC] framing error on session {token}: {e}");
                        return ReadOutcome::Close(RpcError::Protocol(e.to_string()));
                    }
                }
            }
            ReadOutcome::Again
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Done,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Again,
        Err(e) => ReadOutcome::Close(RpcError::Io(e)),
    }
}

/// Flush the pending write buffer; Err means the connection died.
fn flush_pass(conn: &mut Conn) -> Result<(), RpcError> {
    while conn.out_pos < conn.out.len() {
        match conn.stream.write(&conn.out[conn.out_pos..]) {
            Ok(n) => conn.out_pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(RpcError::Io(e)),
        }
    }
    if conn.out_pos == conn.out.len() {
        conn.out.clear();
        conn.out_pos = 0;
    }
    Ok(())
}

fn dispatch_frame(peer: &Peer, token: usize, sender: &IoSender, frame: Frame) {
    match peer {
        Peer::Server(server) => {
            if frame.header.message_type == MessageType::Request {
                server.on_frame(
                    ReplyHandle {
                        token,
                        sender: sender.clone(),
                    },
                    frame,
                );
            } else {
                log::debug!(
                    "[RPC] unexpected {:?} frame on server session {token}",
                    frame.header.message_type
                );
            }
        }
        Peer::Client(session) => {
            if frame.header.message_type == MessageType::Response {
                session.on_frame(frame);
            } else {
                log::debug!(
                    "[RPC] unexpected {:?} frame on client session {token}",
                    frame.header.message_type
                );
            }
        }
    }
}
