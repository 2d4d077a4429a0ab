// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload transport variants.
//!
//! A publisher fans every send out to its enabled layers; a subscriber
//! holds at most one attachment per matched publisher. The capability set
//! is uniform: write on the sending side, attach/detach on the receiving
//! side.
//!
//! - **Shm**: the ring of channel files (same host only).
//! - **Udp**: multicast datagrams with a compact per-fragment header.
//! - **Tcp**: the publisher listens; subscribers connect and receive
//!   notify frames (RPC framing, message type 3).

use crate::rpc::{Frame, FrameDecoder, MessageType};
use crate::shm::{
    AckHandle, PayloadWriter, ReceivedPayload, ShmReader, ShmReaderOptions, ShmSink, ShmWriter,
    ShmWriterOptions, WriteMeta,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// FNV-1a over a topic name; used to filter multicast payload traffic.
#[must_use]
pub fn topic_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ===== UDP payload framing =====

const UDP_MAGIC: [u8; 2] = *b"EP";
const UDP_HEADER_LEN: usize = 40;
const UDP_FRAGMENT_PAYLOAD: usize = 60 * 1024;

fn encode_udp_fragment(
    topic: u64,
    meta: &WriteMeta,
    index: u8,
    total: u8,
    chunk: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(UDP_HEADER_LEN + chunk.len());
    out.extend_from_slice(&UDP_MAGIC);
    out.push(index);
    out.push(total);
    out.extend_from_slice(&[0u8; 4]); // reserved, keeps the header at 40
    out.extend_from_slice(&topic.to_le_bytes());
    out.extend_from_slice(&meta.publisher_id.to_le_bytes());
    out.extend_from_slice(&meta.clock.to_le_bytes());
    out.extend_from_slice(&meta.timestamp_us.to_le_bytes());
    out.extend_from_slice(chunk);
    out
}

struct UdpFragment<'a> {
    index: u8,
    total: u8,
    topic: u64,
    publisher_id: u64,
    clock: u64,
    timestamp_us: i64,
    chunk: &'a [u8],
}

fn parse_udp_fragment(datagram: &[u8]) -> Option<UdpFragment<'_>> {
    if datagram.len() < UDP_HEADER_LEN || datagram[0..2] != UDP_MAGIC {
        return None;
    }
    let u64_at = |o: usize| {
        u64::from_le_bytes(datagram[o..o + 8].try_into().unwrap_or([0; 8]))
    };
    Some(UdpFragment {
        index: datagram[2],
        total: datagram[3],
        topic: u64_at(8),
        publisher_id: u64_at(16),
        clock: u64_at(24),
        timestamp_us: u64_at(32) as i64,
        chunk: &datagram[UDP_HEADER_LEN..],
    })
}

// ===== TCP payload framing (notify frames) =====

const TCP_META_LEN: usize = 24;

fn encode_tcp_payload(meta: &WriteMeta, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(TCP_META_LEN + payload.len());
    body.extend_from_slice(&meta.publisher_id.to_le_bytes());
    body.extend_from_slice(&meta.clock.to_le_bytes());
    body.extend_from_slice(&meta.timestamp_us.to_le_bytes());
    body.extend_from_slice(payload);
    Frame::encode(MessageType::Notify, &body)
}

fn decode_tcp_payload(body: &[u8]) -> Option<ReceivedPayload> {
    if body.len() < TCP_META_LEN {
        return None;
    }
    let u64_at =
        |o: usize| u64::from_le_bytes(body[o..o + 8].try_into().unwrap_or([0; 8]));
    Some(ReceivedPayload {
        publisher_id: u64_at(0),
        clock: u64_at(8),
        timestamp_us: u64_at(16) as i64,
        data: body[TCP_META_LEN..].to_vec(),
    })
}

// ===== writer side =====

/// UDP multicast payload writer.
pub struct UdpPayloadWriter {
    socket: UdpSocket,
    destination: SocketAddr,
    group: Ipv4Addr,
    port: u16,
    topic: u64,
}

impl UdpPayloadWriter {
    /// Open an ephemeral send socket targeting the payload group.
    pub fn create(group: Ipv4Addr, port: u16, topic_name: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        Ok(Self {
            socket,
            destination: SocketAddr::V4(SocketAddrV4::new(group, port)),
            group,
            port,
            topic: topic_hash(topic_name),
        })
    }

    fn write(&self, payload: &[u8], meta: &WriteMeta) -> io::Result<usize> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(UDP_FRAGMENT_PAYLOAD).collect()
        };
        let total = chunks.len() as u8;
        for (index, chunk) in chunks.iter().enumerate() {
            let datagram =
                encode_udp_fragment(self.topic, meta, index as u8, total, chunk);
            self.socket.send_to(&datagram, self.destination)?;
        }
        Ok(payload.len())
    }

    /// Group/port for the registration descriptor.
    #[must_use]
    pub fn endpoint(&self) -> (Ipv4Addr, u16) {
        (self.group, self.port)
    }
}

/// TCP payload writer: accepts subscriber connections, pushes frames.
pub struct TcpPayloadWriter {
    port: u16,
    sinks: Arc<parking_lot::Mutex<Vec<TcpStream>>>,
    cancel: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl TcpPayloadWriter {
    /// Bind an ephemeral listener and start accepting subscribers.
    pub fn create() -> io::Result<Self> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let sinks: Arc<parking_lot::Mutex<Vec<TcpStream>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_sinks = Arc::clone(&sinks);
        let thread_cancel = Arc::clone(&cancel);
        let accept_handle = std::thread::Builder::new()
            .name("hecal-tcptx".to_string())
            .spawn(move || {
                while !thread_cancel.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            log::debug!("[TCP] payload subscriber from {addr}");
                            stream.set_nodelay(true).ok();
                            thread_sinks.lock().push(stream);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            log::debug!("[TCP] payload accept failed: {e}");
                            std::thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            })?;

        Ok(Self {
            port,
            sinks,
            cancel,
            accept_handle: Some(accept_handle),
        })
    }

    fn write(&self, payload: &[u8], meta: &WriteMeta) -> io::Result<usize> {
        let frame = encode_tcp_payload(meta, payload);
        let mut sinks = self.sinks.lock();
        // Dead subscribers drop out on write failure.
        sinks.retain_mut(|stream| stream.write_all(&frame).is_ok());
        Ok(payload.len())
    }

    /// Listening port for the registration descriptor.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for TcpPayloadWriter {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.accept_handle.take() {
            handle.join().ok();
        }
    }
}

/// Tagged transport variant on the writer side.
pub enum WriterTransport {
    /// Shared memory ring.
    Shm(ShmWriter),
    /// UDP multicast datagrams.
    Udp(UdpPayloadWriter),
    /// TCP push stream.
    Tcp(TcpPayloadWriter),
}

impl WriterTransport {
    /// Publish one message on this layer.
    pub fn write(&mut self, payload: &[u8], meta: &WriteMeta) -> io::Result<usize> {
        match self {
            Self::Shm(writer) => writer
                .send(payload, meta.clock, meta.timestamp_us)
                .map_err(|e| io::Error::other(e.to_string())),
            Self::Udp(writer) => writer.write(payload, meta),
            Self::Tcp(writer) => writer.write(payload, meta),
        }
    }

    /// Publish via a payload writer callback (in-place for shm; other
    /// layers materialize the payload first).
    pub fn write_with(
        &mut self,
        payload_writer: &mut dyn PayloadWriter,
        meta: &WriteMeta,
    ) -> io::Result<usize> {
        match self {
            Self::Shm(writer) => writer
                .send_with(payload_writer, meta.clock, meta.timestamp_us)
                .map_err(|e| io::Error::other(e.to_string())),
            Self::Udp(_) | Self::Tcp(_) => {
                let mut buf = vec![0u8; payload_writer.size()];
                if !payload_writer.write_full(&mut buf) {
                    return Ok(0);
                }
                self.write(&buf, meta)
            }
        }
    }
}

// ===== reader side =====

/// Sink shared by all reader attachments (same shape as the shm sink).
pub type PayloadSink = ShmSink;

/// UDP multicast payload reader thread.
pub struct UdpPayloadReader {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpPayloadReader {
    /// Join the payload group and deliver matching messages to `sink`.
    pub fn attach(
        group: Ipv4Addr,
        port: u16,
        topic_name: &str,
        publisher_id: u64,
        sink: PayloadSink,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        crate::registry::set_reuseport(&socket)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
        let socket: UdpSocket = socket.into();
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED).ok();
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let topic = topic_hash(topic_name);
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name("hecal-udprx".to_string())
            .spawn(move || {
                udp_recv_loop(&socket, topic, publisher_id, &sink, &thread_cancel);
            })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stop the receive thread.
    pub fn detach(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for UdpPayloadReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn udp_recv_loop(
    socket: &UdpSocket,
    topic: u64,
    publisher_id: u64,
    sink: &PayloadSink,
    cancel: &AtomicBool,
) {
    let mut buf = vec![0u8; UDP_HEADER_LEN + UDP_FRAGMENT_PAYLOAD];
    let mut assembly: Vec<u8> = Vec::new();
    let mut next_index = 0u8;
    let mut first: Option<(u64, i64)> = None; // (clock, timestamp) of fragment 0

    while !cancel.load(Ordering::Acquire) {
        let len = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[UDP] payload recv failed: {e}");
                continue;
            }
        };
        let Some(frag) = parse_udp_fragment(&buf[..len]) else {
            continue;
        };
        if frag.topic != topic || frag.publisher_id != publisher_id {
            continue;
        }

        if frag.total == 1 {
            sink(
                ReceivedPayload {
                    data: frag.chunk.to_vec(),
                    publisher_id: frag.publisher_id,
                    timestamp_us: frag.timestamp_us,
                    clock: frag.clock,
                },
                AckHandle::none(),
            );
            continue;
        }

        // Multi-fragment: in-order assembly, reset on any gap.
        if frag.index == 0 {
            assembly.clear();
            next_index = 0;
            first = Some((frag.clock, frag.timestamp_us));
        }
        if frag.index != next_index || first.is_none() {
            assembly.clear();
            next_index = 0;
            first = None;
            continue;
        }
        assembly.extend_from_slice(frag.chunk);
        next_index += 1;
        if next_index == frag.total {
            let (clock, timestamp_us) = first.take().unwrap_or((frag.clock, frag.timestamp_us));
            sink(
                ReceivedPayload {
                    data: std::mem::take(&mut assembly),
                    publisher_id: frag.publisher_id,
                    timestamp_us,
                    clock,
                },
                AckHandle::none(),
            );
            next_index = 0;
        }
    }
}

/// TCP payload reader thread (connects to the publisher's listener).
pub struct TcpPayloadReader {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TcpPayloadReader {
    /// Connect and deliver notify frames to `sink`.
    pub fn attach(
        host: &str,
        port: u16,
        publisher_id: u64,
        sink: PayloadSink,
    ) -> io::Result<Self> {
        use std::net::ToSocketAddrs;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2))?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name("hecal-tcprx".to_string())
            .spawn(move || {
                tcp_recv_loop(stream, publisher_id, &sink, &thread_cancel);
            })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stop the receive thread.
    pub fn detach(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for TcpPayloadReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tcp_recv_loop(
    mut stream: TcpStream,
    publisher_id: u64,
    sink: &PayloadSink,
    cancel: &AtomicBool,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 16 * 1024];
    while !cancel.load(Ordering::Acquire) {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::debug!("[TCP] payload stream closed by publisher");
                return;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[TCP] payload read failed: {e}");
                return;
            }
        };
        let mut input = &buf[..n];
        loop {
            match decoder.decode(&mut input) {
                Ok(Some(frame)) if frame.header.message_type == MessageType::Notify => {
                    if let Some(msg) = decode_tcp_payload(&frame.payload) {
                        if msg.publisher_id == publisher_id {
                            sink(msg, AckHandle::none());
                        }
                    }
                }
                Ok(Some(_)) => {} // foreign frame kind, skip
                Ok(None) => break,
                Err(e) => {
                    log::debug!("[TCP] payload framing error: {e}");
                    return;
                }
            }
        }
    }
}

/// Tagged transport variant on the reader side.
pub enum ReaderAttachment {
    /// Shared memory wait loop.
    Shm(ShmReader),
    /// UDP multicast receiver.
    Udp(UdpPayloadReader),
    /// TCP stream receiver.
    Tcp(TcpPayloadReader),
}

impl ReaderAttachment {
    /// Stop the attachment's thread.
    pub fn detach(self) {
        match self {
            Self::Shm(reader) => reader.detach(),
            Self::Udp(reader) => reader.detach(),
            Self::Tcp(reader) => reader.detach(),
        }
    }

    /// Messages this attachment observed as lost (shm only).
    #[must_use]
    pub fn drops(&self) -> u64 {
        match self {
            Self::Shm(reader) => reader.drops(),
            Self::Udp(_) | Self::Tcp(_) => 0,
        }
    }

    /// Whether the attachment gave up on its writer.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        match self {
            Self::Shm(reader) => reader.is_detached(),
            Self::Udp(_) | Self::Tcp(_) => false,
        }
    }
}

/// Reader options derived from the node configuration.
#[must_use]
pub fn shm_reader_options(ttl: Duration) -> ShmReaderOptions {
    ShmReaderOptions {
        detach_after: ttl,
        ..Default::default()
    }
}

/// Writer options derived from the shm transport configuration.
#[must_use]
pub fn shm_writer_options(shm: &crate::config::ShmConfig) -> ShmWriterOptions {
    ShmWriterOptions {
        buffer_count: shm.buffer_count,
        zero_copy: shm.zero_copy,
        ack_timeout: shm.ack_timeout,
        initial_capacity: shm.initial_capacity,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn topic_hash_is_stable_and_distinct() {
        assert_eq!(topic_hash("a"), topic_hash("a"));
        assert_ne!(topic_hash("a"), topic_hash("b"));
    }

    fn meta(clock: u64) -> WriteMeta {
        WriteMeta {
            clock,
            timestamp_us: 777,
            publisher_id: 11,
        }
    }

    #[test]
    fn udp_fragment_roundtrip() {
        let frag = encode_udp_fragment(5, &meta(3), 0, 1, b"payload");
        let parsed = parse_udp_fragment(&frag).expect("parse");
        assert_eq!(parsed.topic, 5);
        assert_eq!(parsed.publisher_id, 11);
        assert_eq!(parsed.clock, 3);
        assert_eq!(parsed.timestamp_us, 777);
        assert_eq!(parsed.chunk, b"payload");
    }

    #[test]
    fn tcp_payload_roundtrip() {
        let frame_bytes = encode_tcp_payload(&meta(9), b"bytes");
        let mut decoder = FrameDecoder::new();
        let mut input: &[u8] = &frame_bytes;
        let frame = decoder.decode(&mut input).expect("ok").expect("frame");
        assert_eq!(frame.header.message_type, MessageType::Notify);
        let msg = decode_tcp_payload(&frame.payload).expect("decode");
        assert_eq!(msg.clock, 9);
        assert_eq!(msg.publisher_id, 11);
        assert_eq!(msg.data, b"bytes");
    }

    #[test]
    fn udp_writer_reader_deliver_message() {
        let group = Ipv4Addr::new(239, 0, 0, 2);
        let port = 24_201;
        let writer = UdpPayloadWriter::create(group, port, "t").expect("writer");

        let (tx, rx) = mpsc::channel();
        let sink: PayloadSink = Arc::new(move |msg, _ack| {
            tx.send(msg).ok();
        });
        let reader = UdpPayloadReader::attach(group, port, "t", 11, sink).expect("reader");
        std::thread::sleep(Duration::from_millis(100));

        writer.write(b"hello udp", &meta(1)).expect("write");
        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        assert_eq!(msg.data, b"hello udp");
        assert_eq!(msg.clock, 1);
        reader.detach();
    }

    #[test]
    fn udp_large_payload_fragments() {
        let group = Ipv4Addr::new(239, 0, 0, 2);
        let port = 24_202;
        let writer = UdpPayloadWriter::create(group, port, "big").expect("writer");

        let (tx, rx) = mpsc::channel();
        let sink: PayloadSink = Arc::new(move |msg, _ack| {
            tx.send(msg).ok();
        });
        let reader = UdpPayloadReader::attach(group, port, "big", 11, sink).expect("reader");
        std::thread::sleep(Duration::from_millis(100));

        let payload = vec![0x7F; 150 * 1024];
        writer.write(&payload, &meta(1)).expect("write");
        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        assert_eq!(msg.data.len(), payload.len());
        assert_eq!(msg.data, payload);
        reader.detach();
    }

    #[test]
    fn tcp_writer_reader_deliver_messages_in_order() {
        let writer = TcpPayloadWriter::create().expect("writer");
        let (tx, rx) = mpsc::channel();
        let sink: PayloadSink = Arc::new(move |msg, _ack| {
            tx.send(msg).ok();
        });
        let reader =
            TcpPayloadReader::attach("127.0.0.1", writer.port(), 11, sink).expect("reader");
        // Let the accept thread pick the connection up.
        std::thread::sleep(Duration::from_millis(200));

        writer.write(b"one", &meta(1)).expect("write");
        writer.write(b"two", &meta(2)).expect("write");

        let first = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        assert_eq!(first.data, b"one");
        assert_eq!(first.clock, 1);
        assert_eq!(second.data, b"two");
        assert_eq!(second.clock, 2);
        reader.detach();
    }
}
