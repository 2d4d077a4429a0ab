// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe facades over the transport layers.
//!
//! ```text
//! Publisher::send ----+--> Shm ring  --(written event)--> ShmReader ---+
//!                     +--> Udp datagrams ---------------> UdpReader ---+--> per-source
//!                     +--> Tcp notify frames -----------> TcpReader ---+    queue -> pool
//!                                                                          -> user callback
//! ```
//!
//! Matching is driven entirely by the registry: subscribers attach to
//! publishers (and publishers count subscribers) based on new/deleted
//! entity events for their topic name.

pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use publisher::Publisher;
pub use subscriber::Subscriber;
pub use transport::{ReaderAttachment, WriterTransport};

/// Payload view handed to receive callbacks.
///
/// The buffer is only valid for the duration of the callback.
#[derive(Debug)]
pub struct ReceiveData<'a> {
    /// Payload bytes.
    pub buffer: &'a [u8],
    /// Publishing entity's raw id.
    pub id: u64,
    /// Publisher send time in microseconds since the epoch.
    pub time_us: i64,
    /// Publisher send clock.
    pub clock: u64,
}

/// Publisher-side match events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherEvent {
    /// A matching subscriber appeared.
    Connected,
    /// A matching subscriber went away.
    Disconnected,
    /// Messages were not acknowledged in time.
    Dropped(u64),
}

/// Subscriber-side events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// A matching publisher appeared.
    Connected,
    /// A matching publisher went away.
    Disconnected,
    /// Messages were lost (clock gap).
    Dropped(u64),
    /// A message failed validation and was discarded.
    Corrupted,
}
