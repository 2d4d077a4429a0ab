// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segment header layout.
//!
//! Every channel file starts with this fixed 64-byte header, followed by
//! the payload region. Multi-byte fields are little-endian in memory
//! (native on all supported targets):
//!
//! ```text
//! offset  size  field
//!      0     4  magic "ECAL"
//!      4     2  version
//!      6     2  header size (64)
//!      8     4  payload capacity (bytes following the header)
//!     12     4  payload length of the current message
//!     16     8  write counter / clock
//!     24     8  send timestamp (us since epoch, signed)
//!     32     8  publisher id
//!     40     8  flags (bit 0 zero-copy, bit 1 partial write in progress)
//!     48    16  reserved
//! ```
//!
//! Mutation happens under the channel's named mutex; the clock doubles as
//! the readers' publication marker, so it is stored last with Release.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Magic bytes at offset 0.
pub const SEGMENT_MAGIC: [u8; 4] = *b"ECAL";
/// Current layout version.
pub const SEGMENT_VERSION: u16 = 1;
/// Bytes occupied by [`SegmentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Writer allows in-place payload mutation (single-buffer rings only).
pub const FLAG_ZERO_COPY: u64 = 0b01;
/// A write is in progress; the payload region is not observable.
pub const FLAG_PARTIAL_WRITE: u64 = 0b10;

/// Fixed header at the start of every channel file.
#[repr(C)]
pub struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    header_size: u16,
    payload_capacity: AtomicU32,
    payload_len: AtomicU32,
    clock: AtomicU64,
    timestamp_us: AtomicI64,
    publisher_id: AtomicU64,
    flags: AtomicU64,
    _reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<SegmentHeader>() == 8);

/// Consistent view of one published message's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    /// Write counter at snapshot time (0 = nothing published yet).
    pub clock: u64,
    /// Send timestamp in microseconds since the epoch.
    pub timestamp_us: i64,
    /// Publishing entity's raw id.
    pub publisher_id: u64,
    /// Length of the current payload.
    pub payload_len: u32,
}

impl SegmentHeader {
    /// Initialize a freshly created (zeroed) header.
    pub fn init(&mut self, payload_capacity: u32, zero_copy: bool) {
        self.magic = SEGMENT_MAGIC;
        self.version = SEGMENT_VERSION;
        self.header_size = SEGMENT_HEADER_SIZE as u16;
        self.payload_capacity
            .store(payload_capacity, Ordering::Release);
        self.flags.store(
            if zero_copy { FLAG_ZERO_COPY } else { 0 },
            Ordering::Release,
        );
    }

    /// Check magic, version and header size.
    pub fn validate(&self) -> Result<(), String> {
        if self.magic != SEGMENT_MAGIC {
            return Err(format!("bad magic {:02x?}", self.magic));
        }
        if self.version != SEGMENT_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        if usize::from(self.header_size) != SEGMENT_HEADER_SIZE {
            return Err(format!("unexpected header size {}", self.header_size));
        }
        Ok(())
    }

    /// Payload region capacity in bytes.
    #[inline]
    pub fn payload_capacity(&self) -> u32 {
        self.payload_capacity.load(Ordering::Acquire)
    }

    /// Record a grown payload region.
    pub fn set_payload_capacity(&self, capacity: u32) {
        self.payload_capacity.store(capacity, Ordering::Release);
    }

    /// Current write counter.
    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Whether the zero-copy flag is set.
    #[inline]
    pub fn zero_copy(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_ZERO_COPY != 0
    }

    /// Mark the start of a write (payload region becomes unobservable).
    pub fn begin_write(&self) {
        self.flags.fetch_or(FLAG_PARTIAL_WRITE, Ordering::AcqRel);
    }

    /// Publish a finished write: length, timestamp, id, then the clock.
    pub fn commit_write(&self, payload_len: u32, clock: u64, timestamp_us: i64, publisher_id: u64) {
        self.payload_len.store(payload_len, Ordering::Release);
        self.timestamp_us.store(timestamp_us, Ordering::Release);
        self.publisher_id.store(publisher_id, Ordering::Release);
        self.flags.fetch_and(!FLAG_PARTIAL_WRITE, Ordering::AcqRel);
        self.clock.store(clock, Ordering::Release);
    }

    /// Snapshot the message metadata (caller holds the channel mutex).
    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            clock: self.clock.load(Ordering::Acquire),
            timestamp_us: self.timestamp_us.load(Ordering::Acquire),
            publisher_id: self.publisher_id.load(Ordering::Acquire),
            payload_len: self.payload_len.load(Ordering::Acquire),
        }
    }
}
