// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory transport.
//!
//! One publisher owns a ring of channel files; each channel is a single
//! memory-mapped file (64-byte header + payload region) with a pair of
//! named events and a named mutex next to it.
//!
//! ```text
//! +------------------+                    +------------------+
//! |   Process A      |  ecal_<h>_<p>_<e>_0|   Process B      |
//! |    ShmWriter  ---+--> [hdr|payload] --+-->  ShmReader    |
//! |                  |  ecal_.._0_w  (written event)         |
//! |                  |  ecal_.._0_r  (read-ack event)        |
//! |                  |  ecal_.._0_mtx (header mutex)         |
//! +------------------+                    +------------------+
//! ```
//!
//! The writer rotates through the ring (`slot = counter mod N`); readers
//! follow the clock and detect drops from gaps. With a single buffer and
//! zero-copy enabled, repeat writes mutate the payload region in place.

mod channel;
mod header;
mod reader;
mod ring;
mod segment;
mod writer;

pub use channel::{AckHandle, ReceivedPayload, ShmChannel, WriteMeta};
pub use header::{
    HeaderSnapshot, SegmentHeader, FLAG_PARTIAL_WRITE, FLAG_ZERO_COPY, SEGMENT_HEADER_SIZE,
    SEGMENT_MAGIC, SEGMENT_VERSION,
};
pub use reader::{ShmReader, ShmReaderOptions, ShmSink};
pub use ring::{segment_base_name, slot_name, SegmentRing};
pub use segment::ShmSegment;
pub use writer::{ShmWriter, ShmWriterOptions};

use crate::core::entity::EntityId;
use std::fmt;
use std::io;

/// Largest supported ring.
pub const MAX_BUFFER_COUNT: usize = 64;

/// Suffix of the written event next to a channel file.
pub const WRITTEN_SUFFIX: &str = "_w";
/// Suffix of the read-ack event next to a channel file.
pub const READ_ACK_SUFFIX: &str = "_r";
/// Suffix of the header mutex next to a channel file.
pub const MUTEX_SUFFIX: &str = "_mtx";

/// Errors from shared memory operations.
#[derive(Debug)]
pub enum ShmError {
    /// Segment creation failed.
    SegmentCreate(io::Error),

    /// Segment open failed.
    SegmentOpen(io::Error),

    /// Memory mapping failed.
    Mmap(io::Error),

    /// Invalid segment name.
    InvalidName(String),

    /// Segment not found.
    NotFound(String),

    /// Header failed validation (bad magic/version/size).
    InvalidHeader(String),

    /// Header mutex could not be acquired within the lock timeout.
    LockTimeout,

    /// Ring sizing outside `1..=64`.
    InvalidBufferCount(usize),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::InvalidHeader(msg) => write!(f, "invalid segment header: {msg}"),
            Self::LockTimeout => write!(f, "segment mutex acquisition timed out"),
            Self::InvalidBufferCount(n) => {
                write!(f, "buffer count {n} outside 1..={MAX_BUFFER_COUNT}")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Payload source for writes that build the message in place.
///
/// `write_full` populates a fresh payload region; `write_modify` patches an
/// already initialized region (only ever called for single-buffer zero-copy
/// rings, where the previous payload is still present).
pub trait PayloadWriter {
    /// Number of bytes the payload needs.
    fn size(&self) -> usize;

    /// Fill a fresh buffer of at least [`PayloadWriter::size`] bytes.
    /// Returns false to abort the write.
    fn write_full(&mut self, buf: &mut [u8]) -> bool;

    /// Patch a buffer still holding the previous payload.
    fn write_modify(&mut self, buf: &mut [u8]) -> bool {
        self.write_full(buf)
    }
}

/// Cleanup stale channel files left behind by crashed processes.
///
/// Scans `/dev/shm` for this host's naming scheme and unlinks files whose
/// creating process is gone. Called at node startup.
///
/// Returns the number of files removed.
pub fn cleanup_stale_segments(host_name: &str) -> usize {
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    let prefix = format!("ecal_{host_name}_");
    let mut cleaned = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        // Layout after the prefix: <pid>_<entity_hex>_<slot>[suffix]
        let Some(pid) = rest.split('_').next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        if crate::core::process::process_alive(pid) {
            continue;
        }
        if ShmSegment::unlink(name).is_ok() {
            log::debug!("[SHM] cleaned up stale segment {name} (pid {pid} gone)");
            cleaned += 1;
        }
    }
    cleaned
}

/// Derive the base segment name for a publisher.
///
/// Slot files append `_<index>`; events and the mutex append their own
/// suffixes. Names are globally stable for the publisher's lifetime.
#[must_use]
pub fn channel_base_name(host_name: &str, process_id: u32, entity: EntityId) -> String {
    format!("ecal_{host_name}_{process_id}_{entity}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_format() {
        let entity = EntityId::from_raw(0xab);
        assert_eq!(
            channel_base_name("box", 1234, entity),
            "ecal_box_1234_00000000000000ab"
        );
    }

    #[test]
    fn cleanup_ignores_live_processes() {
        let host = crate::core::process::host_name();
        let name = format!(
            "ecal_{host}_{}_{}_0",
            std::process::id(),
            EntityId::generate()
        );
        let _seg = ShmSegment::create(&name, 128).expect("create");
        // Our own pid is alive, so the file must survive the sweep.
        cleanup_stale_segments(host);
        assert!(ShmSegment::exists(&name));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn cleanup_removes_dead_owners() {
        let host = crate::core::process::host_name();
        // Fake a file from a pid that cannot exist.
        let name = format!("ecal_{host}_99999999_00000000000000aa_0");
        let _seg = ShmSegment::create(&name, 128).expect("create");
        let cleaned = cleanup_stale_segments(host);
        assert!(cleaned >= 1);
        assert!(!ShmSegment::exists(&name));
    }
}
