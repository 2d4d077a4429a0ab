// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity identity types.
//!
//! Every publisher, subscriber, server and client instance is identified by
//! an [`EntityId`] that is unique for the lifetime of the creating process.
//! Ids are synthesized locally (no coordination) from the process id, a
//! monotonically increasing counter and a per-process random salt.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// 64-bit opaque unique entity identifier.
///
/// Never reused within a process lifetime; displayed as 16 lowercase hex
/// digits (the form used in shared memory segment names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

/// Process-local allocation counter. Starts at 1 so the zero id stays free
/// as a sentinel.
static NEXT_ENTITY: AtomicU64 = AtomicU64::new(1);

/// Per-process random salt, mixed into every id.
static PROCESS_SALT: OnceLock<u64> = OnceLock::new();

fn process_salt() -> u64 {
    *PROCESS_SALT.get_or_init(|| {
        // /dev/urandom is the source of truth; the timestamp fallback only
        // matters on exotic platforms without it.
        use std::io::Read;
        let mut buf = [0u8; 8];
        let read_ok = std::fs::File::open("/dev/urandom")
            .and_then(|mut f| f.read_exact(&mut buf))
            .is_ok();
        if read_ok {
            return u64::from_le_bytes(buf);
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        now.as_nanos() as u64
    })
}

impl EntityId {
    /// Allocate a fresh id, unique within this process.
    ///
    /// The counter occupies the low bits via wrapping addition, so two ids
    /// allocated by the same process can never collide.
    #[must_use]
    pub fn generate() -> Self {
        let counter = NEXT_ENTITY.fetch_add(1, Ordering::Relaxed);
        let base = process_salt() ^ (u64::from(std::process::id()) << 32);
        Self(base.wrapping_add(counter))
    }

    /// Reconstruct an id received over the wire.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit value (wire representation).
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The all-zero sentinel id (never allocated by [`EntityId::generate`]).
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies one publisher or subscriber instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    /// Host the instance lives on
    pub host_name: String,
    /// Process id on that host
    pub process_id: u32,
    /// Unique entity id within that process
    pub entity: EntityId,
    /// Topic name
    pub topic_name: String,
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.host_name, self.process_id, self.entity, self.topic_name
        )
    }
}

/// Identifies one server or client instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    /// Host the instance lives on
    pub host_name: String,
    /// Process id on that host
    pub process_id: u32,
    /// Unique entity id within that process
    pub entity: EntityId,
    /// Service name
    pub service_name: String,
}

/// Opaque payload type description, compared bytewise.
///
/// The core never interprets these fields; they travel in registration
/// samples so peers can reject mismatched endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTypeInformation {
    /// Serialization encoding (e.g. "raw", "proto")
    pub encoding: String,
    /// Type name within that encoding
    pub type_name: String,
    /// Opaque descriptor blob (schema, message descriptor, ...)
    pub descriptor: Vec<u8>,
}

impl DataTypeInformation {
    /// A raw-bytes type with no schema.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            encoding: "raw".to_string(),
            ..Self::default()
        }
    }
}
