// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring of channel files owned by one writer.
//!
//! Slot names derive deterministically from the publisher's identity, so
//! readers reconstruct them from registration data without coordination.

use super::channel::ShmChannel;
use super::{Result, ShmError, MAX_BUFFER_COUNT};
use crate::core::entity::EntityId;

/// Base name shared by all of a publisher's slots.
#[must_use]
pub fn segment_base_name(host_name: &str, process_id: u32, entity: EntityId) -> String {
    super::channel_base_name(host_name, process_id, entity)
}

/// Name of one slot file.
#[must_use]
pub fn slot_name(base: &str, index: usize) -> String {
    format!("{base}_{index}")
}

/// Ordered set of channels a writer rotates through.
pub struct SegmentRing {
    channels: Vec<ShmChannel>,
}

impl SegmentRing {
    /// Create `count` channels named `<base>_0 .. <base>_{count-1}`.
    pub fn create(
        base: &str,
        count: usize,
        payload_capacity: usize,
        zero_copy: bool,
    ) -> Result<Self> {
        if count == 0 || count > MAX_BUFFER_COUNT {
            return Err(ShmError::InvalidBufferCount(count));
        }
        let mut channels = Vec::with_capacity(count);
        for index in 0..count {
            channels.push(ShmChannel::create(
                &slot_name(base, index),
                payload_capacity,
                zero_copy,
            )?);
        }
        Ok(Self { channels })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false (rings hold at least one slot).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Slot that holds (or will hold) the message with the given clock.
    ///
    /// Clocks start at 1, so clock c lands in slot `(c - 1) mod N`.
    pub fn slot_for_clock(&mut self, clock: u64) -> &mut ShmChannel {
        debug_assert!(clock > 0, "clocks start at 1");
        let idx = ((clock.saturating_sub(1)) % self.channels.len() as u64) as usize;
        &mut self.channels[idx]
    }

    /// All slot file names, ring order.
    #[must_use]
    pub fn slot_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmSegment;

    fn unique_base() -> String {
        format!(
            "ecal_test_ring_{}_{:08x}",
            std::process::id(),
            fastrand::u32(..)
        )
    }

    #[test]
    fn base_and_slot_names() {
        let base = segment_base_name("host", 42, EntityId::from_raw(0xff));
        assert_eq!(base, "ecal_host_42_00000000000000ff");
        assert_eq!(slot_name(&base, 3), "ecal_host_42_00000000000000ff_3");
    }

    #[test]
    fn create_makes_all_slots() {
        let base = unique_base();
        let ring = SegmentRing::create(&base, 3, 64, false).expect("create");
        assert_eq!(ring.len(), 3);
        for i in 0..3 {
            assert!(ShmSegment::exists(&slot_name(&base, i)));
        }
        drop(ring);
        for i in 0..3 {
            assert!(!ShmSegment::exists(&slot_name(&base, i)));
        }
    }

    #[test]
    fn rejects_invalid_buffer_counts() {
        let base = unique_base();
        assert!(matches!(
            SegmentRing::create(&base, 0, 64, false),
            Err(ShmError::InvalidBufferCount(0))
        ));
        assert!(matches!(
            SegmentRing::create(&base, 65, 64, false),
            Err(ShmError::InvalidBufferCount(65))
        ));
    }

    #[test]
    fn clock_to_slot_rotation() {
        let base = unique_base();
        let mut ring = SegmentRing::create(&base, 2, 64, false).expect("create");
        let s1 = ring.slot_for_clock(1).name().to_string();
        let s2 = ring.slot_for_clock(2).name().to_string();
        let s3 = ring.slot_for_clock(3).name().to_string();
        assert!(s1.ends_with("_0"));
        assert!(s2.ends_with("_1"));
        assert_eq!(s1, s3);
    }
}
