// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory writer: ring rotation, write modes and acknowledge mode.
//!
//! Write mode selection:
//!
//! - single buffer + zero-copy: first write is a *full* write, every later
//!   write is a *modify* write patching the payload region in place
//! - anything else: every write is a full write into the next slot
//!
//! In acknowledge mode the writer waits for the slot's read-ack event after
//! signalling; an elapsed timeout is a drop statistic, not an error.

use super::channel::{ShmChannel, WriteMeta};
use super::ring::SegmentRing;
use super::{PayloadWriter, Result};
use std::time::Duration;

/// Writer-side knobs.
#[derive(Debug, Clone)]
pub struct ShmWriterOptions {
    /// Number of ring slots (1..=64).
    pub buffer_count: usize,
    /// Allow in-place payload mutation (effective only with one buffer).
    pub zero_copy: bool,
    /// Wait this long for a read-ack after each write; zero disables
    /// acknowledge mode.
    pub ack_timeout: Duration,
    /// Initial payload capacity per slot; slots grow on demand.
    pub initial_capacity: usize,
    /// Bound on header mutex acquisition.
    pub lock_timeout: Duration,
}

impl Default for ShmWriterOptions {
    fn default() -> Self {
        Self {
            buffer_count: 1,
            zero_copy: false,
            ack_timeout: Duration::ZERO,
            initial_capacity: 4096,
            lock_timeout: Duration::from_millis(100),
        }
    }
}

/// Writer over a ring of channels.
pub struct ShmWriter {
    ring: SegmentRing,
    options: ShmWriterOptions,
    publisher_id: u64,
    /// Clock of the last successful write (0 before the first).
    last_clock: u64,
    /// Writes acknowledged by nobody within the ack timeout.
    ack_misses: u64,
}

/// Thin adapter so plain byte slices go through the same write paths.
struct SliceWriter<'a>(&'a [u8]);

impl PayloadWriter for SliceWriter<'_> {
    fn size(&self) -> usize {
        self.0.len()
    }
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        buf.copy_from_slice(self.0);
        true
    }
}

impl ShmWriter {
    /// Create the ring under `base` (slot names `<base>_<i>`).
    pub fn create(base: &str, publisher_id: u64, options: ShmWriterOptions) -> Result<Self> {
        let ring = SegmentRing::create(
            base,
            options.buffer_count,
            options.initial_capacity,
            options.zero_copy,
        )?;
        Ok(Self {
            ring,
            options,
            publisher_id,
            last_clock: 0,
            ack_misses: 0,
        })
    }

    /// Publish a byte payload under the given clock.
    pub fn send(&mut self, payload: &[u8], clock: u64, timestamp_us: i64) -> Result<usize> {
        self.send_with(&mut SliceWriter(payload), clock, timestamp_us)
    }

    /// Publish via a payload writer callback.
    pub fn send_with(
        &mut self,
        payload_writer: &mut dyn PayloadWriter,
        clock: u64,
        timestamp_us: i64,
    ) -> Result<usize> {
        debug_assert!(clock > self.last_clock, "clock must strictly increase");
        let meta = WriteMeta {
            clock,
            timestamp_us,
            publisher_id: self.publisher_id,
        };

        let modify_in_place =
            self.options.buffer_count == 1 && self.options.zero_copy && self.last_clock > 0;
        let lock_timeout = self.options.lock_timeout;
        let ack_timeout = self.options.ack_timeout;

        let slot = self.ring.slot_for_clock(clock);
        let written = if modify_in_place {
            slot.write_modify(payload_writer, &meta, lock_timeout)?
        } else {
            slot.write_full(payload_writer, &meta, lock_timeout)?
        };
        if written == 0 && payload_writer.size() > 0 {
            // Payload writer aborted; nothing was signalled.
            return Ok(0);
        }

        self.last_clock = clock;

        if !ack_timeout.is_zero() && !Self::wait_ack(slot, ack_timeout) {
            self.ack_misses += 1;
            log::debug!(
                "[SHM] {}: no read-ack within {ack_timeout:?} (clock {clock})",
                slot.name()
            );
        }
        Ok(written)
    }

    fn wait_ack(slot: &mut ShmChannel, timeout: Duration) -> bool {
        slot.await_ack(timeout)
    }

    /// Slot file names for the registration descriptor.
    #[must_use]
    pub fn slot_names(&self) -> Vec<String> {
        self.ring.slot_names()
    }

    /// Writes that missed their read-ack deadline.
    #[must_use]
    pub fn ack_misses(&self) -> u64 {
        self.ack_misses
    }

    /// Clock of the most recent successful write.
    #[must_use]
    pub fn last_clock(&self) -> u64 {
        self.last_clock
    }
}
