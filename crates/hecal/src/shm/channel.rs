// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One shared memory channel: a data file plus its event pair and mutex.
//!
//! The writer side creates all four named objects; readers open them. Every
//! header mutation happens under the named mutex, and the mutex is never
//! held across an event wait.

use super::header::{SegmentHeader, SEGMENT_HEADER_SIZE};
use super::segment::ShmSegment;
use super::{PayloadWriter, Result, ShmError, MUTEX_SUFFIX, READ_ACK_SUFFIX, WRITTEN_SUFFIX};
use crate::sync::{LockState, NamedEvent, NamedMutex, SyncError, WaitResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metadata attached to every write.
#[derive(Debug, Clone, Copy)]
pub struct WriteMeta {
    /// Publisher's data clock for this message (strictly increasing).
    pub clock: u64,
    /// Send timestamp in microseconds since the epoch.
    pub timestamp_us: i64,
    /// Publishing entity's raw id.
    pub publisher_id: u64,
}

/// One message copied out of a channel.
#[derive(Debug, Clone)]
pub struct ReceivedPayload {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Publishing entity's raw id.
    pub publisher_id: u64,
    /// Send timestamp in microseconds since the epoch.
    pub timestamp_us: i64,
    /// Publisher's data clock.
    pub clock: u64,
}

/// Cloneable handle used to signal the read-ack event after a callback ran.
#[derive(Clone)]
pub struct AckHandle {
    event: Option<Arc<NamedEvent>>,
}

impl AckHandle {
    /// Handle that signals nothing (non-shm transports).
    #[must_use]
    pub fn none() -> Self {
        Self { event: None }
    }

    /// Signal the read-ack event, if any.
    pub fn ack(&self) {
        if let Some(ev) = &self.event {
            ev.set();
        }
    }
}

/// A channel file with its named events and mutex.
pub struct ShmChannel {
    segment: ShmSegment,
    written: NamedEvent,
    read_ack: NamedEvent,
    mutex: NamedMutex,
    /// Writer side: unlink everything on drop.
    owner: bool,
}

impl ShmChannel {
    /// Create the channel files (writer side).
    pub fn create(name: &str, payload_capacity: usize, zero_copy: bool) -> Result<Self> {
        let segment = ShmSegment::create(name, SEGMENT_HEADER_SIZE + payload_capacity)?;
        let written = NamedEvent::create(&format!("{name}{WRITTEN_SUFFIX}"))?;
        let read_ack = NamedEvent::create(&format!("{name}{READ_ACK_SUFFIX}"))?;
        let mutex = NamedMutex::create(&format!("{name}{MUTEX_SUFFIX}"))?;

        let channel = Self {
            segment,
            written,
            read_ack,
            mutex,
            owner: true,
        };
        // SAFETY: the segment was just created and zeroed; no reader can
        // know the name yet (it is only advertised via registration after
        // this returns), so the mutable access is exclusive.
        unsafe {
            (*channel.segment.as_ptr().cast::<SegmentHeader>())
                .init(payload_capacity as u32, zero_copy);
        }
        Ok(channel)
    }

    /// Open an existing channel (reader side) and validate its header.
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        if segment.size() < SEGMENT_HEADER_SIZE {
            return Err(ShmError::InvalidHeader(format!(
                "segment shorter than header: {} bytes",
                segment.size()
            )));
        }
        let written = NamedEvent::open(&format!("{name}{WRITTEN_SUFFIX}"))?;
        let read_ack = NamedEvent::open(&format!("{name}{READ_ACK_SUFFIX}"))?;
        let mutex = NamedMutex::open(&format!("{name}{MUTEX_SUFFIX}"))?;

        let channel = Self {
            segment,
            written,
            read_ack,
            mutex,
            owner: false,
        };
        channel
            .header()
            .validate()
            .map_err(ShmError::InvalidHeader)?;
        Ok(channel)
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least SEGMENT_HEADER_SIZE bytes (checked
        // at create/open) and page-aligned; all header fields are atomics or
        // written before the name was shared.
        unsafe { &*self.segment.as_ptr().cast::<SegmentHeader>() }
    }

    /// Payload capacity currently mapped in this process.
    fn mapped_capacity(&self) -> usize {
        self.segment.size() - SEGMENT_HEADER_SIZE
    }

    /// Mutable view of the payload region.
    ///
    /// # Safety
    ///
    /// Caller must hold the channel mutex and `len` must not exceed the
    /// mapped capacity. The slice is derived from the raw mapping pointer,
    /// never from a shared reference.
    unsafe fn payload_mut(&self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.mapped_capacity());
        std::slice::from_raw_parts_mut(self.segment.as_ptr().add(SEGMENT_HEADER_SIZE), len)
    }

    /// Shared view of the payload region (mutex held, bounds checked by caller).
    fn payload(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.mapped_capacity());
        // SAFETY: the payload region starts right after the header and the
        // mapping covers `len` bytes; concurrent writers are excluded by the
        // named mutex held by the caller.
        unsafe {
            std::slice::from_raw_parts(self.segment.as_ptr().add(SEGMENT_HEADER_SIZE), len)
        }
    }

    fn lock(&self, timeout: Duration) -> Result<crate::sync::MutexGuard<'_>> {
        match self.mutex.lock_guard_until(Instant::now() + timeout) {
            Ok((guard, LockState::Abandoned)) => {
                // Previous holder died mid-operation; the header is rebuilt
                // by the next commit, so continue.
                log::warn!("[SHM] {}: recovered abandoned header mutex", self.name());
                Ok(guard)
            }
            Ok((guard, _)) => Ok(guard),
            Err(SyncError::Timeout) => Err(ShmError::LockTimeout),
            Err(SyncError::NotOwner) => unreachable!("lock never returns NotOwner"),
        }
    }

    // ===== writer side =====

    /// Grow the payload region so `len` bytes fit (with 50% slack).
    /// Writer side only.
    pub fn ensure_capacity(&mut self, len: usize) -> Result<()> {
        if len <= self.mapped_capacity() {
            return Ok(());
        }
        let new_capacity = len + len / 2;
        log::debug!(
            "[SHM] {}: growing payload region {} -> {new_capacity}",
            self.name(),
            self.mapped_capacity()
        );
        self.segment.grow(SEGMENT_HEADER_SIZE + new_capacity)?;
        Ok(())
    }

    /// Copy `payload` into the channel and publish it.
    pub fn write_copy(
        &mut self,
        payload: &[u8],
        meta: &WriteMeta,
        lock_timeout: Duration,
    ) -> Result<usize> {
        self.ensure_capacity(payload.len())?;
        {
            let _guard = self.lock(lock_timeout)?;
            self.header().begin_write();
            self.header()
                .set_payload_capacity(self.mapped_capacity() as u32);
            // SAFETY: mutex held, capacity ensured above.
            unsafe { self.payload_mut(payload.len()) }.copy_from_slice(payload);
            self.header().commit_write(
                payload.len() as u32,
                meta.clock,
                meta.timestamp_us,
                meta.publisher_id,
            );
        }
        self.written.set();
        Ok(payload.len())
    }

    /// Let `writer` fill a fresh payload region, then publish it.
    ///
    /// Returns 0 without publishing when the payload writer aborts.
    pub fn write_full(
        &mut self,
        writer: &mut dyn PayloadWriter,
        meta: &WriteMeta,
        lock_timeout: Duration,
    ) -> Result<usize> {
        self.write_in_place(writer, meta, lock_timeout, false)
    }

    /// Let `writer` patch the payload region in place, then publish.
    ///
    /// Only meaningful for single-buffer zero-copy rings where the region
    /// still holds the previous payload.
    pub fn write_modify(
        &mut self,
        writer: &mut dyn PayloadWriter,
        meta: &WriteMeta,
        lock_timeout: Duration,
    ) -> Result<usize> {
        self.write_in_place(writer, meta, lock_timeout, true)
    }

    fn write_in_place(
        &mut self,
        writer: &mut dyn PayloadWriter,
        meta: &WriteMeta,
        lock_timeout: Duration,
        modify: bool,
    ) -> Result<usize> {
        let len = writer.size();
        self.ensure_capacity(len)?;
        let ok = {
            let _guard = self.lock(lock_timeout)?;
            let prev = self.header().snapshot();
            self.header().begin_write();
            self.header()
                .set_payload_capacity(self.mapped_capacity() as u32);
            // SAFETY: mutex held, capacity ensured above.
            let region = unsafe { self.payload_mut(len) };
            let ok = if modify {
                writer.write_modify(region)
            } else {
                writer.write_full(region)
            };
            if ok {
                self.header().commit_write(
                    len as u32,
                    meta.clock,
                    meta.timestamp_us,
                    meta.publisher_id,
                );
            } else {
                // Aborted: keep the previous message observable.
                self.header().commit_write(
                    prev.payload_len,
                    prev.clock,
                    prev.timestamp_us,
                    prev.publisher_id,
                );
            }
            ok
        };
        if !ok {
            return Ok(0);
        }
        self.written.set();
        Ok(len)
    }

    /// Wait for a read-ack after signalling a write (acknowledge mode).
    pub fn await_ack(&mut self, timeout: Duration) -> bool {
        self.read_ack.wait_until(Instant::now() + timeout) == WaitResult::Signalled
    }

    // ===== reader side =====

    /// Block until the writer signals a new message or `deadline` passes.
    pub fn wait_written(&mut self, deadline: Instant) -> WaitResult {
        self.written.wait_until(deadline)
    }

    /// Snapshot and copy the current message if its clock advanced past
    /// `last_clock`. Returns `Ok(None)` on spurious wakes.
    pub fn try_read(
        &mut self,
        last_clock: u64,
        lock_timeout: Duration,
    ) -> Result<Option<ReceivedPayload>> {
        for _ in 0..2 {
            let needed = {
                let _guard = self.lock(lock_timeout)?;
                self.header().validate().map_err(ShmError::InvalidHeader)?;
                let snap = self.header().snapshot();
                if snap.clock <= last_clock {
                    return Ok(None);
                }
                let len = snap.payload_len as usize;
                if len <= self.mapped_capacity() {
                    let data = self.payload(len).to_vec();
                    return Ok(Some(ReceivedPayload {
                        data,
                        publisher_id: snap.publisher_id,
                        timestamp_us: snap.timestamp_us,
                        clock: snap.clock,
                    }));
                }
                len
            };
            // The writer grew the file since we mapped it; remap and retry.
            log::debug!(
                "[SHM] {}: payload {needed} exceeds mapped {}, re-opening",
                self.name(),
                self.mapped_capacity()
            );
            let name = self.segment.name().to_string();
            self.segment = ShmSegment::open(&name)?;
        }
        Err(ShmError::InvalidHeader(
            "payload length still exceeds mapping after re-open".to_string(),
        ))
    }

    /// Current clock without taking the lock (single atomic read).
    #[must_use]
    pub fn peek_clock(&self) -> u64 {
        self.header().clock()
    }

    /// Handle for acking this channel after a dispatched callback returns.
    pub fn ack_handle(&self) -> Result<AckHandle> {
        let event = NamedEvent::open(&format!("{}{READ_ACK_SUFFIX}", self.name()))?;
        Ok(AckHandle {
            event: Some(Arc::new(event)),
        })
    }

    /// Name of the channel's data file.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Whether this side created (and will unlink) the channel.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        if self.owner {
            let name = self.segment.name().to_string();
            ShmSegment::unlink(&name).ok();
            NamedEvent::unlink(&format!("{name}{WRITTEN_SUFFIX}")).ok();
            NamedEvent::unlink(&format!("{name}{READ_ACK_SUFFIX}")).ok();
            NamedMutex::unlink(&format!("{name}{MUTEX_SUFFIX}")).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "ecal_test_{tag}_{}_{:08x}_0",
            std::process::id(),
            fastrand::u32(..)
        )
    }

    const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

    fn meta(clock: u64) -> WriteMeta {
        WriteMeta {
            clock,
            timestamp_us: 1_000 + clock as i64,
            publisher_id: 7,
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let name = unique_name("rt");
        let mut writer = ShmChannel::create(&name, 64, false).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        let payload: Vec<u8> = (0u8..10).collect();
        let n = writer
            .write_copy(&payload, &meta(1), LOCK_TIMEOUT)
            .expect("write");
        assert_eq!(n, 10);

        assert_eq!(
            reader.wait_written(Instant::now() + Duration::from_millis(100)),
            WaitResult::Signalled
        );
        let msg = reader
            .try_read(0, LOCK_TIMEOUT)
            .expect("read")
            .expect("message");
        assert_eq!(msg.data, payload);
        assert_eq!(msg.clock, 1);
        assert_eq!(msg.publisher_id, 7);
        assert_eq!(msg.timestamp_us, 1_001);
    }

    #[test]
    fn stale_clock_reads_nothing() {
        let name = unique_name("stale");
        let mut writer = ShmChannel::create(&name, 64, false).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        writer
            .write_copy(b"abc", &meta(1), LOCK_TIMEOUT)
            .expect("write");
        assert!(reader.try_read(1, LOCK_TIMEOUT).expect("read").is_none());
    }

    #[test]
    fn zero_length_payload_is_published() {
        let name = unique_name("empty");
        let mut writer = ShmChannel::create(&name, 64, false).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        writer.write_copy(b"", &meta(1), LOCK_TIMEOUT).expect("write");
        let msg = reader
            .try_read(0, LOCK_TIMEOUT)
            .expect("read")
            .expect("message");
        assert!(msg.data.is_empty());
        assert_eq!(msg.clock, 1);
    }

    #[test]
    fn oversized_payload_grows_and_reader_reopens() {
        let name = unique_name("grow");
        let mut writer = ShmChannel::create(&name, 16, false).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        let big = vec![0x5A; 1000];
        writer
            .write_copy(&big, &meta(1), LOCK_TIMEOUT)
            .expect("write");
        let msg = reader
            .try_read(0, LOCK_TIMEOUT)
            .expect("read")
            .expect("message");
        assert_eq!(msg.data, big);
    }

    struct CountingWriter {
        len: usize,
        fulls: usize,
        modifies: usize,
    }

    impl PayloadWriter for CountingWriter {
        fn size(&self) -> usize {
            self.len
        }
        fn write_full(&mut self, buf: &mut [u8]) -> bool {
            self.fulls += 1;
            buf.fill(42);
            true
        }
        fn write_modify(&mut self, buf: &mut [u8]) -> bool {
            self.modifies += 1;
            buf[0] = buf[0].wrapping_add(1);
            true
        }
    }

    #[test]
    fn modify_patches_previous_payload() {
        let name = unique_name("modify");
        let mut writer = ShmChannel::create(&name, 64, true).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        let mut pw = CountingWriter {
            len: 10,
            fulls: 0,
            modifies: 0,
        };
        writer
            .write_full(&mut pw, &meta(1), LOCK_TIMEOUT)
            .expect("full");
        writer
            .write_modify(&mut pw, &meta(2), LOCK_TIMEOUT)
            .expect("modify");
        assert_eq!(pw.fulls, 1);
        assert_eq!(pw.modifies, 1);

        let msg = reader
            .try_read(0, LOCK_TIMEOUT)
            .expect("read")
            .expect("message");
        // First byte was 42, patched once.
        assert_eq!(msg.data[0], 43);
        assert_eq!(msg.data[1..], [42u8; 9][..]);
        assert_eq!(msg.clock, 2);
    }

    struct AbortingWriter;

    impl PayloadWriter for AbortingWriter {
        fn size(&self) -> usize {
            4
        }
        fn write_full(&mut self, _buf: &mut [u8]) -> bool {
            false
        }
    }

    #[test]
    fn aborted_payload_writer_publishes_nothing() {
        let name = unique_name("abort");
        let mut writer = ShmChannel::create(&name, 64, false).expect("create");
        let mut reader = ShmChannel::open(&name).expect("open");

        writer
            .write_copy(b"keep", &meta(1), LOCK_TIMEOUT)
            .expect("write");
        let n = writer
            .write_full(&mut AbortingWriter, &meta(2), LOCK_TIMEOUT)
            .expect("aborted");
        assert_eq!(n, 0);

        // The previous message is still the observable one.
        let msg = reader
            .try_read(0, LOCK_TIMEOUT)
            .expect("read")
            .expect("message");
        assert_eq!(msg.data, b"keep");
        assert_eq!(msg.clock, 1);
    }

    #[test]
    fn ack_reaches_writer() {
        let name = unique_name("ack");
        let mut writer = ShmChannel::create(&name, 64, false).expect("create");
        let reader = ShmChannel::open(&name).expect("open");

        let ack = reader.ack_handle().expect("handle");
        ack.ack();
        assert!(writer.await_ack(Duration::from_millis(100)));
        // No further ack pending.
        assert!(!writer.await_ack(Duration::from_millis(20)));
    }

    #[test]
    fn owner_drop_unlinks_files() {
        let name = unique_name("unlink");
        {
            let _writer = ShmChannel::create(&name, 64, false).expect("create");
            assert!(ShmSegment::exists(&name));
        }
        assert!(!ShmSegment::exists(&name));
        assert!(!ShmSegment::exists(&format!("{name}_w")));
    }
}
