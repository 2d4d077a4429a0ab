// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process one-shot signal keyed by name.
//!
//! A named event is a 64-byte shared memory file holding a signal counter.
//! `set()` bumps the counter and wakes every futex waiter; each waiter keeps
//! a private snapshot of the counter it last consumed, so one `set` wakes a
//! given waiter exactly once and sets that happen while nobody waits
//! coalesce into a single pending wake (auto-reset behavior).
//!
//! Survival across owner crashes is not required; stale names are reclaimed
//! by the next creator.

use super::futex::{futex_wait, futex_wake_all, time_until};
use super::WaitResult;
use crate::shm::{Result, ShmSegment};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Shared block behind every named event.
#[repr(C, align(64))]
struct EventBlock {
    /// Incremented on every `set`.
    counter: AtomicU32,
    _pad: [u8; 60],
}

const EVENT_SEGMENT_SIZE: usize = std::mem::size_of::<EventBlock>();

/// Cross-process auto-reset event.
///
/// Each process (and each waiter thread) holds its own `NamedEvent` mapped
/// onto the same file; instances are not shared between threads that wait.
pub struct NamedEvent {
    segment: ShmSegment,
    /// Counter value this waiter has already consumed.
    last_seen: u32,
}

impl NamedEvent {
    /// Create the backing file, reclaiming a stale one if present.
    pub fn create(name: &str) -> Result<Self> {
        let segment = ShmSegment::create(name, EVENT_SEGMENT_SIZE)?;
        Ok(Self {
            segment,
            last_seen: 0,
        })
    }

    /// Open an event created by another process.
    ///
    /// The current counter value is consumed at open time: only signals
    /// after the open wake this instance.
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        let mut ev = Self {
            segment,
            last_seen: 0,
        };
        ev.last_seen = ev.block().counter.load(Ordering::Acquire);
        Ok(ev)
    }

    fn block(&self) -> &EventBlock {
        // SAFETY: the segment is at least EVENT_SEGMENT_SIZE bytes (created
        // with that size; open() maps the full file which the creator sized)
        // and mmap returns page-aligned memory, satisfying the 64-byte
        // alignment. All access goes through atomics.
        unsafe { &*self.segment.as_ptr().cast::<EventBlock>() }
    }

    /// Signal the event, waking all current waiters once.
    pub fn set(&self) {
        let block = self.block();
        block.counter.fetch_add(1, Ordering::Release);
        futex_wake_all(&block.counter);
    }

    /// Wait for a signal until `deadline`.
    ///
    /// Returns [`WaitResult::Abandoned`] when the backing file vanished
    /// (owner unlinked it or died and a cleaner removed it).
    pub fn wait_until(&mut self, deadline: Instant) -> WaitResult {
        loop {
            let current = self.block().counter.load(Ordering::Acquire);
            if current != self.last_seen {
                self.last_seen = current;
                return WaitResult::Signalled;
            }
            let Some(remaining) = time_until(deadline) else {
                // Timed out; distinguish a vanished owner from plain silence.
                if ShmSegment::exists(self.segment.name()) {
                    return WaitResult::Timeout;
                }
                return WaitResult::Abandoned;
            };
            futex_wait(&self.block().counter, current, Some(remaining));
        }
    }

    /// Consume any pending signal without waiting.
    pub fn reset(&mut self) {
        self.last_seen = self.block().counter.load(Ordering::Acquire);
    }

    /// Name of the backing file.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Unlink the backing file by name.
    pub fn unlink(name: &str) -> Result<()> {
        ShmSegment::unlink(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!(
            "hecal_test_ev_{tag}_{}_{}",
            std::process::id(),
            fastrand::u32(..)
        )
    }

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn set_before_wait_is_pending() {
        let name = unique_name("pending");
        let mut ev = NamedEvent::create(&name).expect("create");
        ev.set();
        assert_eq!(ev.wait_until(soon(10)), WaitResult::Signalled);
        // Consumed: the next wait times out.
        assert_eq!(ev.wait_until(soon(10)), WaitResult::Timeout);
        NamedEvent::unlink(&name).ok();
    }

    #[test]
    fn multiple_sets_coalesce_into_one_wake() {
        let name = unique_name("coalesce");
        let mut ev = NamedEvent::create(&name).expect("create");
        ev.set();
        ev.set();
        ev.set();
        assert_eq!(ev.wait_until(soon(10)), WaitResult::Signalled);
        assert_eq!(ev.wait_until(soon(10)), WaitResult::Timeout);
        NamedEvent::unlink(&name).ok();
    }

    #[test]
    fn open_consumes_prior_signals() {
        let name = unique_name("open");
        let creator = NamedEvent::create(&name).expect("create");
        creator.set();
        let mut opener = NamedEvent::open(&name).expect("open");
        assert_eq!(opener.wait_until(soon(10)), WaitResult::Timeout);
        creator.set();
        assert_eq!(opener.wait_until(soon(100)), WaitResult::Signalled);
        NamedEvent::unlink(&name).ok();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn set_wakes_blocked_waiter() {
        let name = unique_name("wake");
        let setter = NamedEvent::create(&name).expect("create");
        let mut waiter = NamedEvent::open(&name).expect("open");

        let handle = std::thread::spawn(move || waiter.wait_until(soon(2_000)));
        std::thread::sleep(Duration::from_millis(20));
        setter.set();
        assert_eq!(handle.join().expect("waiter"), WaitResult::Signalled);
        NamedEvent::unlink(&name).ok();
    }

    #[test]
    fn wait_on_unlinked_event_reports_abandoned() {
        let name = unique_name("gone");
        let mut ev = NamedEvent::create(&name).expect("create");
        NamedEvent::unlink(&name).expect("unlink");
        assert_eq!(ev.wait_until(soon(20)), WaitResult::Abandoned);
    }

    #[test]
    fn reset_drops_pending_signal() {
        let name = unique_name("reset");
        let mut ev = NamedEvent::create(&name).expect("create");
        ev.set();
        ev.reset();
        assert_eq!(ev.wait_until(soon(10)), WaitResult::Timeout);
        NamedEvent::unlink(&name).ok();
    }
}
