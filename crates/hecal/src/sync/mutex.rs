// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process recursive mutex keyed by name.
//!
//! Backed by a 64-byte shared memory file: a three-state futex word
//! (0 free, 1 locked, 2 locked-with-waiters) plus owner pid/tid and a
//! recursion depth. The owner's liveness is probed while waiting; a lock
//! whose holder died is stolen and reported as abandoned to the thief.
//!
//! Release by a non-owning thread is refused. Holding across an event wait
//! is never done by this crate's callers.

use super::futex::{futex_wait, futex_wake_one, time_until};
use super::SyncError;
use crate::core::process::process_alive;
use crate::shm::{Result as ShmResult, ShmSegment};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// How the lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Fresh acquisition.
    Acquired,
    /// Recursive re-acquisition by the current owner thread.
    Reacquired,
    /// The previous holder died; the lock was stolen. Shared state guarded
    /// by this mutex may be inconsistent.
    Abandoned,
}

/// Interval between owner-liveness probes while blocked.
const DEAD_OWNER_POLL: Duration = Duration::from_millis(100);

#[repr(C, align(64))]
struct MutexBlock {
    /// 0 = free, 1 = locked, 2 = locked with waiters.
    state: AtomicU32,
    owner_pid: AtomicU32,
    owner_tid: AtomicU32,
    recursion: AtomicU32,
    _pad: [u8; 48],
}

const MUTEX_SEGMENT_SIZE: usize = std::mem::size_of::<MutexBlock>();

/// Named recursive mutex shared across processes.
pub struct NamedMutex {
    segment: ShmSegment,
}

#[cfg(target_os = "linux")]
fn current_tid() -> u32 {
    // SAFETY: gettid takes no arguments and always succeeds.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as u32
}

impl NamedMutex {
    /// Create the backing file, reclaiming a stale one.
    pub fn create(name: &str) -> ShmResult<Self> {
        let segment = ShmSegment::create(name, MUTEX_SEGMENT_SIZE)?;
        Ok(Self { segment })
    }

    /// Open a mutex created by another process.
    pub fn open(name: &str) -> ShmResult<Self> {
        let segment = ShmSegment::open(name)?;
        Ok(Self { segment })
    }

    fn block(&self) -> &MutexBlock {
        // SAFETY: the segment spans MUTEX_SEGMENT_SIZE bytes and mmap
        // alignment (page) satisfies the 64-byte requirement; all fields
        // are atomics.
        unsafe { &*self.segment.as_ptr().cast::<MutexBlock>() }
    }

    /// Acquire the lock, blocking until `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> Result<LockState, SyncError> {
        let block = self.block();
        let pid = std::process::id();
        let tid = current_tid();

        // Recursive path: this thread already owns the lock.
        if block.owner_pid.load(Ordering::Acquire) == pid
            && block.owner_tid.load(Ordering::Acquire) == tid
            && block.state.load(Ordering::Acquire) != 0
        {
            block.recursion.fetch_add(1, Ordering::AcqRel);
            return Ok(LockState::Reacquired);
        }

        loop {
            if block
                .state
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.take_ownership(pid, tid);
                return Ok(LockState::Acquired);
            }

            // Contended: mark the word so the holder knows to wake us.
            if block.state.swap(2, Ordering::AcqRel) == 0 {
                self.take_ownership(pid, tid);
                return Ok(LockState::Acquired);
            }

            // Dead-owner probe before (and between) kernel waits.
            let owner = block.owner_pid.load(Ordering::Acquire);
            if owner != 0 && owner != pid && !process_alive(owner) {
                if block
                    .owner_pid
                    .compare_exchange(owner, pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    block.owner_tid.store(tid, Ordering::Release);
                    block.recursion.store(1, Ordering::Release);
                    block.state.store(2, Ordering::Release);
                    log::warn!(
                        "[SYNC] mutex {} stolen from dead pid {owner}",
                        self.segment.name()
                    );
                    return Ok(LockState::Abandoned);
                }
                // Lost the steal race; loop and contend normally.
                continue;
            }

            let Some(remaining) = time_until(deadline) else {
                return Err(SyncError::Timeout);
            };
            futex_wait(
                &block.state,
                2,
                Some(remaining.min(DEAD_OWNER_POLL)),
            );
        }
    }

    /// Acquire with a relative timeout.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<LockState, SyncError> {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// Release one level of ownership.
    pub fn unlock(&self) -> Result<(), SyncError> {
        let block = self.block();
        let pid = std::process::id();
        let tid = current_tid();
        if block.owner_pid.load(Ordering::Acquire) != pid
            || block.owner_tid.load(Ordering::Acquire) != tid
        {
            return Err(SyncError::NotOwner);
        }

        let depth = block.recursion.load(Ordering::Acquire);
        if depth > 1 {
            block.recursion.store(depth - 1, Ordering::Release);
            return Ok(());
        }

        block.recursion.store(0, Ordering::Release);
        block.owner_tid.store(0, Ordering::Release);
        block.owner_pid.store(0, Ordering::Release);
        if block.state.swap(0, Ordering::AcqRel) == 2 {
            futex_wake_one(&block.state);
        }
        Ok(())
    }

    /// Acquire and return an RAII guard.
    pub fn lock_guard_until(
        &self,
        deadline: Instant,
    ) -> Result<(MutexGuard<'_>, LockState), SyncError> {
        let state = self.try_lock_until(deadline)?;
        Ok((MutexGuard { mutex: self }, state))
    }

    fn take_ownership(&self, pid: u32, tid: u32) {
        let block = self.block();
        block.owner_pid.store(pid, Ordering::Release);
        block.owner_tid.store(tid, Ordering::Release);
        block.recursion.store(1, Ordering::Release);
    }

    /// Name of the backing file.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Unlink the backing file by name.
    pub fn unlink(name: &str) -> ShmResult<()> {
        ShmSegment::unlink(name)
    }
}

/// Releases one ownership level on drop.
pub struct MutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            log::error!("[SYNC] unlock of {} failed: {e}", self.mutex.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!(
            "hecal_test_mtx_{tag}_{}_{}",
            std::process::id(),
            fastrand::u32(..)
        )
    }

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn lock_unlock_cycle() {
        let name = unique_name("basic");
        let m = NamedMutex::create(&name).expect("create");
        assert_eq!(m.try_lock_until(soon(100)).expect("lock"), LockState::Acquired);
        m.unlock().expect("unlock");
        assert_eq!(m.try_lock_until(soon(100)).expect("lock"), LockState::Acquired);
        m.unlock().expect("unlock");
        NamedMutex::unlink(&name).ok();
    }

    #[test]
    fn recursive_acquire_needs_matching_releases() {
        let name = unique_name("rec");
        let m = NamedMutex::create(&name).expect("create");
        assert_eq!(m.try_lock_until(soon(100)).expect("1st"), LockState::Acquired);
        assert_eq!(m.try_lock_until(soon(100)).expect("2nd"), LockState::Reacquired);
        m.unlock().expect("inner");

        // Still held by this thread: another thread must time out.
        let m2 = NamedMutex::open(&name).expect("open");
        let other = std::thread::spawn(move || m2.try_lock_until(soon(50)));
        assert!(matches!(other.join().expect("join"), Err(SyncError::Timeout)));

        m.unlock().expect("outer");
        NamedMutex::unlink(&name).ok();
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let name = unique_name("owner");
        let m = Arc::new(NamedMutex::create(&name).expect("create"));
        assert_eq!(m.try_lock_until(soon(100)).expect("lock"), LockState::Acquired);

        let m2 = Arc::clone(&m);
        let res = std::thread::spawn(move || m2.unlock()).join().expect("join");
        assert!(matches!(res, Err(SyncError::NotOwner)));

        m.unlock().expect("unlock");
        NamedMutex::unlink(&name).ok();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn contended_lock_is_handed_over() {
        let name = unique_name("contend");
        let m = Arc::new(NamedMutex::create(&name).expect("create"));
        assert_eq!(m.try_lock_until(soon(100)).expect("lock"), LockState::Acquired);

        let m2 = Arc::clone(&m);
        let waiter = std::thread::spawn(move || m2.try_lock_until(soon(2_000)));

        std::thread::sleep(Duration::from_millis(50));
        m.unlock().expect("unlock");

        assert_eq!(waiter.join().expect("join").expect("acquire"), LockState::Acquired);
        NamedMutex::unlink(&name).ok();
    }

    #[test]
    fn guard_releases_on_drop() {
        let name = unique_name("guard");
        let m = NamedMutex::create(&name).expect("create");
        {
            let (_guard, state) = m.lock_guard_until(soon(100)).expect("guard");
            assert_eq!(state, LockState::Acquired);
        }
        assert_eq!(m.try_lock_until(soon(100)).expect("relock"), LockState::Acquired);
        m.unlock().expect("unlock");
        NamedMutex::unlink(&name).ok();
    }

    #[test]
    fn dead_owner_is_reported_abandoned() {
        let name = unique_name("dead");
        let m = NamedMutex::create(&name).expect("create");

        // Fake a holder from a pid far above any real pid_max.
        let block = m.block();
        block.state.store(1, Ordering::Release);
        block.owner_pid.store(99_999_999, Ordering::Release);
        block.owner_tid.store(1, Ordering::Release);
        block.recursion.store(1, Ordering::Release);

        let state = m.try_lock_until(soon(1_000)).expect("steal");
        assert_eq!(state, LockState::Abandoned);
        m.unlock().expect("unlock");
        NamedMutex::unlink(&name).ok();
    }
}
