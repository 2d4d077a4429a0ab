// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process synchronization.
//!
//! # SHARED vs PRIVATE
//!
//! These wrappers use `FUTEX_WAIT` / `FUTEX_WAKE`, NOT the `_PRIVATE`
//! variants. The private forms only work within one process and silently
//! fail to wake waiters in other processes, which is exactly the case the
//! named events and mutexes exist for.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0; // NOT 128 (FUTEX_WAIT_PRIVATE)
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1; // NOT 129 (FUTEX_WAKE_PRIVATE)

/// Wait until the word changes away from `expected` or the timeout expires.
///
/// Returns the raw syscall result: `0` on wake, `-1` with `errno` EAGAIN
/// (value already changed), ETIMEDOUT or EINTR otherwise. The word must
/// live in shared memory for cross-process use.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the syscall and
    // the remaining arguments are unused by FUTEX_WAIT.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            std::ptr::from_ref(addr).cast::<u32>(),
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on the word.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: addr is a live reference; wake takes no timeout.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            std::ptr::from_ref(addr).cast::<u32>(),
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake one waiter.
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_one(addr: &AtomicU32) -> i32 {
    futex_wake(addr, 1)
}

/// Wake every waiter.
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

/// Remaining time before `deadline`, or `None` when it already passed.
pub fn time_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if deadline <= now {
        None
    } else {
        Some(deadline - now)
    }
}

// Non-Linux fallback: short sleeps instead of kernel waits. Functional but
// slow; only intended to keep unit tests running on other hosts.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let nap = timeout.unwrap_or(Duration::from_millis(1));
    std::thread::sleep(nap.min(Duration::from_millis(10)));
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_one(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_without_waiters_is_fine() {
        let word = AtomicU32::new(0);
        assert!(futex_wake_all(&word) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_with_stale_expected_returns_immediately() {
        let word = AtomicU32::new(7);
        let rc = futex_wait(&word, 0, Some(Duration::from_millis(200)));
        assert_eq!(rc, -1); // EAGAIN
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_times_out() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        let _ = futex_wait(&word, 7, Some(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = Arc::clone(&word);
        let handle = thread::spawn(move || {
            while w.load(Ordering::Acquire) == 0 {
                futex_wait(&w, 0, Some(Duration::from_secs(2)));
            }
            w.load(Ordering::Acquire)
        });
        thread::sleep(Duration::from_millis(20));
        word.store(99, Ordering::Release);
        futex_wake_all(&word);
        assert_eq!(handle.join().expect("waiter"), 99);
    }

    #[test]
    fn time_until_past_deadline_is_none() {
        assert!(time_until(Instant::now() - Duration::from_millis(1)).is_none());
        assert!(time_until(Instant::now() + Duration::from_secs(1)).is_some());
    }
}
