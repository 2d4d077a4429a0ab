// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dynamically sized worker pool for user callbacks and blocking handlers.
//!
//! Workers are spawned lazily: posting a task when no worker is idle and the
//! pool is below its bound creates one. Idle workers retire after an
//! inactivity interval, so a bursty process shrinks back to zero threads.
//!
//! The queue lives under a single mutex + condvar; user code never runs
//! while the lock is held.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool sizing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard bound on concurrent workers.
    pub max_workers: usize,
    /// Idle time after which a worker exits.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

struct PoolState {
    queue: VecDeque<Job>,
    /// Workers alive (idle + busy).
    workers: usize,
    /// Workers parked on the condvar.
    idle: usize,
    /// Jobs currently executing.
    active: usize,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_cv: Condvar,
    drain_cv: Condvar,
    config: PoolConfig,
}

/// Bounded, lazily growing thread pool.
///
/// Cheap to clone; all clones share the same workers.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Create an empty pool. No threads run until the first `post`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let max = config.max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    active: 0,
                    shutdown: false,
                }),
                work_cv: Condvar::new(),
                drain_cv: Condvar::new(),
                config: PoolConfig {
                    max_workers: max,
                    ..config
                },
            }),
        }
    }

    /// Enqueue a task. Returns false once the pool is shut down.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return false;
        }
        state.queue.push_back(Box::new(task));
        if state.idle > 0 {
            self.inner.work_cv.notify_one();
        } else if state.workers < self.inner.config.max_workers {
            state.workers += 1;
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("hecal-pool".to_string())
                .spawn(move || worker_loop(&inner))
                .map_or_else(
                    |e| {
                        // Spawn failure: keep the task queued, some other
                        // worker (or a later post) will pick it up.
                        log::warn!("[POOL] worker spawn failed: {e}");
                        state.workers -= 1;
                    },
                    |_| (),
                );
        }
        true
    }

    /// Stop accepting tasks. Queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.work_cv.notify_all();
    }

    /// Block until the queue is empty and no task is executing.
    pub fn join(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.active > 0 {
            self.inner.drain_cv.wait(&mut state);
        }
    }

    /// Number of live workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state.lock().workers
    }

    /// Number of workers parked waiting for work.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle
    }

    /// Queued (not yet started) tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

fn worker_loop(inner: &PoolInner) {
    let mut state = inner.state.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            state.active += 1;
            drop(state);
            job();
            state = inner.state.lock();
            state.active -= 1;
            if state.queue.is_empty() && state.active == 0 {
                inner.drain_cv.notify_all();
            }
            continue;
        }
        if state.shutdown {
            break;
        }
        state.idle += 1;
        let timed_out = inner
            .work_cv
            .wait_for(&mut state, inner.config.idle_timeout)
            .timed_out();
        state.idle -= 1;
        if timed_out && state.queue.is_empty() {
            break;
        }
    }
    state.workers -= 1;
    if state.queue.is_empty() && state.active == 0 {
        inner.drain_cv.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Last handle going away stops the workers; queued tasks still drain
        // because shutdown only refuses new posts.
        if Arc::strong_count(&self.inner) == 1 {
            self.shutdown();
        }
    }
}
