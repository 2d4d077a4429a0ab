// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory reader: one blocking wait-loop thread per attached writer.
//!
//! The thread follows the publisher's clock through the ring: the slot of
//! the next expected message is `last_clock mod N`, so the loop waits on
//! exactly one written-event at a time. A timeout triggers a rescan of all
//! slots (messages can overtake the expected slot when the publisher drops
//! ahead), and repeated abandoned waits past the registration TTL detach
//! the reader.
//!
//! State machine per attachment:
//!
//! ```text
//! Attached -> Waiting -> Reading -> Dispatched -> Waiting
//!                 |                                  ^
//!                 +--- abandoned > TTL --> Detached -+
//! ```

use super::channel::{AckHandle, ReceivedPayload, ShmChannel};
use super::ShmError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Reader-side knobs.
#[derive(Debug, Clone)]
pub struct ShmReaderOptions {
    /// Event wait slice; the cancellation flag is observed at this rate.
    pub poll_interval: Duration,
    /// Bound on header mutex acquisition.
    pub lock_timeout: Duration,
    /// Give up on a vanished writer after this long (registration TTL).
    pub detach_after: Duration,
}

impl Default for ShmReaderOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            lock_timeout: Duration::from_millis(100),
            detach_after: Duration::from_secs(5),
        }
    }
}

/// Message sink invoked from the reader thread.
///
/// The sink owns dispatch (typically via the thread pool) and must call
/// [`AckHandle::ack`] once the user callback has returned.
pub type ShmSink = Arc<dyn Fn(ReceivedPayload, AckHandle) + Send + Sync>;

/// Handle to one running reader thread.
pub struct ShmReader {
    cancel: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
    drops: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ShmReader {
    /// Attach to a writer's slot files and start the wait loop.
    ///
    /// Slots that do not exist yet are retried until `detach_after`.
    #[must_use]
    pub fn attach(slot_names: Vec<String>, options: ShmReaderOptions, sink: ShmSink) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let detached = Arc::new(AtomicBool::new(false));
        let drops = Arc::new(AtomicU64::new(0));

        let thread_cancel = Arc::clone(&cancel);
        let thread_detached = Arc::clone(&detached);
        let thread_drops = Arc::clone(&drops);
        let handle = std::thread::Builder::new()
            .name("hecal-shmrx".to_string())
            .spawn(move || {
                run_loop(
                    &slot_names,
                    &options,
                    &sink,
                    &thread_cancel,
                    &thread_detached,
                    &thread_drops,
                );
            })
            .ok();
        if handle.is_none() {
            detached.store(true, Ordering::Release);
        }

        Self {
            cancel,
            detached,
            drops,
            handle,
        }
    }

    /// Messages lost to ring overruns, as observed from clock gaps.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Acquire)
    }

    /// Whether the wait loop gave up (writer vanished) or was stopped.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Stop the wait loop and join the thread.
    pub fn detach(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
        self.detached.store(true, Ordering::Release);
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    slot_names: &[String],
    options: &ShmReaderOptions,
    sink: &ShmSink,
    cancel: &AtomicBool,
    detached: &AtomicBool,
    drops: &AtomicU64,
) {
    let Some((mut channels, acks)) =
        open_channels(slot_names, options, cancel)
    else {
        detached.store(true, Ordering::Release);
        return;
    };

    // Start behind the newest already-published message: attachments only
    // observe traffic from now on.
    let mut last_clock = channels.iter().map(ShmChannel::peek_clock).max().unwrap_or(0);
    let slot_count = channels.len() as u64;
    let mut abandoned_since: Option<Instant> = None;

    while !cancel.load(Ordering::Acquire) {
        let idx = (last_clock % slot_count) as usize;
        match channels[idx].wait_written(Instant::now() + options.poll_interval) {
            crate::sync::WaitResult::Signalled => {
                abandoned_since = None;
                read_one(
                    &mut channels,
                    idx,
                    &acks,
                    options,
                    sink,
                    drops,
                    &mut last_clock,
                );
            }
            crate::sync::WaitResult::Timeout => {
                abandoned_since = None;
                // Resync: the publisher may have skipped past our slot.
                if let Some(best) = freshest_slot(&channels, last_clock) {
                    read_one(
                        &mut channels,
                        best,
                        &acks,
                        options,
                        sink,
                        drops,
                        &mut last_clock,
                    );
                }
            }
            crate::sync::WaitResult::Abandoned => {
                let since = *abandoned_since.get_or_insert_with(Instant::now);
                if since.elapsed() > options.detach_after {
                    log::info!(
                        "[SHM] reader detaching, writer gone for {:?}",
                        options.detach_after
                    );
                    break;
                }
                // The wait returned immediately; avoid a hot loop.
                std::thread::sleep(options.poll_interval);
            }
        }
    }
    detached.store(true, Ordering::Release);
}

/// Open all slots, retrying missing files until the detach deadline.
fn open_channels(
    slot_names: &[String],
    options: &ShmReaderOptions,
    cancel: &AtomicBool,
) -> Option<(Vec<ShmChannel>, Vec<AckHandle>)> {
    if slot_names.is_empty() {
        return None;
    }
    let deadline = Instant::now() + options.detach_after;
    loop {
        if cancel.load(Ordering::Acquire) {
            return None;
        }
        match try_open_all(slot_names) {
            Ok(channels) => {
                let acks = channels
                    .iter()
                    .map(|c| c.ack_handle().unwrap_or_else(|_| AckHandle::none()))
                    .collect();
                return Some((channels, acks));
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    log::warn!("[SHM] attach failed permanently: {e}");
                    return None;
                }
                std::thread::sleep(options.poll_interval.min(Duration::from_millis(20)));
            }
        }
    }
}

fn try_open_all(slot_names: &[String]) -> Result<Vec<ShmChannel>, ShmError> {
    slot_names.iter().map(|n| ShmChannel::open(n)).collect()
}

/// Index of the slot holding the smallest clock newer than `last_clock`.
fn freshest_slot(channels: &[ShmChannel], last_clock: u64) -> Option<usize> {
    channels
        .iter()
        .enumerate()
        .filter(|(_, c)| c.peek_clock() > last_clock)
        .min_by_key(|(_, c)| c.peek_clock())
        .map(|(i, _)| i)
}

#[allow(clippy::too_many_arguments)]
fn read_one(
    channels: &mut [ShmChannel],
    idx: usize,
    acks: &[AckHandle],
    options: &ShmReaderOptions,
    sink: &ShmSink,
    drops: &AtomicU64,
    last_clock: &mut u64,
) {
    match channels[idx].try_read(*last_clock, options.lock_timeout) {
        Ok(Some(msg)) => {
            let gap = msg.clock - *last_clock - 1;
            if gap > 0 {
                drops.fetch_add(gap, Ordering::AcqRel);
                log::debug!("[SHM] {} messages dropped (clock gap)", gap);
            }
            *last_clock = msg.clock;
            sink(msg, acks[idx].clone());
        }
        Ok(None) => {} // spurious wake
        Err(e) => {
            log::debug!("[SHM] read on {} failed: {e}", channels[idx].name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::writer::{ShmWriter, ShmWriterOptions};
    use std::sync::mpsc;

    fn unique_base() -> String {
        format!(
            "ecal_test_rd_{}_{:08x}",
            std::process::id(),
            fastrand::u32(..)
        )
    }

    fn fast_options() -> ShmReaderOptions {
        ShmReaderOptions {
            poll_interval: Duration::from_millis(20),
            lock_timeout: Duration::from_millis(100),
            detach_after: Duration::from_millis(500),
        }
    }

    fn collecting_sink() -> (ShmSink, mpsc::Receiver<ReceivedPayload>) {
        let (tx, rx) = mpsc::channel();
        let sink: ShmSink = Arc::new(move |msg, ack: AckHandle| {
            tx.send(msg).ok();
            ack.ack();
        });
        (sink, rx)
    }

    #[test]
    fn receives_messages_in_clock_order() {
        let base = unique_base();
        let mut writer =
            ShmWriter::create(&base, 9, ShmWriterOptions::default()).expect("writer");
        let (sink, rx) = collecting_sink();
        let reader = ShmReader::attach(writer.slot_names(), fast_options(), sink);

        // Let the reader finish attaching before the first write.
        std::thread::sleep(Duration::from_millis(50));
        for clock in 1..=3u64 {
            writer
                .send(format!("m{clock}").as_bytes(), clock, clock as i64)
                .expect("send");
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut clocks = Vec::new();
        for _ in 0..3 {
            let msg = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
            clocks.push(msg.clock);
        }
        assert_eq!(clocks, [1, 2, 3]);
        assert_eq!(reader.drops(), 0);
        reader.detach();
    }

    #[test]
    fn clock_gaps_count_as_drops() {
        let base = unique_base();
        let mut writer =
            ShmWriter::create(&base, 9, ShmWriterOptions::default()).expect("writer");
        let (sink, rx) = collecting_sink();
        let reader = ShmReader::attach(writer.slot_names(), fast_options(), sink);

        std::thread::sleep(Duration::from_millis(50));
        writer.send(b"a", 1, 0).expect("send");
        std::thread::sleep(Duration::from_millis(30));
        // Simulate two lost messages.
        writer.send(b"b", 4, 0).expect("send");

        let first = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("recv");
        assert_eq!(first.clock, 1);
        assert_eq!(second.clock, 4);
        assert_eq!(reader.drops(), 2);
        reader.detach();
    }

    #[test]
    fn attach_to_missing_writer_detaches_after_ttl() {
        let (sink, _rx) = collecting_sink();
        let reader = ShmReader::attach(
            vec!["ecal_test_never_exists_1_0".to_string()],
            fast_options(),
            sink,
        );
        std::thread::sleep(Duration::from_millis(700));
        assert!(reader.is_detached());
    }

    #[test]
    fn vanished_writer_detaches_reader() {
        let base = unique_base();
        let writer =
            ShmWriter::create(&base, 9, ShmWriterOptions::default()).expect("writer");
        let names = writer.slot_names();
        let (sink, _rx) = collecting_sink();
        let reader = ShmReader::attach(names, fast_options(), sink);

        std::thread::sleep(Duration::from_millis(50));
        drop(writer); // unlinks all channel files

        std::thread::sleep(Duration::from_millis(900));
        assert!(reader.is_detached());
    }

    #[test]
    fn detach_is_prompt() {
        let base = unique_base();
        let mut writer =
            ShmWriter::create(&base, 9, ShmWriterOptions::default()).expect("writer");
        let (sink, _rx) = collecting_sink();
        let reader = ShmReader::attach(writer.slot_names(), fast_options(), sink);
        std::thread::sleep(Duration::from_millis(50));
        writer.send(b"x", 1, 0).expect("send");

        let start = Instant::now();
        reader.detach();
        // One poll interval plus slack.
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
