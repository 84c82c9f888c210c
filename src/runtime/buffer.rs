//! Per-shard aggregation buffer.
//!
//! Frames keyed by timestamp behind a single mutex, with a condition
//! variable signalled on every insert and on shutdown. Producers contend
//! with the shard's worker on the mutex; insert hold time is one map
//! operation (the payload copy happens before the lock is taken).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::data::slice::{AggregatedFrame, TimeSlice};

/// Timestamp-keyed frame map for one shard.
#[derive(Default)]
pub struct ShardBuffer {
    frames: Mutex<HashMap<u64, AggregatedFrame>>,
    work: Condvar,
}

impl ShardBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, AggregatedFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a slice, creating and seeding the frame if this is its first
    /// slice, and wakes the worker.
    pub fn insert(&self, slice: TimeSlice) {
        let mut frames = self.lock();
        match frames.entry(slice.timestamp) {
            Entry::Occupied(mut entry) => entry.get_mut().push(slice),
            Entry::Vacant(entry) => {
                entry.insert(AggregatedFrame::seeded(slice));
            }
        }
        drop(frames);
        self.work.notify_one();
    }

    /// Blocks until the map is non-empty, `running` clears, or `timeout`
    /// elapses, whichever comes first.
    pub fn wait_for_work(&self, timeout: Duration, running: &AtomicBool) {
        let frames = self.lock();
        let _unused = self
            .work
            .wait_timeout_while(frames, timeout, |frames| {
                frames.is_empty() && running.load(Ordering::Relaxed)
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Timestamps of every frame currently ready for emission.
    #[must_use]
    pub fn ready_timestamps(&self, expected_streams: usize, timeout: Duration) -> Vec<u64> {
        let frames = self.lock();
        frames
            .iter()
            .filter(|(_, frame)| frame.is_ready(expected_streams, timeout))
            .map(|(&ts, _)| ts)
            .collect()
    }

    /// Removes one frame, if still present.
    #[must_use]
    pub fn remove(&self, timestamp: u64) -> Option<AggregatedFrame> {
        self.lock().remove(&timestamp)
    }

    /// Wakes the worker without inserting anything (shutdown path).
    ///
    /// Takes the lock first so a worker between its shutdown check and its
    /// condvar wait cannot sleep through the signal.
    pub fn wake_all(&self) {
        let _frames = self.lock();
        self.work.notify_all();
    }

    /// Number of frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no frame is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
