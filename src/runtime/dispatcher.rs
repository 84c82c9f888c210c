//! Public facade: shard pool lifecycle, submission routing, cooperative
//! shutdown.
//!
//! # Architecture
//!
//! `FrameBuilder` owns `N` independent aggregation shards. Every submitted
//! slice routes to shard `timestamp % N`; each shard has its own buffer,
//! worker thread, counters and sinks, so shards never contend with each
//! other. Producers only ever touch a shard's mutex for the duration of one
//! map insert.
//!
//! # Shutdown
//!
//! Shutdown is cooperative: clear the shared `running` flag, wake every
//! worker, then wait a bounded time per worker. The ring's blocking publish
//! can stall indefinitely under congestion, and shutdown must stay
//! deterministic, so a worker that misses its deadline is detached (its
//! join handle is dropped) and the process is expected to exit shortly.
//! At-most-once delivery is traded for liveness.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::config::{BuilderConfig, ConfigError};
use crate::data::prefix::{parse_prefix, PrefixError};
use crate::data::slice::TimeSlice;
use crate::data::types::DataId;
use crate::ring::{RingAttachment, RingError, RingSystem};
use crate::runtime::buffer::ShardBuffer;
use crate::runtime::builder::BuilderShard;
use crate::runtime::stats::{ShardStats, StatsSnapshot};
use crate::sink::{FileSink, RingSink, Sink};
use crate::trace::{info, trace, warn};

/// How long shutdown waits for each worker before detaching it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a worker to finish.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Startup failures. No worker is left running when `start` errors.
#[derive(Debug, Error)]
pub enum StartError {
    /// `start` was called twice.
    #[error("builder already started")]
    AlreadyStarted,
    /// The output directory could not be created.
    #[error("failed to create output directory {dir:?}: {source}")]
    OutputDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Ring output is configured but no ring system was supplied.
    #[error("ring output configured but no ring system supplied")]
    RingMissing,
    /// A per-shard station attach failed.
    #[error("ring attach failed for shard {shard}: {source}")]
    RingAttach {
        shard: u32,
        #[source]
        source: RingError,
    },
}

/// Multi-shard frame builder.
///
/// Construct with [`new`](Self::new), bring up with [`start`](Self::start),
/// feed via [`submit`](Self::submit) or [`submit_raw`](Self::submit_raw)
/// from any number of threads, and finish with
/// [`shutdown`](Self::shutdown).
pub struct FrameBuilder {
    config: BuilderConfig,
    ring: Option<Arc<dyn RingSystem>>,
    buffers: Vec<Arc<ShardBuffer>>,
    shard_stats: Vec<Arc<ShardStats>>,
    invalid_submissions: AtomicU64,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl FrameBuilder {
    /// Creates a builder from a validated configuration.
    ///
    /// `ring` supplies the ring system when ring output is configured;
    /// pass `None` for file-only operation.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if no output is enabled or the shard count
    /// is out of range.
    pub fn new(
        config: BuilderConfig,
        ring: Option<Arc<dyn RingSystem>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let shards = config.shard_count as usize;
        let buffers = (0..shards).map(|_| Arc::new(ShardBuffer::new())).collect();
        let shard_stats = (0..shards)
            .map(|_| Arc::new(ShardStats::default()))
            .collect();

        Ok(Self {
            config,
            ring,
            buffers,
            shard_stats,
            invalid_submissions: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Number of aggregation shards.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.config.shard_count
    }

    /// Brings up the outputs and spawns one worker per shard.
    ///
    /// Startup is atomic: if any per-shard ring attach fails, previously
    /// acquired attachments are released and no worker is spawned.
    ///
    /// # Errors
    /// See [`StartError`].
    ///
    /// # Panics
    /// Panics if the OS refuses to spawn a worker thread.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.running.load(Ordering::Relaxed) || !self.workers.is_empty() {
            return Err(StartError::AlreadyStarted);
        }

        if let Some(file) = &self.config.file {
            std::fs::create_dir_all(&file.dir).map_err(|source| StartError::OutputDir {
                dir: file.dir.clone(),
                source,
            })?;
        }

        // Acquire every ring attachment before any worker exists, so a
        // failure can unwind cleanly.
        let mut attachments: Vec<Option<Box<dyn RingAttachment>>> = Vec::new();
        if self.config.ring.is_some() {
            let ring = self.ring.as_ref().ok_or(StartError::RingMissing)?;
            for shard in 0..self.config.shard_count {
                match ring.attach(0) {
                    Ok(attachment) => attachments.push(Some(attachment)),
                    Err(source) => {
                        // Dropping the acquired attachments detaches them.
                        drop(attachments);
                        return Err(StartError::RingAttach { shard, source });
                    }
                }
            }
        }

        self.running.store(true, Ordering::Relaxed);

        for index in 0..self.config.shard_count {
            let stats = Arc::clone(&self.shard_stats[index as usize]);

            let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
            if let Some(ring_config) = &self.config.ring {
                if let Some(attachment) = attachments
                    .get_mut(index as usize)
                    .and_then(Option::take)
                {
                    sinks.push(Box::new(RingSink::new(
                        attachment,
                        ring_config.event_size,
                        Arc::clone(&stats),
                    )));
                }
            }
            if let Some(file_config) = &self.config.file {
                sinks.push(Box::new(FileSink::new(
                    file_config,
                    index,
                    Arc::clone(&stats),
                )));
            }

            let mut worker = BuilderShard::new(
                index,
                &self.config,
                Arc::clone(&self.buffers[index as usize]),
                sinks,
                Arc::clone(&self.running),
                stats,
            );

            let handle = thread::Builder::new()
                .name(format!("builder-{index}"))
                .spawn(move || worker.run())
                .expect("failed to spawn builder thread");
            self.workers.push(handle);
        }

        info!(
            shards = self.config.shard_count,
            ring = self.config.ring.is_some(),
            file = self.config.file.is_some(),
            "frame builder started"
        );
        Ok(())
    }

    /// Submits one reassembled slice.
    ///
    /// Thread-safe; callable concurrently from any number of producers.
    /// The payload is copied, the slice is routed to shard
    /// `timestamp % shard_count`, and the shard's worker is signalled. The
    /// call never blocks on output.
    pub fn submit(&self, timestamp: u64, frame_number: u32, data_id: DataId, payload: &[u8]) {
        let shard = (timestamp % u64::from(self.config.shard_count)) as usize;
        trace!(
            timestamp,
            frame_number,
            data_id = %data_id,
            shard,
            bytes = payload.len(),
            "slice submitted"
        );
        self.shard_stats[shard].record_slice();
        self.buffers[shard].insert(TimeSlice::new(timestamp, frame_number, data_id, payload));
    }

    /// Validates a raw payload's prefix and submits it.
    ///
    /// The metadata (timestamp, frame number, source id) is taken from the
    /// payload itself rather than from transport-level bookkeeping.
    ///
    /// # Errors
    /// Returns the [`PrefixError`] when validation fails; nothing is
    /// submitted and the drop is counted.
    pub fn submit_raw(&self, payload: &[u8]) -> Result<(), PrefixError> {
        match parse_prefix(payload) {
            Ok(prefix) => {
                self.submit(
                    prefix.timestamp,
                    prefix.frame_number,
                    prefix.data_id,
                    payload,
                );
                Ok(())
            }
            Err(e) => {
                self.invalid_submissions.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = payload.len(), "payload rejected");
                Err(e)
            }
        }
    }

    /// Live counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot =
            StatsSnapshot::aggregate(self.shard_stats.iter().map(Arc::as_ref));
        snapshot.invalid_submissions = self.invalid_submissions.load(Ordering::Relaxed);
        snapshot
    }

    /// Frames built by each shard, indexed by shard.
    #[must_use]
    pub fn frames_built_per_shard(&self) -> Vec<u64> {
        self.shard_stats.iter().map(|s| s.frames_built()).collect()
    }

    /// Stops all workers and closes the outputs.
    ///
    /// Signals every shard, then waits up to one second per worker. A
    /// worker that does not exit in time (a stalled ring publish, say) is
    /// detached; its resources are reclaimed at process exit. Idempotent.
    pub fn shutdown(&mut self) -> StatsSnapshot {
        if self.workers.is_empty() && !self.running.load(Ordering::Relaxed) {
            return self.stats();
        }
        info!("frame builder shutdown initiated");

        self.running.store(false, Ordering::Relaxed);
        for buffer in &self.buffers {
            buffer.wake_all();
        }

        for (index, handle) in self.workers.drain(..).enumerate() {
            let deadline = Instant::now() + SHUTDOWN_WAIT;
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(shard = index, "worker did not stop in time, detaching");
                    drop(handle);
                    break;
                }
                thread::sleep(JOIN_POLL_INTERVAL);
            }
        }

        if let Some(ring) = self.ring.take() {
            ring.close();
        }

        let snapshot = self.stats();
        info!(
            frames_built = snapshot.frames_built,
            slices_seen = snapshot.slices_seen,
            build_errors = snapshot.build_errors,
            "frame builder stopped"
        );
        snapshot
    }
}

impl Drop for FrameBuilder {
    fn drop(&mut self) {
        // Signal shutdown if not already done; workers are not joined here.
        // In normal usage, shutdown() should be called explicitly.
        self.running.store(false, Ordering::Relaxed);
        for buffer in &self.buffers {
            buffer.wake_all();
        }
    }
}
