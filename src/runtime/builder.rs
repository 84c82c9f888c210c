//! Per-shard builder worker.
//!
//! Responsibilities:
//! - Wait on the shard's condition variable, bounded by half the frame
//!   timeout so lonely frames still emit on time.
//! - Scan the buffer for ready frames (complete or timed out).
//! - Remove each ready frame under the lock, then encode and publish with
//!   the lock released.
//! - Observe the shutdown flag around every blocking step; frames held in
//!   local variables at that moment are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BuilderConfig;
use crate::data::slice::AggregatedFrame;
use crate::record;
use crate::runtime::buffer::ShardBuffer;
use crate::runtime::stats::ShardStats;
use crate::sink::Sink;
use crate::trace::{debug, info, warn};

/// One shard's worker state.
pub struct BuilderShard {
    index: u32,
    buffer: Arc<ShardBuffer>,
    sinks: Vec<Box<dyn Sink>>,
    running: Arc<AtomicBool>,
    stats: Arc<ShardStats>,
    expected_streams: usize,
    frame_timeout: Duration,
    timestamp_slop: u64,
}

impl BuilderShard {
    /// Creates the worker for shard `index`.
    ///
    /// # Arguments
    ///
    /// * `config` - Source of the readiness and encoding parameters.
    /// * `buffer` - The shard's frame buffer, shared with producers.
    /// * `sinks` - Outputs owned exclusively by this worker.
    /// * `running` - Cooperative shutdown flag shared with the dispatcher.
    /// * `stats` - This shard's counters.
    #[must_use]
    pub fn new(
        index: u32,
        config: &BuilderConfig,
        buffer: Arc<ShardBuffer>,
        sinks: Vec<Box<dyn Sink>>,
        running: Arc<AtomicBool>,
        stats: Arc<ShardStats>,
    ) -> Self {
        Self {
            index,
            buffer,
            sinks,
            running,
            stats,
            expected_streams: config.expected_streams,
            frame_timeout: config.frame_timeout,
            timestamp_slop: config.timestamp_slop,
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Runs the worker loop until shutdown is observed.
    pub fn run(&mut self) {
        info!(shard = self.index, "builder worker started");
        let wait = self.frame_timeout / 2;

        loop {
            self.buffer.wait_for_work(wait, &self.running);
            if !self.running() {
                break;
            }
            if !self.drain_ready() {
                break;
            }
        }

        for sink in &mut self.sinks {
            sink.close();
        }
        info!(shard = self.index, "builder worker stopped");
    }

    /// Publishes every currently-ready frame. Returns `false` if shutdown
    /// was observed mid-drain.
    fn drain_ready(&mut self) -> bool {
        let ready = self
            .buffer
            .ready_timestamps(self.expected_streams, self.frame_timeout);

        for timestamp in ready {
            if !self.running() {
                return false;
            }
            // Only this worker removes from the buffer, but the frame can
            // have grown since the scan; whatever is present now is taken.
            let Some(frame) = self.buffer.remove(timestamp) else {
                continue;
            };
            self.publish_frame(&frame);
            if !self.running() {
                return false;
            }
        }
        true
    }

    /// Encodes one frame and offers it to every sink.
    fn publish_frame(&mut self, frame: &AggregatedFrame) {
        let record = match record::encode(frame, self.timestamp_slop) {
            Ok(record) => record,
            Err(_e) => {
                warn!(
                    shard = self.index,
                    timestamp = frame.timestamp(),
                    error = %_e,
                    "frame dropped"
                );
                self.stats.record_build_error();
                return;
            }
        };

        if record.slop_exceeded {
            self.stats.record_timestamp_error();
            warn!(
                shard = self.index,
                timestamp = frame.timestamp(),
                slop = self.timestamp_slop,
                "timestamp spread exceeded, record flagged"
            );
        }
        if record.dropped_slices > 0 {
            warn!(
                shard = self.index,
                timestamp = frame.timestamp(),
                dropped = record.dropped_slices,
                "invalid slices dropped from record"
            );
        }

        let mut delivered = false;
        for sink in &mut self.sinks {
            if !self.running.load(Ordering::Relaxed) {
                // Shutdown mid-publish: the frame is discarded, remaining
                // sinks never see it.
                return;
            }
            match sink.publish(&record.bytes) {
                Ok(()) => delivered = true,
                Err(_e) => {
                    warn!(shard = self.index, error = %_e, "sink rejected record");
                    self.stats.record_build_error();
                }
            }
        }

        if delivered {
            self.stats.record_frame_built();
            debug!(
                shard = self.index,
                timestamp = frame.timestamp(),
                slices = frame.slice_count(),
                bytes = record.bytes.len(),
                "frame published"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::data::prefix::PREFIX_MAGIC;
    use crate::data::slice::TimeSlice;
    use crate::data::types::DataId;
    use crate::record::PREFIX_STRIP_BYTES;
    use crate::sink::SinkError;
    use std::sync::Mutex;

    /// Sink that records published buffers.
    struct CaptureSink {
        records: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl Sink for CaptureSink {
        fn publish(&mut self, record: &[u8]) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Io(std::io::Error::other("boom")));
            }
            self.records.lock().unwrap().push(record.to_vec());
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn valid_slice(ts: u64, id: u16) -> TimeSlice {
        let mut payload = vec![0u8; PREFIX_STRIP_BYTES];
        payload[28..32].copy_from_slice(&PREFIX_MAGIC.to_ne_bytes());
        payload.extend_from_slice(&[0xCC; 4]);
        TimeSlice::new(ts, 1, DataId(id), &payload)
    }

    fn worker_with_capture(
        expected_streams: usize,
    ) -> (BuilderShard, Arc<Mutex<Vec<Vec<u8>>>>, Arc<ShardStats>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(ShardStats::default());
        let config = BuilderConfig {
            file: Some(FileConfig::new("/unused")),
            expected_streams,
            frame_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let worker = BuilderShard::new(
            0,
            &config,
            Arc::new(ShardBuffer::new()),
            vec![Box::new(CaptureSink {
                records: Arc::clone(&records),
                fail: false,
            })],
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        );
        (worker, records, stats)
    }

    #[test]
    fn drain_publishes_complete_frames() {
        let (mut worker, records, stats) = worker_with_capture(2);
        worker.buffer.insert(valid_slice(10, 1));
        worker.buffer.insert(valid_slice(10, 2));
        worker.buffer.insert(valid_slice(11, 3)); // incomplete, stays put

        assert!(worker.drain_ready());

        assert_eq!(records.lock().unwrap().len(), 1);
        assert_eq!(stats.frames_built(), 1);
        assert_eq!(worker.buffer.len(), 1);
    }

    #[test]
    fn drain_stops_when_shutdown_observed() {
        let (mut worker, records, _) = worker_with_capture(1);
        worker.buffer.insert(valid_slice(10, 1));
        worker.running.store(false, Ordering::Relaxed);

        assert!(!worker.drain_ready());
        assert!(records.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_sink_counts_error_and_frame_is_not_built() {
        let stats = Arc::new(ShardStats::default());
        let config = BuilderConfig {
            file: Some(FileConfig::new("/unused")),
            ..Default::default()
        };
        let mut worker = BuilderShard::new(
            0,
            &config,
            Arc::new(ShardBuffer::new()),
            vec![Box::new(CaptureSink {
                records: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            })],
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        );

        worker.buffer.insert(valid_slice(10, 1));
        assert!(worker.drain_ready());

        let snapshot =
            crate::runtime::stats::StatsSnapshot::aggregate([stats.as_ref()]);
        assert_eq!(snapshot.frames_built, 0);
        assert_eq!(snapshot.build_errors, 1);
    }

    #[test]
    fn one_failing_sink_does_not_block_the_other() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(ShardStats::default());
        let config = BuilderConfig {
            file: Some(FileConfig::new("/unused")),
            ..Default::default()
        };
        let mut worker = BuilderShard::new(
            0,
            &config,
            Arc::new(ShardBuffer::new()),
            vec![
                Box::new(CaptureSink {
                    records: Arc::new(Mutex::new(Vec::new())),
                    fail: true,
                }),
                Box::new(CaptureSink {
                    records: Arc::clone(&records),
                    fail: false,
                }),
            ],
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        );

        worker.buffer.insert(valid_slice(10, 1));
        assert!(worker.drain_ready());

        assert_eq!(records.lock().unwrap().len(), 1);
        let snapshot =
            crate::runtime::stats::StatsSnapshot::aggregate([stats.as_ref()]);
        assert_eq!(snapshot.frames_built, 1);
        assert_eq!(snapshot.build_errors, 1);
    }

    #[test]
    fn frame_with_no_valid_slices_is_dropped() {
        let (mut worker, records, stats) = worker_with_capture(1);
        worker
            .buffer
            .insert(TimeSlice::new(10, 1, DataId(1), &[0u8; 8]));

        assert!(worker.drain_ready());

        assert!(records.lock().unwrap().is_empty());
        let snapshot =
            crate::runtime::stats::StatsSnapshot::aggregate([stats.as_ref()]);
        assert_eq!(snapshot.build_errors, 1);
    }
}
