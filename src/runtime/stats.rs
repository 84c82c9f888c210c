//! Build counters.
//!
//! Each shard owns one [`ShardStats`]; its worker (and the sinks running on
//! that worker's thread) is the only writer. The counters are relaxed
//! atomics rather than plain integers so the dispatcher can aggregate them
//! even while a detached worker is still winding down.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters for one shard.
#[derive(Debug, Default)]
pub struct ShardStats {
    frames_built: AtomicU64,
    slices_seen: AtomicU64,
    build_errors: AtomicU64,
    timestamp_errors: AtomicU64,
    files_created: AtomicU64,
    bytes_written: AtomicU64,
}

impl ShardStats {
    /// One frame accepted by at least one sink.
    pub fn record_frame_built(&self) {
        self.frames_built.fetch_add(1, Ordering::Relaxed);
    }

    /// One slice routed to this shard.
    pub fn record_slice(&self) {
        self.slices_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// One frame lost to an encode or sink failure.
    pub fn record_build_error(&self) {
        self.build_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// One emitted record whose slice timestamps exceeded the slop.
    pub fn record_timestamp_error(&self) {
        self.timestamp_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// One output file opened.
    pub fn record_file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes accepted by one sink.
    pub fn record_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Frames accepted by at least one sink.
    #[must_use]
    pub fn frames_built(&self) -> u64 {
        self.frames_built.load(Ordering::Relaxed)
    }

    /// Slices routed to this shard.
    #[must_use]
    pub fn slices_seen(&self) -> u64 {
        self.slices_seen.load(Ordering::Relaxed)
    }
}

/// Aggregated totals across every shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames accepted by at least one sink.
    pub frames_built: u64,
    /// Slices submitted across all shards.
    pub slices_seen: u64,
    /// Frames lost to encode or sink failures.
    pub build_errors: u64,
    /// Emitted records whose timestamp spread exceeded the slop.
    pub timestamp_errors: u64,
    /// Output files opened.
    pub files_created: u64,
    /// Bytes accepted by sinks (dual-output frames count once per sink).
    pub bytes_written: u64,
    /// Raw payloads rejected by prefix validation before submission.
    pub invalid_submissions: u64,
}

impl StatsSnapshot {
    /// Sums the per-shard counters.
    pub fn aggregate<'a>(shards: impl IntoIterator<Item = &'a ShardStats>) -> Self {
        let mut snapshot = Self::default();
        for stats in shards {
            snapshot.frames_built += stats.frames_built.load(Ordering::Relaxed);
            snapshot.slices_seen += stats.slices_seen.load(Ordering::Relaxed);
            snapshot.build_errors += stats.build_errors.load(Ordering::Relaxed);
            snapshot.timestamp_errors += stats.timestamp_errors.load(Ordering::Relaxed);
            snapshot.files_created += stats.files_created.load(Ordering::Relaxed);
            snapshot.bytes_written += stats.bytes_written.load(Ordering::Relaxed);
        }
        snapshot
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frames built:      {}", self.frames_built)?;
        writeln!(f, "slices seen:       {}", self.slices_seen)?;
        if self.frames_built > 0 {
            writeln!(
                f,
                "avg slices/frame:  {:.2}",
                self.slices_seen as f64 / self.frames_built as f64
            )?;
        }
        writeln!(f, "build errors:      {}", self.build_errors)?;
        writeln!(f, "timestamp errors:  {}", self.timestamp_errors)?;
        writeln!(f, "invalid payloads:  {}", self.invalid_submissions)?;
        writeln!(f, "files created:     {}", self.files_created)?;
        write!(f, "bytes written:     {}", self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_across_shards() {
        let a = ShardStats::default();
        let b = ShardStats::default();

        a.record_frame_built();
        a.record_slice();
        a.record_bytes(100);
        b.record_frame_built();
        b.record_frame_built();
        b.record_timestamp_error();
        b.record_bytes(50);

        let snapshot = StatsSnapshot::aggregate([&a, &b]);
        assert_eq!(snapshot.frames_built, 3);
        assert_eq!(snapshot.slices_seen, 1);
        assert_eq!(snapshot.timestamp_errors, 1);
        assert_eq!(snapshot.bytes_written, 150);
    }

    #[test]
    fn display_includes_totals() {
        let snapshot = StatsSnapshot {
            frames_built: 2,
            slices_seen: 6,
            ..Default::default()
        };
        let text = snapshot.to_string();
        assert!(text.contains("frames built:      2"));
        assert!(text.contains("avg slices/frame:  3.00"));
    }
}
