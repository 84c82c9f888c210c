//! Builder configuration and validation.
//!
//! At least one output (ring or file) must be enabled; the shard count is
//! bounded so that `timestamp % shard_count` routing stays cheap and the
//! worker pool stays manageable. Validation happens once, at
//! [`FrameBuilder::new`](crate::FrameBuilder::new).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of builder shards.
pub const MAX_SHARD_COUNT: u32 = 32;

/// Default ring event size in bytes (2 MiB).
pub const DEFAULT_RING_EVENT_SIZE: usize = 2 * 1024 * 1024;

/// Default file rollover threshold in bytes (2 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 31;

/// Default output file prefix.
pub const DEFAULT_FILE_PREFIX: &str = "frames";

/// How the ring system is located on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastMode {
    /// Discover the ring via broadcast (no host configured).
    Broadcast,
    /// Connect directly to a configured host.
    Direct,
}

/// Ring output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring system path (e.g. a shared-memory system file).
    pub path: String,
    /// Ring host; empty selects broadcast discovery.
    pub host: String,
    /// Ring server port; 0 selects the ring's default port.
    pub port: u16,
    /// Size of each pre-allocated ring event in bytes.
    pub event_size: usize,
}

impl RingConfig {
    /// Ring output targeting `path` with broadcast discovery and defaults.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: String::new(),
            port: 0,
            event_size: DEFAULT_RING_EVENT_SIZE,
        }
    }

    /// Cast mode implied by the host setting.
    #[must_use]
    pub fn cast_mode(&self) -> CastMode {
        if self.host.is_empty() {
            CastMode::Broadcast
        } else {
            CastMode::Direct
        }
    }
}

/// File output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Output directory (created on start if missing).
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
    /// Rollover threshold in bytes, preamble included.
    pub max_file_size: u64,
}

impl FileConfig {
    /// File output into `dir` with the default prefix and rollover cap.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: DEFAULT_FILE_PREFIX.to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Top-level builder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Ring output; `None` disables it.
    pub ring: Option<RingConfig>,
    /// File output; `None` disables it.
    pub file: Option<FileConfig>,
    /// Number of builder shards (1..=32). Slices route by `timestamp % shard_count`.
    pub shard_count: u32,
    /// Maximum tolerated spread between slice timestamps within one frame, in ticks.
    pub timestamp_slop: u64,
    /// How long an incomplete frame may wait before it is emitted anyway.
    pub frame_timeout: Duration,
    /// Number of slices a frame is expected to carry; reaching it triggers
    /// immediate emission.
    pub expected_streams: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            ring: None,
            file: None,
            shard_count: 1,
            timestamp_slop: 100,
            frame_timeout: Duration::from_millis(1000),
            expected_streams: 1,
        }
    }
}

impl BuilderConfig {
    /// Checks the configuration invariants.
    ///
    /// # Errors
    /// Returns an error if no output is enabled, the shard count is out of
    /// range, or the expected stream count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring.is_none() && self.file.is_none() {
            return Err(ConfigError::NoOutputEnabled);
        }
        if self.shard_count < 1 || self.shard_count > MAX_SHARD_COUNT {
            return Err(ConfigError::ShardCountOutOfRange(self.shard_count));
        }
        if self.expected_streams == 0 {
            return Err(ConfigError::NoExpectedStreams);
        }
        Ok(())
    }
}

/// Configuration rejected at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Neither ring nor file output is configured.
    #[error("no output enabled: configure ring output, file output, or both")]
    NoOutputEnabled,
    /// Shard count outside 1..=32.
    #[error("shard count {0} out of range (1..={MAX_SHARD_COUNT})")]
    ShardCountOutOfRange(u32),
    /// Expected stream count of zero would never complete a frame.
    #[error("expected stream count must be at least 1")]
    NoExpectedStreams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_output() {
        let config = BuilderConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::NoOutputEnabled));
    }

    #[test]
    fn file_only_config_is_valid() {
        let config = BuilderConfig {
            file: Some(FileConfig::new("/tmp/out")),
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn ring_only_config_is_valid() {
        let config = BuilderConfig {
            ring: Some(RingConfig::new("/tmp/ring_sys")),
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn shard_count_bounds() {
        let mut config = BuilderConfig {
            file: Some(FileConfig::new("/tmp/out")),
            ..Default::default()
        };

        config.shard_count = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ShardCountOutOfRange(0))
        );

        config.shard_count = MAX_SHARD_COUNT;
        assert_eq!(config.validate(), Ok(()));

        config.shard_count = MAX_SHARD_COUNT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ShardCountOutOfRange(33))
        );
    }

    #[test]
    fn zero_expected_streams_rejected() {
        let config = BuilderConfig {
            file: Some(FileConfig::new("/tmp/out")),
            expected_streams: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoExpectedStreams));
    }

    #[test]
    fn cast_mode_follows_host() {
        let mut ring = RingConfig::new("/tmp/ring_sys");
        assert_eq!(ring.cast_mode(), CastMode::Broadcast);

        ring.host = "daq-host-01".to_string();
        assert_eq!(ring.cast_mode(), CastMode::Direct);
    }
}
