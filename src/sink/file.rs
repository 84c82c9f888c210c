//! Rolling file sink.
//!
//! Files are opened lazily on the first record, start with the 14-word
//! preamble, and roll over to the next sequence number once the size
//! counter (preamble included) reaches the configured cap. File names
//! carry the shard index so concurrent workers never collide:
//! `{prefix}_thread{shard}_file{NNNN}.evio`.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::FileConfig;
use crate::record;
use crate::runtime::stats::ShardStats;
use crate::sink::{Sink, SinkError};
use crate::trace::{info, warn};

/// Size-capped record writer for one shard.
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    shard: u32,
    max_file_size: u64,
    file: Option<File>,
    current_size: u64,
    file_number: u32,
    stats: Arc<ShardStats>,
}

impl FileSink {
    /// Creates the sink without touching the filesystem; the first record
    /// opens the first file.
    #[must_use]
    pub fn new(config: &FileConfig, shard: u32, stats: Arc<ShardStats>) -> Self {
        Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            shard,
            max_file_size: config.max_file_size,
            file: None,
            current_size: 0,
            file_number: 0,
            stats,
        }
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}_thread{}_file{:04}.evio",
            self.prefix, self.shard, self.file_number
        ))
    }

    /// Opens the file at the current sequence number and writes the
    /// preamble. The previous file, if any, is closed by replacement.
    fn open_next(&mut self) -> io::Result<()> {
        let path = self.current_path();
        let mut file = File::create(&path)?;
        file.write_all(&record::file_preamble())?;

        self.current_size = record::FILE_PREAMBLE_BYTES as u64;
        self.file = Some(file);
        self.stats.record_file_created();
        info!(shard = self.shard, path = %path.display(), "opened output file");
        Ok(())
    }
}

impl Sink for FileSink {
    fn publish(&mut self, record: &[u8]) -> Result<(), SinkError> {
        if self.file.is_none() {
            self.open_next()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("output file not open"))?;

        file.write_all(record)?;
        self.current_size += record.len() as u64;
        self.stats.record_bytes(record.len() as u64);

        if self.current_size >= self.max_file_size {
            info!(
                shard = self.shard,
                size = self.current_size,
                "file size cap reached, rolling over"
            );
            self.file_number += 1;
            // The record made it out; a failed rollover only affects the
            // next publish, which will retry the open.
            if let Err(e) = self.open_next() {
                warn!(shard = self.shard, error = %e, "failed to open next file");
                self.file = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(_e) = file.flush() {
                warn!(shard = self.shard, error = %_e, "flush on close failed");
            }
            info!(shard = self.shard, "closed output file");
        }
    }
}
