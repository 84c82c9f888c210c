//! Output sinks for encoded records.

pub mod file;
pub mod ring;

use thiserror::Error;

pub use file::FileSink;
pub use ring::RingSink;

use crate::ring::RingError;

/// A sink failed to accept a record; the frame is lost for that sink and
/// the worker keeps running.
#[derive(Debug, Error)]
pub enum SinkError {
    /// File open, write or flush failed.
    #[error("file i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Ring request, size check or put failed.
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Destination for encoded records.
///
/// A sink instance belongs to exactly one builder shard and is only ever
/// driven from that shard's worker thread.
pub trait Sink: Send {
    /// Accepts one complete record.
    ///
    /// # Errors
    /// Returns a [`SinkError`] when the record could not be delivered; the
    /// caller counts the loss and continues.
    fn publish(&mut self, record: &[u8]) -> Result<(), SinkError>;

    /// Flushes and releases resources during orderly shutdown.
    fn close(&mut self);
}
