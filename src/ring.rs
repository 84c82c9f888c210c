//! Event-transport ring seam.
//!
//! Built records are deposited into an external event-transport ring as
//! pre-allocated events. Only the call surface this crate consumes is
//! modeled here: open a system, attach to its entry station, lease an
//! event within a bounded wait, fill it, put it back (or dump it unused),
//! detach, close.
//!
//! [`loopback`] provides an in-process implementation used by tests and by
//! embedders that run aggregation and consumption inside one process.
//! Production deployments plug a client for the real transport in behind
//! the same traits.

pub mod loopback;

use std::time::Duration;

use thiserror::Error;

/// Failures at the ring boundary.
#[derive(Debug, Error)]
pub enum RingError {
    /// Could not attach to the requested station.
    #[error("ring attach failed: {0}")]
    Attach(String),
    /// No event became available within the bounded wait.
    #[error("no ring event available within {0:?}")]
    RequestTimeout(Duration),
    /// The record does not fit the pre-allocated event.
    #[error("record of {record} bytes exceeds event capacity of {capacity} bytes")]
    EventTooLarge { record: usize, capacity: usize },
    /// The ring has been closed.
    #[error("ring closed")]
    Closed,
}

/// A pre-allocated event buffer leased from the ring.
///
/// The publisher fills [`data_mut`](Self::data_mut) and records the used
/// length with [`set_length`](Self::set_length) before putting the event.
#[derive(Debug)]
pub struct RingEvent {
    buf: Vec<u8>,
    len: usize,
}

impl RingEvent {
    /// Wraps a backing buffer; its full size is the event capacity.
    #[must_use]
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, len: 0 }
    }

    /// Total bytes this event can carry.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes marked used by the publisher.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.len
    }

    /// Writable view of the backing buffer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Records how many bytes of the buffer are meaningful.
    pub fn set_length(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len;
    }

    /// Splits the event back into its backing buffer and used length.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, usize) {
        (self.buf, self.len)
    }
}

/// One station attachment, held by exactly one builder worker.
///
/// Dropping an attachment detaches it from the ring.
pub trait RingAttachment: Send {
    /// Leases a pre-allocated event of `size` bytes, waiting up to
    /// `timeout` for one to become available.
    ///
    /// # Errors
    /// [`RingError::RequestTimeout`] if no event frees up in time,
    /// [`RingError::Closed`] if the ring shut down.
    fn new_event(&mut self, timeout: Duration, size: usize) -> Result<RingEvent, RingError>;

    /// Publishes a filled event.
    ///
    /// # Errors
    /// [`RingError::Closed`] if the ring shut down.
    fn put(&mut self, event: RingEvent) -> Result<(), RingError>;

    /// Returns an event to the ring unused.
    fn dump(&mut self, event: RingEvent);
}

/// A connection to a ring system.
pub trait RingSystem: Send + Sync {
    /// Attaches to `station`, yielding an independent publisher handle.
    ///
    /// # Errors
    /// [`RingError::Attach`] if the station cannot be attached.
    fn attach(&self, station: u32) -> Result<Box<dyn RingAttachment>, RingError>;

    /// Closes the connection. Outstanding event requests fail with
    /// [`RingError::Closed`].
    fn close(&self);
}
