//! Ring publisher sink.
//!
//! Leases a pre-allocated event from the shard's ring attachment within a
//! bounded wait, copies the record in, and puts the event. A record larger
//! than the event is dumped back and the frame is lost; the worker keeps
//! running either way.

use std::sync::Arc;
use std::time::Duration;

use crate::ring::{RingAttachment, RingError};
use crate::runtime::stats::ShardStats;
use crate::sink::{Sink, SinkError};
use crate::trace::trace;

/// Bounded wait for a free ring event.
const EVENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-shard ring publisher.
pub struct RingSink {
    attachment: Box<dyn RingAttachment>,
    event_size: usize,
    stats: Arc<ShardStats>,
}

impl RingSink {
    /// Wraps a station attachment acquired at startup.
    #[must_use]
    pub fn new(
        attachment: Box<dyn RingAttachment>,
        event_size: usize,
        stats: Arc<ShardStats>,
    ) -> Self {
        Self {
            attachment,
            event_size,
            stats,
        }
    }
}

impl Sink for RingSink {
    fn publish(&mut self, record: &[u8]) -> Result<(), SinkError> {
        let mut event = self
            .attachment
            .new_event(EVENT_REQUEST_TIMEOUT, self.event_size)?;

        if record.len() > event.capacity() {
            let capacity = event.capacity();
            self.attachment.dump(event);
            return Err(RingError::EventTooLarge {
                record: record.len(),
                capacity,
            }
            .into());
        }

        event.data_mut()[..record.len()].copy_from_slice(record);
        event.set_length(record.len());
        self.attachment.put(event)?;

        self.stats.record_bytes(record.len() as u64);
        trace!(bytes = record.len(), "record published to ring");
        Ok(())
    }

    fn close(&mut self) {
        // The attachment detaches when the sink is dropped.
    }
}
