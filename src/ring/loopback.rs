//! In-process loopback ring.
//!
//! Pre-allocates a fixed pool of event buffers and recycles them between
//! publishers and a consumer in the same process. Publishers block (with a
//! bound) when the pool is exhausted, which models the congestion behavior
//! of a real event transport: a slow consumer eventually stalls the
//! builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::config::RingConfig;
use crate::ring::{RingAttachment, RingError, RingEvent, RingSystem};
use crate::trace::{debug, info};

/// Default number of pre-allocated events in the pool.
pub const DEFAULT_POOL_EVENTS: usize = 16;

struct State {
    /// Recycled event buffers, each `event_size` bytes.
    free: Vec<Vec<u8>>,
    /// Published events awaiting the consumer, oldest first.
    published: VecDeque<(Vec<u8>, usize)>,
}

struct Inner {
    state: Mutex<State>,
    /// Signalled when a buffer returns to the free pool.
    pool_available: Condvar,
    /// Signalled when an event is published.
    event_ready: Condvar,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-process ring with a pre-allocated event pool.
pub struct LoopbackRing {
    inner: Arc<Inner>,
}

impl LoopbackRing {
    /// Opens a loopback ring sized from `config`, with the default pool.
    ///
    /// The path, host and port only describe the system being stood in
    /// for; the loopback lives entirely in this process.
    #[must_use]
    pub fn open(config: &RingConfig) -> Arc<Self> {
        info!(
            path = %config.path,
            cast = ?config.cast_mode(),
            event_size = config.event_size,
            "opening loopback ring"
        );
        Self::with_pool(config.event_size, DEFAULT_POOL_EVENTS)
    }

    /// Opens a loopback ring with `pool_events` buffers of `event_size`
    /// bytes each.
    #[must_use]
    pub fn with_pool(event_size: usize, pool_events: usize) -> Arc<Self> {
        let free = (0..pool_events).map(|_| vec![0u8; event_size]).collect();
        Arc::new(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    free,
                    published: VecDeque::new(),
                }),
                pool_available: Condvar::new(),
                event_ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Takes the oldest published event, if any, returning its meaningful
    /// bytes and recycling the buffer.
    #[must_use]
    pub fn take(&self) -> Option<Vec<u8>> {
        let mut state = self.inner.lock();
        Self::pop_published(&self.inner, &mut state)
    }

    /// Like [`take`](Self::take), but waits up to `timeout` for an event.
    #[must_use]
    pub fn take_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if let Some(record) = Self::pop_published(&self.inner, &mut state) {
                return Some(record);
            }
            if self.inner.closed.load(Ordering::Relaxed) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .event_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Number of published events not yet taken.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().published.len()
    }

    fn pop_published(inner: &Inner, state: &mut State) -> Option<Vec<u8>> {
        let (buf, len) = state.published.pop_front()?;
        let record = buf[..len].to_vec();
        state.free.push(buf);
        inner.pool_available.notify_one();
        Some(record)
    }
}

impl RingSystem for LoopbackRing {
    fn attach(&self, station: u32) -> Result<Box<dyn RingAttachment>, RingError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(RingError::Attach("ring closed".to_string()));
        }
        debug!(station, "loopback attach");
        Ok(Box::new(LoopbackAttachment {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        // Wake anything blocked on the pool or the consumer side.
        let _state = self.inner.lock();
        self.inner.pool_available.notify_all();
        self.inner.event_ready.notify_all();
        info!("loopback ring closed");
    }
}

struct LoopbackAttachment {
    inner: Arc<Inner>,
}

impl RingAttachment for LoopbackAttachment {
    fn new_event(&mut self, timeout: Duration, _size: usize) -> Result<RingEvent, RingError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if self.inner.closed.load(Ordering::Relaxed) {
                return Err(RingError::Closed);
            }
            if let Some(buf) = state.free.pop() {
                return Ok(RingEvent::new(buf));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingError::RequestTimeout(timeout));
            }
            let (guard, _) = self
                .inner
                .pool_available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn put(&mut self, event: RingEvent) -> Result<(), RingError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(RingError::Closed);
        }
        let (buf, len) = event.into_parts();
        let mut state = self.inner.lock();
        state.published.push_back((buf, len));
        drop(state);
        self.inner.event_ready.notify_one();
        Ok(())
    }

    fn dump(&mut self, event: RingEvent) {
        let (buf, _) = event.into_parts();
        let mut state = self.inner.lock();
        state.free.push(buf);
        drop(state);
        self.inner.pool_available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_ring() -> Arc<LoopbackRing> {
        LoopbackRing::with_pool(64, 2)
    }

    #[test]
    fn publish_and_take_roundtrip() {
        let ring = small_ring();
        let mut att = ring.attach(0).unwrap();

        let mut event = att.new_event(Duration::from_millis(10), 64).unwrap();
        event.data_mut()[..5].copy_from_slice(b"hello");
        event.set_length(5);
        att.put(event).unwrap();

        assert_eq!(ring.pending(), 1);
        assert_eq!(ring.take(), Some(b"hello".to_vec()));
        assert_eq!(ring.take(), None);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let ring = small_ring();
        let mut att = ring.attach(0).unwrap();

        let _a = att.new_event(Duration::from_millis(10), 64).unwrap();
        let _b = att.new_event(Duration::from_millis(10), 64).unwrap();

        let result = att.new_event(Duration::from_millis(20), 64);
        assert!(matches!(result, Err(RingError::RequestTimeout(_))));
    }

    #[test]
    fn dump_recycles_the_buffer() {
        let ring = LoopbackRing::with_pool(64, 1);
        let mut att = ring.attach(0).unwrap();

        let event = att.new_event(Duration::from_millis(10), 64).unwrap();
        att.dump(event);

        // The single buffer is available again.
        assert!(att.new_event(Duration::from_millis(10), 64).is_ok());
    }

    #[test]
    fn take_recycles_the_buffer() {
        let ring = LoopbackRing::with_pool(64, 1);
        let mut att = ring.attach(0).unwrap();

        let mut event = att.new_event(Duration::from_millis(10), 64).unwrap();
        event.set_length(1);
        att.put(event).unwrap();
        assert!(ring.take().is_some());

        assert!(att.new_event(Duration::from_millis(10), 64).is_ok());
    }

    #[test]
    fn closed_ring_fails_fast() {
        let ring = small_ring();
        let mut att = ring.attach(0).unwrap();
        ring.close();

        assert!(matches!(
            att.new_event(Duration::from_millis(10), 64),
            Err(RingError::Closed)
        ));
        assert!(ring.attach(0).is_err());
    }

    #[test]
    fn take_timeout_waits_for_publisher() {
        let ring = small_ring();
        let mut att = ring.attach(0).unwrap();

        let consumer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.take_timeout(Duration::from_secs(2)))
        };

        std::thread::sleep(Duration::from_millis(50));
        let mut event = att.new_event(Duration::from_millis(10), 64).unwrap();
        event.data_mut()[..3].copy_from_slice(b"abc");
        event.set_length(3);
        att.put(event).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(b"abc".to_vec()));
    }
}
