//! SPSC byte ring buffer (C1) bridging the real-time audio callback to the
//! async consumer side of the pipeline.
//!
//! The producer (the cpal input callback) never blocks: `write` fills
//! whatever room is available and reports how many bytes it actually wrote.
//! The consumer blocks via `wait_for`, which is signaled by a condvar on
//! every write so it wakes promptly instead of polling.

use parking_lot::{Condvar, Mutex};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use std::time::Duration;

use crate::config::RingBufferConfig;

struct Inner {
    producer: ringbuf::HeapProd<u8>,
    consumer: ringbuf::HeapCons<u8>,
}

/// A single-producer single-consumer byte ring buffer with a blocking
/// `wait_for`.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given configuration.
    pub fn new(config: &RingBufferConfig) -> Self {
        let rb = HeapRb::<u8>::new(config.capacity_bytes);
        let (producer, consumer) = rb.split();
        Self {
            inner: Mutex::new(Inner { producer, consumer }),
            not_empty: Condvar::new(),
            capacity: config.capacity_bytes,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write as many bytes from `data` as currently fit. Never blocks.
    /// Returns the number of bytes actually written; bytes beyond that are
    /// dropped by the caller (the audio callback logs the drop count).
    pub fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let written = inner.producer.push_slice(data);
        if written > 0 {
            self.not_empty.notify_one();
        }
        written
    }

    /// Read up to `buf.len()` bytes without blocking. Returns the number of
    /// bytes read (may be 0).
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        inner.consumer.pop_slice(buf)
    }

    /// Number of bytes currently available to read.
    pub fn bytes_available(&self) -> usize {
        let inner = self.inner.lock();
        inner.consumer.occupied_len()
    }

    /// Block until at least `min_bytes` are available or `timeout` elapses.
    /// Returns the number of bytes available when it returned (may be less
    /// than `min_bytes` on timeout).
    pub fn wait_for(&self, min_bytes: usize, timeout: Duration) -> usize {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let available = inner.consumer.occupied_len();
            if available >= min_bytes {
                return available;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return available;
            }
            let result = self.not_empty.wait_for(&mut inner, remaining);
            if result.timed_out() {
                return inner.consumer.occupied_len();
            }
        }
    }

    /// Discard all buffered bytes.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let available = inner.consumer.occupied_len();
        let mut sink = vec![0u8; available];
        inner.consumer.pop_slice(&mut sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity_bytes: usize) -> RingBuffer {
        RingBuffer::new(&RingBufferConfig {
            capacity_bytes,
            wait_timeout_ms: 100,
        })
    }

    #[test]
    fn write_then_read_round_trips() {
        let rb = ring(16);
        assert_eq!(rb.write(&[1, 2, 3]), 3);
        let mut buf = [0u8; 3];
        assert_eq!(rb.read(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn write_past_capacity_truncates_without_overwrite() {
        let rb = ring(4);
        assert_eq!(rb.write(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(rb.bytes_available(), 4);
    }

    #[test]
    fn wait_for_returns_immediately_when_data_present() {
        let rb = ring(16);
        rb.write(&[9, 9]);
        let n = rb.wait_for(2, Duration::from_millis(500));
        assert_eq!(n, 2);
    }

    #[test]
    fn wait_for_times_out_when_no_data_arrives() {
        let rb = ring(16);
        let start = std::time::Instant::now();
        let n = rb.wait_for(4, Duration::from_millis(50));
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn clear_drops_all_buffered_bytes() {
        let rb = ring(16);
        rb.write(&[1, 2, 3]);
        rb.clear();
        assert_eq!(rb.bytes_available(), 0);
    }
}
