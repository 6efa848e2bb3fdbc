//! Stream pool
//!
//! Completed streams that are safe to reuse are kept on a bounded LIFO
//! stack so a busy connection does not allocate a fresh pipe, producer and
//! header buffers for every request. Entries expire after a TTL; the oldest
//! sit at the bottom of the stack and are swept first.

use super::stream::Stream;
use std::time::{Duration, Instant};

/// Bounded LIFO of reusable streams
pub struct StreamPool {
    /// Streams with the instant they stop being worth keeping
    stack: Vec<(Stream, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl StreamPool {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        StreamPool {
            stack: Vec::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    /// Offer a removed stream to the pool
    ///
    /// Streams that were aborted or still have outstanding output are
    /// refused and dropped, as are streams offered to a full pool. Returns
    /// whether the stream was kept.
    pub fn push(&mut self, stream: Stream, now: Instant) -> bool {
        if !stream.can_reuse() || self.stack.len() >= self.capacity {
            return false;
        }
        self.stack.push((stream, now + self.ttl));
        true
    }

    /// Take the most recently pooled stream that has not expired
    pub fn pop(&mut self, now: Instant) -> Option<Stream> {
        self.remove_expired(now);
        self.stack.pop().map(|(stream, _)| stream)
    }

    /// Drop every stream whose TTL has passed
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let expired = self
            .stack
            .iter()
            .take_while(|(_, expires)| *expires <= now)
            .count();
        self.stack.drain(..expired);
        expired
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pooled stream
    pub fn clear(&mut self) {
        self.stack.clear();
    }

    /// Iterate pooled streams, newest last
    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.stack.iter().map(|(stream, _)| stream)
    }
}
