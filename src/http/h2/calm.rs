//! Enhance-your-calm counter
//!
//! Counts stream starts over a sliding window made of fixed buckets. A
//! client that opens (and typically resets) streams faster than the ceiling
//! allows gets the connection closed with ENHANCE_YOUR_CALM.

use std::time::{Duration, Instant};

const BUCKETS: usize = 10;

/// Sliding-window stream start counter
#[derive(Debug, Clone)]
pub struct CalmDownCounter {
    buckets: [u32; BUCKETS],
    bucket_width: Duration,
    /// Start of the bucket at `current`
    bucket_start: Instant,
    current: usize,
    max_starts: u32,
}

impl CalmDownCounter {
    /// Allow at most `max_starts` stream starts within any `window`
    pub fn new(max_starts: u32, window: Duration, now: Instant) -> Self {
        let bucket_width = (window / BUCKETS as u32).max(Duration::from_millis(1));
        CalmDownCounter {
            buckets: [0; BUCKETS],
            bucket_width,
            bucket_start: now,
            current: 0,
            max_starts,
        }
    }

    /// Record one stream start; returns false once the ceiling is exceeded
    pub fn record_start(&mut self, now: Instant) -> bool {
        self.advance(now);
        self.buckets[self.current] = self.buckets[self.current].saturating_add(1);
        self.total() <= self.max_starts
    }

    /// Stream starts within the current window
    pub fn total(&self) -> u32 {
        self.buckets.iter().sum()
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.bucket_start);
        let steps = (elapsed.as_nanos() / self.bucket_width.as_nanos()) as usize;
        if steps == 0 {
            return;
        }

        for _ in 0..steps.min(BUCKETS) {
            self.current = (self.current + 1) % BUCKETS;
            self.buckets[self.current] = 0;
        }
        self.bucket_start += self.bucket_width * steps as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling() {
        let now = Instant::now();
        let mut counter = CalmDownCounter::new(5, Duration::from_secs(1), now);
        for _ in 0..5 {
            assert!(counter.record_start(now));
        }
        assert!(!counter.record_start(now));
    }

    #[test]
    fn test_window_slides() {
        let start = Instant::now();
        let mut counter = CalmDownCounter::new(5, Duration::from_secs(1), start);
        for _ in 0..5 {
            assert!(counter.record_start(start));
        }

        // Half a window later the old starts still count.
        assert!(!counter.record_start(start + Duration::from_millis(500)));

        // A full window later they have aged out.
        let later = start + Duration::from_millis(1600);
        assert!(counter.record_start(later));
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn test_spread_out_starts_allowed() {
        let start = Instant::now();
        let mut counter = CalmDownCounter::new(3, Duration::from_secs(1), start);
        for i in 0..30u64 {
            assert!(counter.record_start(start + Duration::from_millis(400 * i)));
        }
    }
}
