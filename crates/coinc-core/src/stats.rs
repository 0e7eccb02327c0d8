//! Operator-facing rate tracking.
//!
//! Singles rates are per-channel detection rates independent of any pairing;
//! they tell the operator a detector is alive long before coincidences show
//! up. Rates come from deltas of the buffers' cumulative ingest counters
//! between snapshots. Per-pair coincidence counts keep a short rolling
//! window so the display can show a trend instead of a flickering number.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::TimestampBuffer;

/// Samples kept per pair in the rolling count window.
pub const PAIR_WINDOW: usize = 20;

/// Per-channel singles rates computed between consecutive calls.
pub struct SinglesTracker {
    prev: [u64; 4],
    prev_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinglesSnapshot {
    /// Cumulative events per channel since start.
    pub totals: [u64; 4],
    /// Events per second since the previous snapshot.
    pub rates_hz: [f64; 4],
}

impl SinglesTracker {
    pub fn new() -> Self {
        Self { prev: [0; 4], prev_time: Instant::now() }
    }

    pub fn snapshot(&mut self, buffers: &[Arc<TimestampBuffer>; 4]) -> SinglesSnapshot {
        let now = Instant::now();
        let elapsed = now.duration_since(self.prev_time).as_secs_f64();
        let totals = [
            buffers[0].events_total(),
            buffers[1].events_total(),
            buffers[2].events_total(),
            buffers[3].events_total(),
        ];
        let mut rates_hz = [0.0; 4];
        if elapsed > 0.0 {
            for (rate, (curr, prev)) in
                rates_hz.iter_mut().zip(totals.iter().zip(self.prev.iter()))
            {
                *rate = curr.saturating_sub(*prev) as f64 / elapsed;
            }
        }
        self.prev = totals;
        self.prev_time = now;
        SinglesSnapshot { totals, rates_hz }
    }
}

impl Default for SinglesTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling window of recent coincidence counts for one pair.
#[derive(Debug, Clone)]
pub struct PairWindow {
    samples: VecDeque<u64>,
}

impl PairWindow {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(PAIR_WINDOW) }
    }

    pub fn push(&mut self, count: u64) {
        if self.samples.len() >= PAIR_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(count);
    }

    pub fn latest(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    pub fn samples(&self) -> Vec<u64> {
        self.samples.iter().copied().collect()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }
}

impl Default for PairWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singles_totals_follow_buffers() {
        let buffers = [
            Arc::new(TimestampBuffer::new(1, 1000.0, 1000)),
            Arc::new(TimestampBuffer::new(2, 1000.0, 1000)),
            Arc::new(TimestampBuffer::new(3, 1000.0, 1000)),
            Arc::new(TimestampBuffer::new(4, 1000.0, 1000)),
        ];
        let mut tracker = SinglesTracker::new();
        buffers[0].append_array(&[1, 2, 3], None);
        buffers[2].append_array(&[5], None);
        let snap = tracker.snapshot(&buffers);
        assert_eq!(snap.totals, [3, 0, 1, 0]);

        // Second snapshot with no new events shows zero rates.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let snap = tracker.snapshot(&buffers);
        assert_eq!(snap.rates_hz, [0.0; 4]);
    }

    #[test]
    fn test_pair_window_caps_at_twenty() {
        let mut window = PairWindow::new();
        for i in 0..30u64 {
            window.push(i);
        }
        let samples = window.samples();
        assert_eq!(samples.len(), PAIR_WINDOW);
        assert_eq!(samples[0], 10);
        assert_eq!(window.latest(), Some(29));
        assert_eq!(window.mean(), Some((10..30).sum::<u64>() as f64 / 20.0));
    }

    #[test]
    fn test_pair_window_empty() {
        let window = PairWindow::new();
        assert!(window.latest().is_none());
        assert!(window.mean().is_none());
    }
}
