//! Planner feed estimation.
//!
//! The printer's motion planner starves when the host confirms-and-sends
//! too slowly. This module keeps a bounded window of per-instruction
//! confirmation latencies and computes a rolling percentile over it with a
//! pair of heaps: the lower heap holds the smallest `ceil(n * ratio)` live
//! samples, so its maximum is the percentile. Evicted samples are removed
//! lazily when they surface at a heap top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use printer_protocol::{
    FEED_DEFAULT_THRESHOLD, FEED_HEAP_RATIO, FEED_IGNORE_ABOVE, FEED_QUEUE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Low,
    High,
}

/// Rolling confirmation-latency percentile estimator.
pub struct PlannerFeed {
    window: VecDeque<(u64, Duration)>,
    low: BinaryHeap<(Duration, u64)>,
    high: BinaryHeap<Reverse<(Duration, u64)>>,
    side: HashMap<u64, Side>,
    live_low: usize,
    live_high: usize,
    next_id: u64,
    last_latency: Option<Duration>,
}

impl PlannerFeed {
    pub fn new() -> Self {
        Self {
            window: VecDeque::new(),
            low: BinaryHeap::new(),
            high: BinaryHeap::new(),
            side: HashMap::new(),
            live_low: 0,
            live_high: 0,
            next_id: 0,
            last_latency: None,
        }
    }

    /// Records one confirmation latency.
    ///
    /// Samples above the ignore bound are interesting for stall detection
    /// but not for feed estimation, so they only update the last-latency
    /// marker.
    pub fn add_sample(&mut self, latency: Duration) {
        self.last_latency = Some(latency);
        if latency > FEED_IGNORE_ABOVE {
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.window.push_back((id, latency));

        // Place the new sample on whichever side of the split it belongs.
        let low_top = self.clean_low_top();
        if low_top.map_or(true, |top| latency <= top) {
            self.low.push((latency, id));
            self.side.insert(id, Side::Low);
            self.live_low += 1;
        } else {
            self.high.push(Reverse((latency, id)));
            self.side.insert(id, Side::High);
            self.live_high += 1;
        }

        while self.window.len() > FEED_QUEUE_SIZE {
            if let Some((old_id, _)) = self.window.pop_front() {
                match self.side.remove(&old_id) {
                    Some(Side::Low) => self.live_low -= 1,
                    Some(Side::High) => self.live_high -= 1,
                    None => {}
                }
            }
        }

        self.rebalance();
    }

    /// The rolling percentile, when at least one sample is live.
    pub fn percentile(&mut self) -> Option<Duration> {
        if self.live_low + self.live_high == 0 {
            return None;
        }
        self.rebalance();
        self.clean_low_top()
    }

    /// The threshold a recent confirmation has to beat.
    pub fn threshold(&mut self) -> Duration {
        self.percentile().unwrap_or(FEED_DEFAULT_THRESHOLD)
    }

    /// Whether the most recent confirmation latency indicates the planner
    /// buffer is being fed fast enough. Answers false before any sample.
    pub fn is_fed(&mut self) -> bool {
        let Some(last) = self.last_latency else {
            return false;
        };
        last < self.threshold() || last < FEED_DEFAULT_THRESHOLD
    }

    fn target_low(&self) -> usize {
        let total = self.live_low + self.live_high;
        if total == 0 {
            return 0;
        }
        let target = (total as f64 * FEED_HEAP_RATIO).ceil() as usize;
        target.clamp(1, total)
    }

    fn rebalance(&mut self) {
        let target = self.target_low();
        while self.live_low > target {
            if self.clean_low_top().is_none() {
                break;
            }
            // The cleaned top is live, so pop moves exactly that sample.
            let Some((latency, id)) = self.low.pop() else { break };
            self.high.push(Reverse((latency, id)));
            self.side.insert(id, Side::High);
            self.live_low -= 1;
            self.live_high += 1;
        }
        while self.live_low < target {
            if self.clean_high_top().is_none() {
                break;
            }
            let Some(Reverse((latency, id))) = self.high.pop() else { break };
            self.low.push((latency, id));
            self.side.insert(id, Side::Low);
            self.live_high -= 1;
            self.live_low += 1;
        }
    }

    /// Discards evicted samples sitting on the low heap top and returns
    /// the live maximum of the lower side.
    fn clean_low_top(&mut self) -> Option<Duration> {
        while let Some((latency, id)) = self.low.peek().copied() {
            if self.side.get(&id) == Some(&Side::Low) {
                return Some(latency);
            }
            self.low.pop();
        }
        None
    }

    fn clean_high_top(&mut self) -> Option<Duration> {
        while let Some(Reverse((latency, id))) = self.high.peek().copied() {
            if self.side.get(&id) == Some(&Side::High) {
                return Some(latency);
            }
            self.high.pop();
        }
        None
    }
}

impl Default for PlannerFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    #[test]
    fn test_percentile_matches_sorted_indexing() {
        let mut feed = PlannerFeed::new();
        let samples: Vec<Duration> = (1..=200).map(Duration::from_millis).collect();
        for sample in &samples {
            feed.add_sample(*sample);
        }

        let mut sorted = samples.clone();
        sorted.sort();
        let expected = sorted[(200.0_f64 * FEED_HEAP_RATIO).ceil() as usize - 1];

        let got = feed.percentile().unwrap();
        let delta = if got > expected { got - expected } else { expected - got };
        assert!(
            delta <= Duration::from_millis(1),
            "percentile {got:?} too far from {expected:?}"
        );
    }

    #[test]
    fn test_slow_samples_are_ignored() {
        let mut feed = PlannerFeed::new();
        for sample in millis(&[50, 60, 70]) {
            feed.add_sample(sample);
        }
        feed.add_sample(Duration::from_secs(5));
        assert!(feed.percentile().unwrap() <= Duration::from_millis(70));
    }

    #[test]
    fn test_default_threshold_before_samples() {
        let mut feed = PlannerFeed::new();
        assert_eq!(feed.threshold(), FEED_DEFAULT_THRESHOLD);
        assert!(!feed.is_fed(), "no confirmations yet means not fed");
    }

    #[test]
    fn test_is_fed_uses_last_latency() {
        let mut feed = PlannerFeed::new();
        for sample in millis(&[100, 100, 100, 100, 20]) {
            feed.add_sample(sample);
        }
        assert!(feed.is_fed());

        feed.add_sample(Duration::from_millis(900));
        assert!(!feed.is_fed());
    }

    #[test]
    fn test_window_eviction_keeps_percentile_recent() {
        let mut feed = PlannerFeed::new();
        // Fill the window with slow-ish samples, then overwrite it fully
        // with fast ones; the percentile must follow the live window.
        for _ in 0..FEED_QUEUE_SIZE {
            feed.add_sample(Duration::from_millis(500));
        }
        for _ in 0..FEED_QUEUE_SIZE {
            feed.add_sample(Duration::from_millis(10));
        }
        assert_eq!(feed.percentile().unwrap(), Duration::from_millis(10));
    }
}
