//! Bounded time-indexed signal history.
//!
//! One `SignalWindow` per signal per location keeps the sliding window the
//! preprocessor and rule engine compute over. Capacity is bounded so a
//! misbehaving sensor cannot grow memory; eviction is oldest-first.

use std::collections::VecDeque;

/// Aggregate statistics over a time window of a signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Bounded ring of (timestamp ms, value) points, oldest first.
///
/// Capacity must cover the longest rule window (300 s) plus margin at the
/// expected sample cadence; the default engine capacity is 600 points.
#[derive(Debug, Clone)]
pub struct SignalWindow {
    points: VecDeque<(u64, f64)>,
    capacity: usize,
}

impl SignalWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a point, evicting the oldest when at capacity.
    pub fn push(&mut self, timestamp_ms: u64, value: f64) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((timestamp_ms, value));
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The most recent point, if any.
    pub fn latest(&self) -> Option<(u64, f64)> {
        self.points.back().copied()
    }

    /// Values at or after `cutoff_ms`, oldest first.
    pub fn values_since(&self, cutoff_ms: u64) -> impl Iterator<Item = f64> + '_ {
        self.points
            .iter()
            .filter(move |(ts, _)| *ts >= cutoff_ms)
            .map(|(_, v)| *v)
    }

    /// Window statistics for points at or after `cutoff_ms`.
    ///
    /// Returns None on an empty window. The standard deviation is the
    /// population σ, matching the spike z-score definition.
    pub fn stats_since(&self, cutoff_ms: u64) -> Option<WindowStats> {
        let mut count = 0_usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for v in self.values_since(cutoff_ms) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return None;
        }

        let mean = sum / count as f64;
        let var = self
            .values_since(cutoff_ms)
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        Some(WindowStats {
            count,
            mean,
            std_dev: var.sqrt(),
            min,
            max,
        })
    }

    /// Peak value at or after `cutoff_ms`, with the number of points seen.
    pub fn peak_since(&self, cutoff_ms: u64) -> Option<(f64, usize)> {
        let mut count = 0_usize;
        let mut peak = f64::NEG_INFINITY;
        for v in self.values_since(cutoff_ms) {
            count += 1;
            peak = peak.max(v);
        }
        (count > 0).then_some((peak, count))
    }

    /// Drop points strictly older than `cutoff_ms`.
    pub fn evict_before(&mut self, cutoff_ms: u64) {
        while let Some((ts, _)) = self.points.front() {
            if *ts < cutoff_ms {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(points: &[(u64, f64)]) -> SignalWindow {
        let mut w = SignalWindow::new(64);
        for (ts, v) in points {
            w.push(*ts, *v);
        }
        w
    }

    #[test]
    fn test_capacity_eviction() {
        let mut w = SignalWindow::new(3);
        for i in 0..5_u64 {
            w.push(i * 1000, i as f64);
        }
        assert_eq!(w.len(), 3);
        // Oldest two evicted
        let values: Vec<f64> = w.values_since(0).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_stats_population_sigma() {
        let w = window_with(&[(0, 2.0), (1000, 4.0), (2000, 4.0), (3000, 4.0), (4000, 5.0), (5000, 5.0), (6000, 7.0), (7000, 9.0)]);
        let stats = w.stats_since(0).unwrap();
        assert_eq!(stats.count, 8);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // Known population σ of this classic set is exactly 2.
        assert!((stats.std_dev - 2.0).abs() < 1e-12);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn test_stats_respect_cutoff() {
        let w = window_with(&[(0, 100.0), (10_000, 1.0), (11_000, 3.0)]);
        let stats = w.stats_since(10_000).unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_window_has_no_stats() {
        let w = SignalWindow::new(8);
        assert!(w.stats_since(0).is_none());
        assert!(w.peak_since(0).is_none());
        assert!(w.latest().is_none());
    }

    #[test]
    fn test_peak_and_evict() {
        let mut w = window_with(&[(0, 50.0), (30_000, 48.0), (60_000, 40.0)]);
        assert_eq!(w.peak_since(0), Some((50.0, 3)));
        w.evict_before(30_000);
        assert_eq!(w.len(), 2);
        assert_eq!(w.peak_since(0), Some((48.0, 2)));
    }
}
