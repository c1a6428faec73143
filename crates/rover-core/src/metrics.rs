//! Latency tracking for transports and transactions.
//!
//! Both the per-transport write timer and the end-to-end transaction timer
//! keep a [`MovingAverage`] over the most recent samples.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of samples kept by each latency window.
pub const LATENCY_WINDOW: usize = 20;

/// Fixed-capacity circular buffer producing the mean of recent samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: Vec<f64>,
    capacity: usize,
    next: usize,
}

impl MovingAverage {
    /// Create an empty window holding at most `capacity` samples.
    ///
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Record a sample, overwriting the oldest once the window is full.
    pub fn record(&mut self, value: f64) {
        if self.window.len() < self.capacity {
            self.window.push(value);
        } else {
            self.window[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Record a duration in milliseconds.
    pub fn record_duration(&mut self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Mean of the recorded samples, or `0.0` when empty.
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Drop all samples.
    pub fn reset(&mut self) {
        self.window.clear();
        self.next = 0;
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

/// Snapshot of link timing, as reported by
/// [`RobotCommunicator::comms_timing_stats`](crate::RobotCommunicator::comms_timing_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CommsTimingStats {
    /// Mean time spent in a transport write.
    pub average_write_ms: f64,
    /// Sensor push interval suited to the current link.
    pub recommended_interval_ms: u64,
    /// Mean time from sending a request to its resolution.
    pub average_transaction_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let avg = MovingAverage::new(5);
        assert_eq!(avg.average(), 0.0);
        assert!(avg.is_empty());
    }

    #[test]
    fn test_partial_window() {
        let mut avg = MovingAverage::new(5);
        avg.record(2.0);
        avg.record(4.0);
        assert_eq!(avg.len(), 2);
        assert!((avg.average() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_wraps() {
        let mut avg = MovingAverage::new(3);
        for value in [1.0, 2.0, 3.0, 10.0, 20.0] {
            avg.record(value);
        }
        assert_eq!(avg.len(), 3);
        // 3.0, 10.0, 20.0
        assert!((avg.average() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_duration_and_reset() {
        let mut avg = MovingAverage::default();
        avg.record_duration(Duration::from_millis(12));
        assert!((avg.average() - 12.0).abs() < 1e-9);
        avg.reset();
        assert!(avg.is_empty());
        assert_eq!(avg.average(), 0.0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CommsTimingStats {
            average_write_ms: 4.5,
            recommended_interval_ms: 10,
            average_transaction_ms: 9.0,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"recommended_interval_ms\":10"));
    }
}
