//! Heuristic detection of abusive traffic patterns.
//!
//! The detector looks at the request log a key already keeps for its sliding
//! window. It flags two patterns: too many requests in a short span, and
//! requests arriving at suspiciously regular intervals (typical of scripted
//! clients). The thresholds are tunable and off by default; a flagged key is
//! put in the penalty box by the engine.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::window::WindowEntry;

/// Detector thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Span inspected for request floods
    pub burst_window: Duration,
    /// Requests within `burst_window` that count as a flood
    pub burst_threshold: u64,
    /// Number of inter-arrival intervals needed before judging regularity
    pub min_samples: usize,
    /// Coefficient of variation below which intervals count as machine-regular
    pub max_interval_cv: f64,
    /// Penalty applied to a flagged key
    pub penalty: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            burst_window: Duration::from_secs(10),
            burst_threshold: 50,
            min_samples: 10,
            max_interval_cv: 0.05,
            penalty: Duration::from_secs(3600),
        }
    }
}

/// Why a key was flagged.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspicion {
    /// `count` requests landed within the burst window
    Burst { count: u64 },
    /// Inter-arrival intervals had coefficient of variation `cv`
    UniformIntervals { cv: f64 },
}

impl fmt::Display for Suspicion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspicion::Burst { count } => write!(f, "burst of {} requests", count),
            Suspicion::UniformIntervals { cv } => {
                write!(f, "uniform request intervals (cv={:.4})", cv)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuspiciousActivityDetector {
    config: DetectorConfig,
}

impl SuspiciousActivityDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Inspect a key's log as if a request were arriving at `now`.
    pub fn inspect(&self, entries: &VecDeque<WindowEntry>, now: Instant) -> Option<Suspicion> {
        self.check_burst(entries, now)
            .or_else(|| self.check_uniform_intervals(entries, now))
    }

    fn check_burst(&self, entries: &VecDeque<WindowEntry>, now: Instant) -> Option<Suspicion> {
        let cutoff = now.checked_sub(self.config.burst_window);
        let recent: u64 = entries
            .iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .map(|e| e.count)
            .sum();
        let count = recent + 1;
        (count >= self.config.burst_threshold).then_some(Suspicion::Burst { count })
    }

    fn check_uniform_intervals(
        &self,
        entries: &VecDeque<WindowEntry>,
        now: Instant,
    ) -> Option<Suspicion> {
        let samples = self.config.min_samples;
        if samples < 2 || entries.len() < samples {
            return None;
        }

        let mut timestamps: Vec<Instant> = entries
            .iter()
            .skip(entries.len() - samples)
            .map(|e| e.timestamp)
            .collect();
        timestamps.push(now);

        let intervals: Vec<f64> = timestamps
            .windows(2)
            .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64())
            .collect();

        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return None;
        }
        let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
        let cv = variance.sqrt() / mean;

        (cv < self.config.max_interval_cv).then_some(Suspicion::UniformIntervals { cv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(start: Instant, offsets_ms: &[u64]) -> VecDeque<WindowEntry> {
        offsets_ms
            .iter()
            .map(|ms| WindowEntry {
                timestamp: start + Duration::from_millis(*ms),
                count: 1,
            })
            .collect()
    }

    fn detector(threshold: u64, samples: usize) -> SuspiciousActivityDetector {
        SuspiciousActivityDetector::new(DetectorConfig {
            burst_threshold: threshold,
            min_samples: samples,
            ..Default::default()
        })
    }

    #[test]
    fn test_detects_burst() {
        let t0 = Instant::now();
        let entries = log(t0, &[0, 100, 250, 400]);
        let detector = detector(5, 100);

        let suspicion = detector.inspect(&entries, t0 + Duration::from_millis(500));
        assert_eq!(suspicion, Some(Suspicion::Burst { count: 5 }));
    }

    #[test]
    fn test_burst_ignores_requests_outside_span() {
        let t0 = Instant::now();
        let entries = log(t0, &[0, 100, 250, 400]);
        let detector = detector(5, 100);

        assert!(detector.inspect(&entries, t0 + Duration::from_secs(10) + Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_detects_uniform_intervals() {
        let t0 = Instant::now();
        let offsets: Vec<u64> = (0..10).map(|i| i * 2000).collect();
        let entries = log(t0, &offsets);
        let detector = detector(1000, 10);

        let suspicion = detector.inspect(&entries, t0 + Duration::from_secs(20));
        assert!(matches!(suspicion, Some(Suspicion::UniformIntervals { cv }) if cv < 1e-9));
    }

    #[test]
    fn test_irregular_intervals_pass() {
        let t0 = Instant::now();
        let entries = log(t0, &[0, 700, 3100, 3300, 9000, 9400, 15000, 15100, 21000, 26000]);
        let detector = detector(1000, 10);

        assert!(detector.inspect(&entries, t0 + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn test_needs_enough_samples() {
        let t0 = Instant::now();
        let entries = log(t0, &[0, 1000, 2000]);
        let detector = detector(1000, 10);

        assert!(detector.inspect(&entries, t0 + Duration::from_secs(3)).is_none());
    }
}
