//! Operation counters and timings.
//!
//! Telemetry is append-only between resets and only ever handed out as an
//! owned [`TelemetrySnapshot`]. It feeds two decisions besides reporting:
//! adaptive method ordering and recovery success estimates.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::DetectionMethod;
use crate::error::ErrorCategory;
use crate::recovery::RecoveryStrategy;

/// Samples a method needs before adaptive ordering trusts its success rate.
pub const MIN_ADAPTIVE_SAMPLES: u64 = 5;

/// Success estimate for a strategy that has never run.
pub const PRIOR_SUCCESS_RATE: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    pub total: u64,
    pub successes: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub average_time: Duration,
}

impl MethodStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    fn record(&mut self, success: bool, elapsed: Duration) {
        self.total += 1;
        if success {
            self.successes += 1;
        }
        self.average_time = running_average(self.average_time, elapsed, self.total);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub average_time: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl PerformanceStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub performance: PerformanceStats,
    pub methods: BTreeMap<DetectionMethod, MethodStats>,
    pub errors: BTreeMap<ErrorCategory, u64>,
    pub recovery: BTreeMap<RecoveryStrategy, RecoveryStats>,
}

impl TelemetrySnapshot {
    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Observed success rate of a recovery strategy, or the prior.
    pub fn estimated_success_rate(&self, strategy: RecoveryStrategy) -> f64 {
        match self.recovery.get(&strategy) {
            Some(stats) if stats.attempts > 0 => stats.successes as f64 / stats.attempts as f64,
            _ => PRIOR_SUCCESS_RATE,
        }
    }

    /// Reorder `configured` by observed success.
    ///
    /// Only applies once every detection method in the list has at least
    /// [`MIN_ADAPTIVE_SAMPLES`] samples; otherwise the configured order is
    /// kept. Coordinates always go last.
    pub fn adaptive_method_order(&self, configured: &[DetectionMethod]) -> Vec<DetectionMethod> {
        let mut detection: Vec<DetectionMethod> = configured
            .iter()
            .copied()
            .filter(|m| *m != DetectionMethod::Coordinates)
            .collect();

        let enough = detection.iter().all(|m| {
            self.methods
                .get(m)
                .is_some_and(|s| s.total >= MIN_ADAPTIVE_SAMPLES)
        });
        if enough {
            let rate = |m: &DetectionMethod| {
                self.methods.get(m).map_or(0.0, MethodStats::success_rate)
            };
            detection.sort_by(|a, b| rate(b).total_cmp(&rate(a)));
        }

        if configured.contains(&DetectionMethod::Coordinates) {
            detection.push(DetectionMethod::Coordinates);
        }
        detection
    }
}

fn running_average(average: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let avg = average.as_secs_f64();
    let next = avg + (sample.as_secs_f64() - avg) / count as f64;
    Duration::from_secs_f64(next.max(0.0))
}

/// Thread-safe telemetry store.
///
/// Readers (monitoring, adaptive ordering) take the read lock; recorders
/// take the write lock briefly.
#[derive(Debug, Default)]
pub struct TelemetryTracker {
    data: RwLock<TelemetrySnapshot>,
}

impl TelemetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<F: FnOnce(&mut TelemetrySnapshot)>(&self, f: F) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut data);
    }

    pub fn record_detection(&self, method: DetectionMethod, success: bool, elapsed: Duration) {
        self.write(|d| d.methods.entry(method).or_default().record(success, elapsed));
    }

    pub fn record_operation(&self, success: bool, elapsed: Duration) {
        self.write(|d| {
            let p = &mut d.performance;
            p.total_operations += 1;
            if success {
                p.successful_operations += 1;
            }
            p.average_time = running_average(p.average_time, elapsed, p.total_operations);
        });
    }

    pub fn record_cache_hit(&self) {
        self.write(|d| d.performance.cache_hits += 1);
    }

    pub fn record_cache_miss(&self) {
        self.write(|d| d.performance.cache_misses += 1);
    }

    pub fn record_error(&self, category: ErrorCategory) {
        self.write(|d| *d.errors.entry(category).or_default() += 1);
    }

    pub fn record_recovery(&self, strategy: RecoveryStrategy, success: bool) {
        self.write(|d| {
            let stats = d.recovery.entry(strategy).or_default();
            stats.attempts += 1;
            if success {
                stats.successes += 1;
            }
        });
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        self.write(|d| *d = TelemetrySnapshot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_ORDER: [DetectionMethod; 3] = [
        DetectionMethod::Text,
        DetectionMethod::Template,
        DetectionMethod::Coordinates,
    ];

    #[test]
    fn running_averages() {
        let t = TelemetryTracker::new();
        t.record_detection(DetectionMethod::Text, true, Duration::from_millis(100));
        t.record_detection(DetectionMethod::Text, false, Duration::from_millis(300));
        let stats = t.snapshot().methods[&DetectionMethod::Text].clone();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successes, 1);
        assert!((stats.average_time.as_secs_f64() - 0.2).abs() < 1e-9);
        assert!((stats.success_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn cache_hit_rate() {
        let t = TelemetryTracker::new();
        t.record_cache_hit();
        t.record_cache_miss();
        t.record_cache_miss();
        t.record_cache_miss();
        assert!((t.snapshot().performance.cache_hit_rate() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn adaptive_order_needs_enough_samples() {
        let t = TelemetryTracker::new();
        for _ in 0..4 {
            t.record_detection(DetectionMethod::Text, false, Duration::ZERO);
            t.record_detection(DetectionMethod::Template, true, Duration::ZERO);
        }
        assert_eq!(t.snapshot().adaptive_method_order(&DEFAULT_ORDER), DEFAULT_ORDER);

        t.record_detection(DetectionMethod::Text, false, Duration::ZERO);
        t.record_detection(DetectionMethod::Template, true, Duration::ZERO);
        assert_eq!(
            t.snapshot().adaptive_method_order(&DEFAULT_ORDER),
            vec![
                DetectionMethod::Template,
                DetectionMethod::Text,
                DetectionMethod::Coordinates
            ]
        );
    }

    #[test]
    fn coordinates_always_last() {
        let snapshot = TelemetrySnapshot::default();
        let order = snapshot.adaptive_method_order(&[
            DetectionMethod::Coordinates,
            DetectionMethod::Template,
        ]);
        assert_eq!(
            order,
            vec![DetectionMethod::Template, DetectionMethod::Coordinates]
        );
    }

    #[test]
    fn recovery_estimates_use_prior_then_history() {
        let t = TelemetryTracker::new();
        assert_eq!(
            t.snapshot().estimated_success_rate(RecoveryStrategy::SwitchMethod),
            PRIOR_SUCCESS_RATE
        );
        t.record_recovery(RecoveryStrategy::SwitchMethod, true);
        t.record_recovery(RecoveryStrategy::SwitchMethod, true);
        t.record_recovery(RecoveryStrategy::SwitchMethod, false);
        t.record_recovery(RecoveryStrategy::SwitchMethod, true);
        assert_eq!(
            t.snapshot().estimated_success_rate(RecoveryStrategy::SwitchMethod),
            0.75
        );
    }

    #[test]
    fn snapshot_serializes_with_named_keys() {
        let t = TelemetryTracker::new();
        t.record_error(ErrorCategory::Timeout);
        t.record_detection(DetectionMethod::Template, true, Duration::from_millis(5));
        let json = serde_json::to_value(t.snapshot()).unwrap();
        assert_eq!(json["errors"]["timeout"], 1);
        assert_eq!(json["methods"]["template"]["successes"], 1);
    }

    #[test]
    fn reset_clears_everything() {
        let t = TelemetryTracker::new();
        t.record_operation(true, Duration::from_secs(1));
        t.record_error(ErrorCategory::Unknown);
        t.reset();
        assert_eq!(t.snapshot(), TelemetrySnapshot::default());
    }
}
