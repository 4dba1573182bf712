//! Backpressure Controller.
//!
//! Computes a single scalar pressure level from several utilization
//! metrics, derives an adaptive throttle factor from it, and exposes the
//! probabilistic admission/drop queries the publish path consults.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::host::Rng;

/// The metrics the controller reacts to. A host (or the throughput
/// monitor, via the bus coordinator) refreshes these every tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackpressureMetrics {
    pub queue_utilization: f64,
    pub processing_rate: f64,
    pub memory_pressure: f64,
    pub frame_budget_used: f64,
    pub events_per_second: f64,
    pub failed_events_rate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureThresholds {
    pub queue_utilization: f64,
    pub processing_rate: f64,
    pub memory_pressure: f64,
    pub frame_budget_used: f64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            queue_utilization: 0.8,
            processing_rate: 0.9,
            memory_pressure: 0.85,
            frame_budget_used: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub thresholds: BackpressureThresholds,
    pub adaptive_throttle_enabled: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            thresholds: BackpressureThresholds::default(),
            adaptive_throttle_enabled: true,
        }
    }
}

/// Event names exempt from `THROTTLE_PUBLISHERS` pressure, i.e. the ones
/// `should_defer_non_critical` matches against.
const DEFERRABLE_EVENT_NAMES: &[&str] = &[
    "debug_info_updated",
    "metrics_collected",
    "status_report",
    "performance_stats",
    "subscription_stats",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    EmergencyFlush,
    DropLowPriority,
    ThrottlePublishers,
    BatchAggressively,
    DeferNonCritical,
}

/// Capability notified when the throttle factor moves by more than 0.1 in
/// one update.
pub trait BackpressureObserver: Send + Sync {
    fn on_throttle_change(&self, old: f64, new: f64);
}

pub struct BackpressureController {
    config: BackpressureConfig,
    metrics: BackpressureMetrics,
    pressure: f64,
    throttle: f64,
    actions: HashSet<Action>,
    observers: Vec<Arc<dyn BackpressureObserver>>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            metrics: BackpressureMetrics::default(),
            pressure: 0.0,
            throttle: 1.0,
            actions: HashSet::new(),
            observers: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Arc<dyn BackpressureObserver>) {
        self.observers.push(observer);
    }

    /// Recomputes pressure, throttle and the active action set from a
    /// fresh metrics reading, firing observer notifications when the
    /// throttle moves by more than 0.1.
    pub fn update_metrics(&mut self, metrics: BackpressureMetrics) {
        self.metrics = metrics;
        let thresholds = &self.config.thresholds;

        let ratios = [
            metrics.queue_utilization / thresholds.queue_utilization,
            metrics.processing_rate / thresholds.processing_rate,
            metrics.memory_pressure / thresholds.memory_pressure,
            metrics.frame_budget_used / thresholds.frame_budget_used,
        ];
        let max_ratio = ratios.iter().cloned().fold(0.0_f64, f64::max);
        self.pressure = max_ratio.clamp(0.0, 2.0);

        let old_throttle = self.throttle;
        let new_throttle = if self.config.adaptive_throttle_enabled {
            adaptive_throttle(self.pressure)
        } else {
            1.0
        };
        self.throttle = new_throttle;

        self.actions = actions_for_pressure(self.pressure);

        if (new_throttle - old_throttle).abs() > 0.1 {
            for observer in &self.observers {
                observer.on_throttle_change(old_throttle, new_throttle);
            }
            tracing::info!(old_throttle, new_throttle, pressure = self.pressure, "throttle changed");
        }
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    /// True with probability `1 - throttle * (1 / max(priority, 1))`.
    pub fn should_throttle_publisher(&self, priority: u8, rng: &dyn Rng) -> bool {
        let divisor = (priority as f64).max(1.0);
        let probability = 1.0 - self.throttle * (1.0 / divisor);
        rng.uniform() < probability
    }

    /// True with probability `1 - throttle` when `DROP_LOW_PRIORITY` is
    /// active and `priority <= 1`.
    pub fn should_drop_event(&self, priority: u8, rng: &dyn Rng) -> bool {
        if !self.actions.contains(&Action::DropLowPriority) || priority > 1 {
            return false;
        }
        rng.uniform() < 1.0 - self.throttle
    }

    pub fn should_batch_aggressively(&self) -> bool {
        self.actions.contains(&Action::BatchAggressively)
    }

    pub fn needs_emergency_flush(&self) -> bool {
        self.actions.contains(&Action::EmergencyFlush)
    }

    pub fn should_defer_non_critical(&self, event_name: &str) -> bool {
        self.actions.contains(&Action::DeferNonCritical) && DEFERRABLE_EVENT_NAMES.contains(&event_name)
    }

    pub fn status(&self) -> BackpressureStatus {
        let mut actions: Vec<Action> = self.actions.iter().copied().collect();
        actions.sort_by_key(|a| format!("{a:?}"));
        BackpressureStatus {
            pressure: self.pressure,
            throttle: self.throttle,
            actions,
            metrics: self.metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStatus {
    pub pressure: f64,
    pub throttle: f64,
    pub actions: Vec<Action>,
    pub metrics: BackpressureMetrics,
}

fn adaptive_throttle(pressure: f64) -> f64 {
    if pressure <= 0.5 {
        1.0
    } else if pressure <= 1.0 {
        1.0 - (pressure - 0.5)
    } else {
        (0.5 - (pressure - 1.0) * 0.4).max(0.1)
    }
}

fn actions_for_pressure(pressure: f64) -> HashSet<Action> {
    let mut actions = HashSet::new();
    if pressure > 0.9 {
        actions.insert(Action::EmergencyFlush);
        actions.insert(Action::DropLowPriority);
    }
    if pressure > 0.8 {
        actions.insert(Action::ThrottlePublishers);
        actions.insert(Action::BatchAggressively);
    }
    if pressure > 0.6 {
        actions.insert(Action::DeferNonCritical);
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedSequenceRng;

    #[test]
    fn pressure_and_throttle_boundaries() {
        assert_eq!(adaptive_throttle(0.5), 1.0);
        assert_eq!(adaptive_throttle(1.0), 0.5);
        assert!((adaptive_throttle(1.5) - 0.3).abs() < 1e-9);
        assert_eq!(adaptive_throttle(2.0), 0.1);
    }

    #[test]
    fn escalation_scenario() {
        let mut controller = BackpressureController::new(BackpressureConfig::default());

        controller.update_metrics(BackpressureMetrics {
            queue_utilization: 0.72,
            ..Default::default()
        });
        assert!((controller.pressure() - 0.9).abs() < 1e-9);
        assert!((controller.throttle() - 0.6).abs() < 1e-9);
        assert!(controller.should_batch_aggressively());
        assert!(!controller.needs_emergency_flush());

        controller.update_metrics(BackpressureMetrics {
            queue_utilization: 0.9,
            ..Default::default()
        });
        assert!((controller.pressure() - 1.125).abs() < 1e-9);
        assert!((controller.throttle() - 0.45).abs() < 1e-9);
        assert!(controller.needs_emergency_flush());
        assert!(controller.should_drop_event(1, &FixedSequenceRng::constant(0.0)));
    }

    #[test]
    fn defer_non_critical_matches_fixed_set() {
        let mut controller = BackpressureController::new(BackpressureConfig::default());
        controller.update_metrics(BackpressureMetrics {
            queue_utilization: 0.8 * 0.65,
            ..Default::default()
        });
        assert!(controller.should_defer_non_critical("metrics_collected"));
        assert!(!controller.should_defer_non_critical("process_started"));
    }

    #[test]
    fn observer_fires_on_large_change() {
        struct Recorder(std::sync::Mutex<Vec<(f64, f64)>>);
        impl BackpressureObserver for Recorder {
            fn on_throttle_change(&self, old: f64, new: f64) {
                self.0.lock().unwrap().push((old, new));
            }
        }

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let mut controller = BackpressureController::new(BackpressureConfig::default());
        controller.register_observer(recorder.clone());

        controller.update_metrics(BackpressureMetrics {
            queue_utilization: 0.9,
            ..Default::default()
        });

        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
