//! Throughput Monitor.
//!
//! Tracks per-event counts and bounded histories of handler processing
//! time and per-frame time, and derives the rates the backpressure
//! controller feeds on over the tick's closed loop.

use std::collections::VecDeque;

use ahash::AHashMap;
use serde::Serialize;

/// Default bound on processing-time / frame-time history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
const RECENT_FRAME_WINDOW: usize = 60;
const RECENT_EVENTS_PER_FRAME_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct ThroughputConfig {
    pub history_capacity: usize,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Default)]
struct EventCounter {
    total: u64,
    processing_times_us: VecDeque<u64>,
}

pub struct ThroughputMonitor {
    config: ThroughputConfig,
    start_ts: f64,
    per_event: AHashMap<String, EventCounter>,
    frame_times_ms: VecDeque<f64>,
    events_per_frame_history: VecDeque<u64>,
    frame_start: Option<f64>,
    current_frame_events: u64,
    last_frame_ms: Option<f64>,
}

impl ThroughputMonitor {
    pub fn new(start_ts: f64) -> Self {
        Self::with_config(start_ts, ThroughputConfig::default())
    }

    pub fn with_config(start_ts: f64, config: ThroughputConfig) -> Self {
        Self {
            config,
            start_ts,
            per_event: AHashMap::default(),
            frame_times_ms: VecDeque::new(),
            events_per_frame_history: VecDeque::new(),
            frame_start: None,
            current_frame_events: 0,
            last_frame_ms: None,
        }
    }

    pub fn start_frame_monitoring(&mut self, now: f64) {
        self.frame_start = Some(now);
        self.current_frame_events = 0;
    }

    /// Ends the current frame and returns its duration in milliseconds.
    /// A no-op call (no matching `start_frame_monitoring`) returns `0.0`.
    pub fn end_frame_monitoring(&mut self, now: f64) -> f64 {
        let Some(start) = self.frame_start.take() else {
            return 0.0;
        };
        let duration_ms = (now - start) * 1000.0;

        push_bounded(&mut self.frame_times_ms, duration_ms, self.config.history_capacity);
        push_bounded(
            &mut self.events_per_frame_history,
            self.current_frame_events,
            self.config.history_capacity,
        );
        self.last_frame_ms = Some(duration_ms);
        duration_ms
    }

    pub fn record_event_processed(&mut self, name: &str) {
        let counter = self.per_event.entry(name.to_string()).or_default();
        counter.total += 1;
        self.current_frame_events += 1;
    }

    pub fn record_handler_performance(&mut self, name: &str, micros: u64) {
        let counter = self.per_event.entry(name.to_string()).or_default();
        push_bounded(&mut counter.processing_times_us, micros, self.config.history_capacity);
    }

    /// Events per second for `name` since monitoring started.
    pub fn events_per_second(&self, name: &str, now: f64) -> f64 {
        let elapsed = (now - self.start_ts).max(1e-6);
        let count = self.per_event.get(name).map(|c| c.total).unwrap_or(0);
        count as f64 / elapsed
    }

    pub fn total_events(&self, name: &str) -> u64 {
        self.per_event.get(name).map(|c| c.total).unwrap_or(0)
    }

    /// Combined events-per-second across every tracked event name.
    pub fn total_events_per_second(&self, now: f64) -> f64 {
        let elapsed = (now - self.start_ts).max(1e-6);
        let total: u64 = self.per_event.values().map(|c| c.total).sum();
        total as f64 / elapsed
    }

    /// Average of the last 60 frame times, in milliseconds.
    pub fn recent_avg_frame_time_ms(&self) -> f64 {
        average_tail(&self.frame_times_ms, RECENT_FRAME_WINDOW)
    }

    /// Average events processed per frame over the last 10 frames.
    pub fn events_per_frame(&self) -> f64 {
        average_tail_u64(&self.events_per_frame_history, RECENT_EVENTS_PER_FRAME_WINDOW)
    }

    /// `(min, avg, max)` microseconds for `name`'s processing-time history.
    pub fn processing_time_stats_us(&self, name: &str) -> Option<(u64, f64, u64)> {
        let counter = self.per_event.get(name)?;
        if counter.processing_times_us.is_empty() {
            return None;
        }
        let min = *counter.processing_times_us.iter().min().unwrap();
        let max = *counter.processing_times_us.iter().max().unwrap();
        let sum: u64 = counter.processing_times_us.iter().sum();
        let avg = sum as f64 / counter.processing_times_us.len() as f64;
        Some((min, avg, max))
    }

    pub fn is_frame_budget_exceeded(&self, budget_ms: f64) -> bool {
        self.last_frame_ms.map(|ms| ms > budget_ms).unwrap_or(false)
    }

    pub fn status(&self) -> ThroughputStatus {
        ThroughputStatus {
            tracked_event_names: self.per_event.len(),
            recent_avg_frame_time_ms: self.recent_avg_frame_time_ms(),
            events_per_frame: self.events_per_frame(),
            last_frame_ms: self.last_frame_ms,
        }
    }
}

/// Owned snapshot of the monitor; never aliases its internal storage.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputStatus {
    pub tracked_event_names: usize,
    pub recent_avg_frame_time_ms: f64,
    pub events_per_frame: f64,
    pub last_frame_ms: Option<f64>,
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, capacity: usize) {
    history.push_back(value);
    while history.len() > capacity {
        history.pop_front();
    }
}

fn average_tail(history: &VecDeque<f64>, window: usize) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let skip = history.len().saturating_sub(window);
    let tail: Vec<f64> = history.iter().skip(skip).copied().collect();
    tail.iter().sum::<f64>() / tail.len() as f64
}

// u64 history shares the same averaging shape but a different element type;
// a tiny overload avoids forcing a lossy f64 history for event counts.
fn average_tail_u64(history: &VecDeque<u64>, window: usize) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let skip = history.len().saturating_sub(window);
    let tail: Vec<u64> = history.iter().skip(skip).copied().collect();
    tail.iter().sum::<u64>() as f64 / tail.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_per_second_since_start() {
        let mut monitor = ThroughputMonitor::new(0.0);
        for _ in 0..10 {
            monitor.record_event_processed("tick");
        }
        assert_eq!(monitor.events_per_second("tick", 5.0), 2.0);
    }

    #[test]
    fn frame_bracketing_records_duration() {
        let mut monitor = ThroughputMonitor::new(0.0);
        monitor.start_frame_monitoring(0.0);
        let duration = monitor.end_frame_monitoring(0.01);
        assert!((duration - 10.0).abs() < 1e-6);
        assert!(!monitor.is_frame_budget_exceeded(20.0));
        assert!(monitor.is_frame_budget_exceeded(5.0));
    }

    #[test]
    fn processing_time_stats() {
        let mut monitor = ThroughputMonitor::new(0.0);
        monitor.record_handler_performance("x", 100);
        monitor.record_handler_performance("x", 300);
        let (min, avg, max) = monitor.processing_time_stats_us("x").unwrap();
        assert_eq!(min, 100);
        assert_eq!(max, 300);
        assert_eq!(avg, 200.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut monitor = ThroughputMonitor::with_config(
            0.0,
            ThroughputConfig { history_capacity: 3 },
        );
        for i in 0..10u64 {
            monitor.record_handler_performance("x", i);
        }
        let (min, _, max) = monitor.processing_time_stats_us("x").unwrap();
        assert_eq!(min, 7);
        assert_eq!(max, 9);
    }

    #[test]
    fn events_per_frame_window() {
        let mut monitor = ThroughputMonitor::new(0.0);
        for frame in 0..15 {
            monitor.start_frame_monitoring(frame as f64);
            for _ in 0..frame {
                monitor.record_event_processed("x");
            }
            monitor.end_frame_monitoring(frame as f64 + 0.001);
        }
        assert_eq!(average_tail_u64(&monitor.events_per_frame_history, 10), monitor.events_per_frame());
    }
}
