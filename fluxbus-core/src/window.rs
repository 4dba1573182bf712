//! Time-Window Aggregator.
//!
//! Maintains a rolling window of events per configured window id and
//! recomputes the requested aggregations whenever a new event arrives.

use std::collections::VecDeque;

use ahash::AHashMap;
use fluxbus_event::Event;
use serde::Serialize;

use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AggregationFn {
    Count,
    AvgProcessingTime,
    EventRate,
    UniqueEvents,
    PriorityDistribution,
    ErrorRate,
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub id: String,
    pub duration_s: f64,
    /// `0.0` means tumbling: the window only advances once `duration_s`
    /// has elapsed since the last slide.
    pub slide_interval_s: f64,
    pub event_filters: Vec<String>,
    pub aggregation_functions: Vec<AggregationFn>,
    pub max_events: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationResult {
    pub count: usize,
    pub avg_processing_time: Option<f64>,
    pub event_rate: Option<f64>,
    pub unique_events: Option<usize>,
    pub priority_distribution: Option<AHashMap<u8, usize>>,
    pub error_rate: Option<f64>,
}

struct WindowState {
    config: WindowConfig,
    events: VecDeque<Event>,
    last_slide: f64,
    result: AggregationResult,
}

#[derive(Default)]
pub struct TimeWindowAggregator {
    windows: AHashMap<String, WindowState>,
}

impl TimeWindowAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_time_window(&mut self, config: WindowConfig, now: f64) -> CoreResult<()> {
        if self.windows.contains_key(&config.id) {
            return Err(CoreError::already_exists(config.id));
        }
        let id = config.id.clone();
        self.windows.insert(
            id,
            WindowState {
                config,
                events: VecDeque::new(),
                last_slide: now,
                result: AggregationResult::default(),
            },
        );
        Ok(())
    }

    /// Idempotent: removing an id that doesn't exist is not an error.
    pub fn remove_time_window(&mut self, id: &str) {
        self.windows.remove(id);
    }

    /// Drops every window and reports how many were discarded.
    pub fn clear_all_windows(&mut self) -> usize {
        let count = self.windows.len();
        tracing::info!(count, "clearing all time windows");
        self.windows.clear();
        count
    }

    /// Feeds `event` to every configured window: filter, conditional
    /// slide, append and prune, then recompute.
    pub fn on_event(&mut self, event: &Event, now: f64) {
        for window in self.windows.values_mut() {
            window.ingest(event, now);
        }
    }

    pub fn get_window_aggregation(&self, id: &str) -> CoreResult<AggregationResult> {
        self.windows.get(id).map(|w| w.result.clone()).ok_or_else(|| CoreError::not_found(id))
    }

    pub fn get_events_in_window(&self, id: &str) -> CoreResult<Vec<Event>> {
        self.windows
            .get(id)
            .map(|w| w.events.iter().cloned().collect())
            .ok_or_else(|| CoreError::not_found(id))
    }

    pub fn get_all_window_summaries(&self) -> Vec<(String, AggregationResult)> {
        let mut summaries: Vec<_> = self.windows.iter().map(|(id, w)| (id.clone(), w.result.clone())).collect();
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        summaries
    }
}

impl WindowState {
    fn ingest(&mut self, event: &Event, now: f64) {
        let config = &self.config;
        if !config.event_filters.is_empty() && !config.event_filters.contains(&event.name) {
            return;
        }

        let slide_threshold = if config.slide_interval_s > 0.0 {
            config.slide_interval_s
        } else {
            config.duration_s
        };
        if now - self.last_slide >= slide_threshold {
            self.last_slide = now;
            tracing::debug!(window = %config.id, now, "window rolled");
        }

        self.events.push_back(event.clone());
        let cutoff = now - config.duration_s;
        while self.events.front().map(|e| e.timestamp < cutoff).unwrap_or(false) {
            self.events.pop_front();
        }
        while self.events.len() > config.max_events {
            self.events.pop_front();
        }

        self.result = self.recompute();
    }

    fn recompute(&self) -> AggregationResult {
        let config = &self.config;
        let mut result = AggregationResult {
            count: self.events.len(),
            ..Default::default()
        };

        for function in &config.aggregation_functions {
            match function {
                AggregationFn::Count => {}
                AggregationFn::AvgProcessingTime => {
                    let samples: Vec<f64> = self.events.iter().filter_map(|e| e.processing_time).filter(|t| *t > 0.0).collect();
                    result.avg_processing_time = if samples.is_empty() {
                        None
                    } else {
                        Some(samples.iter().sum::<f64>() / samples.len() as f64)
                    };
                }
                AggregationFn::EventRate => {
                    result.event_rate = Some(if config.duration_s > 0.0 {
                        self.events.len() as f64 / config.duration_s
                    } else {
                        0.0
                    });
                }
                AggregationFn::UniqueEvents => {
                    let unique: std::collections::HashSet<&str> = self.events.iter().map(|e| e.name.as_str()).collect();
                    result.unique_events = Some(unique.len());
                }
                AggregationFn::PriorityDistribution => {
                    let mut dist: AHashMap<u8, usize> = AHashMap::default();
                    for event in &self.events {
                        *dist.entry(event.priority).or_insert(0) += 1;
                    }
                    result.priority_distribution = Some(dist);
                }
                AggregationFn::ErrorRate => {
                    result.error_rate = Some(if self.events.is_empty() {
                        0.0
                    } else {
                        self.events.iter().filter(|e| e.error_flag).count() as f64 / self.events.len() as f64
                    });
                }
            }
        }
        result
    }
}
