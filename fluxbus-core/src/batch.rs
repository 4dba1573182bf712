//! Batch Processor.
//!
//! Groups events into phase/integration buckets and flushes them either
//! inline or, for large batches under `high_throughput_mode`, as a
//! cooperative task that yields back to the host tick every
//! `yield_threshold` events.

use std::collections::VecDeque;

use ahash::AHashMap;
use fluxbus_event::Event;
use serde::Serialize;

use crate::host::{Clock, Dispatcher};
use crate::throughput::ThroughputMonitor;

/// Default integration bucket names, configurable via
/// `BatchConfig::integration_buckets`, but any bucket key works.
pub const DEFAULT_INTEGRATION_BUCKETS: &[&str] = &[
    "schema_updates",
    "config_adjustments",
    "template_updates",
    "resource_optimizations",
];

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout: f64,
    pub high_throughput_mode: bool,
    pub yield_threshold: usize,
    pub frame_budget_ms: f64,
    pub max_events_per_frame: usize,
    /// Whether the host exposes a scheduling hook the cooperative task can
    /// yield into. Without one, even a huge batch is dispatched inline.
    pub cooperative_scheduling_available: bool,
    pub integration_buckets: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_timeout: 0.1,
            high_throughput_mode: false,
            yield_threshold: 100,
            frame_budget_ms: 8.0,
            max_events_per_frame: 20,
            cooperative_scheduling_available: false,
            integration_buckets: DEFAULT_INTEGRATION_BUCKETS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    events: Vec<Event>,
    last_flush_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCompletion {
    pub label: String,
    pub count: usize,
    pub duration_s: f64,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub phase_buckets: usize,
    pub integration_buckets: usize,
    pub phase_events_buffered: usize,
    pub integration_events_buffered: usize,
    pub pending_cooperative_tasks: usize,
}

struct CooperativeTask {
    label: String,
    events: VecDeque<Event>,
    started_at: f64,
    succeeded: usize,
    failed: usize,
}

pub struct BatchProcessor {
    config: BatchConfig,
    phase_buckets: AHashMap<String, Bucket>,
    integration_buckets: AHashMap<String, Bucket>,
    pending_tasks: VecDeque<CooperativeTask>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        let integration_buckets = config
            .integration_buckets
            .iter()
            .map(|name| (name.clone(), Bucket::default()))
            .collect();
        Self {
            config,
            phase_buckets: AHashMap::default(),
            integration_buckets,
            pending_tasks: VecDeque::new(),
        }
    }

    pub fn submit_phase_event(
        &mut self,
        phase: &str,
        event: Event,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Option<BatchCompletion> {
        self.submit(BucketFamily::Phase, phase, event, now, clock, dispatcher, monitor)
    }

    pub fn submit_integration_event(
        &mut self,
        bucket: &str,
        event: Event,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Option<BatchCompletion> {
        self.submit(BucketFamily::Integration, bucket, event, now, clock, dispatcher, monitor)
    }

    fn submit(
        &mut self,
        family: BucketFamily,
        key: &str,
        event: Event,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Option<BatchCompletion> {
        let map = self.map_for(family);
        let bucket = map.entry(key.to_string()).or_insert_with(|| Bucket {
            events: Vec::new(),
            last_flush_ts: now,
        });
        bucket.events.push(event);

        let due = bucket.events.len() >= self.config.max_batch_size
            || now - bucket.last_flush_ts >= self.config.batch_timeout;
        if !due {
            return None;
        }

        self.flush_one(family, key, now, clock, dispatcher, monitor)
    }

    fn map_for(&mut self, family: BucketFamily) -> &mut AHashMap<String, Bucket> {
        match family {
            BucketFamily::Phase => &mut self.phase_buckets,
            BucketFamily::Integration => &mut self.integration_buckets,
        }
    }

    /// Flushes a single due bucket, either inline or (if the batch is large,
    /// `high_throughput_mode` is on, and a scheduling hook is available) by
    /// handing it to the cooperative task queue for `step` to drain.
    fn flush_one(
        &mut self,
        family: BucketFamily,
        key: &str,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Option<BatchCompletion> {
        let label = format!("{}:{key}", family.label());
        let events = {
            let map = self.map_for(family);
            let bucket = map.get_mut(key)?;
            bucket.last_flush_ts = now;
            std::mem::take(&mut bucket.events)
        };
        if events.is_empty() {
            return None;
        }

        if self.config.high_throughput_mode
            && self.config.cooperative_scheduling_available
            && events.len() > self.config.yield_threshold
        {
            self.pending_tasks.push_back(CooperativeTask {
                label,
                events: events.into(),
                started_at: now,
                succeeded: 0,
                failed: 0,
            });
            return None;
        }

        Some(dispatch_batch(label, events, clock, dispatcher, monitor))
    }

    /// Flushes every bucket unconditionally, inline (ignores
    /// `high_throughput_mode`/cooperative scheduling; this is an explicit
    /// drain, not a tick-driven flush).
    pub fn force_process_all_batches(
        &mut self,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Vec<BatchCompletion> {
        let mut completions = Vec::new();
        for family in [BucketFamily::Phase, BucketFamily::Integration] {
            let keys: Vec<String> = self.map_for(family).keys().cloned().collect();
            for key in keys {
                let label = format!("{}:{key}", family.label());
                let events = {
                    let map = self.map_for(family);
                    let bucket = map.get_mut(&key).unwrap();
                    bucket.last_flush_ts = now;
                    std::mem::take(&mut bucket.events)
                };
                if !events.is_empty() {
                    completions.push(dispatch_batch(label, events, clock, dispatcher, monitor));
                }
            }
        }
        completions
    }

    /// Sweeps every bucket for a timeout-elapsed flush, gated by
    /// `frame_budget_ms` / `max_events_per_frame`, called from the host
    /// tick. Buckets that would exceed the frame budget are left due for
    /// the next sweep rather than partially drained.
    pub fn sweep(
        &mut self,
        now: f64,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Vec<BatchCompletion> {
        let sweep_start = clock.now_seconds();
        let mut completions = Vec::new();
        let mut dispatched_this_frame = 0usize;

        for family in [BucketFamily::Phase, BucketFamily::Integration] {
            let mut due_keys: Vec<String> = self
                .map_for(family)
                .iter()
                .filter(|(_, b)| !b.events.is_empty() && now - b.last_flush_ts >= self.config.batch_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            due_keys.sort();

            for key in due_keys {
                let elapsed_ms = (clock.now_seconds() - sweep_start) * 1000.0;
                if elapsed_ms >= self.config.frame_budget_ms {
                    break;
                }
                let bucket_len = self.map_for(family).get(&key).map(|b| b.events.len()).unwrap_or(0);
                if dispatched_this_frame + bucket_len > self.config.max_events_per_frame {
                    break;
                }

                if let Some(completion) = self.flush_one(family, &key, now, clock, dispatcher, monitor) {
                    dispatched_this_frame += completion.count;
                    completions.push(completion);
                }
            }
        }
        completions
    }

    pub fn has_pending_cooperative_work(&self) -> bool {
        !self.pending_tasks.is_empty()
    }

    pub fn yield_threshold(&self) -> usize {
        self.config.yield_threshold
    }

    pub fn frame_budget_ms(&self) -> f64 {
        self.config.frame_budget_ms
    }

    pub fn max_events_per_frame(&self) -> usize {
        self.config.max_events_per_frame
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            phase_buckets: self.phase_buckets.len(),
            integration_buckets: self.integration_buckets.len(),
            phase_events_buffered: self.phase_buckets.values().map(|b| b.events.len()).sum(),
            integration_events_buffered: self.integration_buckets.values().map(|b| b.events.len()).sum(),
            pending_cooperative_tasks: self.pending_tasks.len(),
        }
    }

    /// Advances the cooperative task queue by up to `budget` events,
    /// yielding back (returning) once the budget is spent or the queue is
    /// drained. May complete more than one small task in a single call.
    pub fn step(
        &mut self,
        mut budget: usize,
        clock: &dyn Clock,
        dispatcher: &dyn Dispatcher,
        monitor: &mut ThroughputMonitor,
    ) -> Vec<BatchCompletion> {
        let mut completions = Vec::new();
        while budget > 0 {
            let Some(mut task) = self.pending_tasks.pop_front() else {
                break;
            };
            let take = budget.min(task.events.len());
            for _ in 0..take {
                let event = task.events.pop_front().expect("take <= len");
                if dispatcher.dispatch_single(&event) {
                    task.succeeded += 1;
                } else {
                    task.failed += 1;
                }
                monitor.record_event_processed(&event.name);
            }
            budget -= take;

            if task.events.is_empty() {
                completions.push(BatchCompletion {
                    label: task.label,
                    count: task.succeeded + task.failed,
                    duration_s: clock.now_seconds() - task.started_at,
                    succeeded: task.succeeded,
                    failed: task.failed,
                });
            } else {
                self.pending_tasks.push_front(task);
                break;
            }
        }
        completions
    }
}

#[derive(Debug, Clone, Copy)]
enum BucketFamily {
    Phase,
    Integration,
}

impl BucketFamily {
    fn label(self) -> &'static str {
        match self {
            BucketFamily::Phase => "phase",
            BucketFamily::Integration => "integration",
        }
    }
}

fn dispatch_batch(
    label: String,
    events: Vec<Event>,
    clock: &dyn Clock,
    dispatcher: &dyn Dispatcher,
    monitor: &mut ThroughputMonitor,
) -> BatchCompletion {
    let start = clock.now_seconds();
    let mut succeeded = 0;
    let mut failed = 0;
    let count = events.len();
    for event in &events {
        if dispatcher.dispatch_single(event) {
            succeeded += 1;
        } else {
            failed += 1;
        }
        monitor.record_event_processed(&event.name);
    }
    let duration_s = clock.now_seconds() - start;
    tracing::debug!(label = %label, count, succeeded, failed, duration_s, "batch flushed");
    BatchCompletion {
        label,
        count,
        duration_s,
        succeeded,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockClock;
    use fluxbus_event::Payload;

    struct AlwaysSucceed;
    impl Dispatcher for AlwaysSucceed {
        fn dispatch_single(&self, _event: &Event) -> bool {
            true
        }
    }

    fn event(name: &str, ts: f64) -> Event {
        Event::new(name, Payload::default(), 0, ts)
    }

    #[test]
    fn flushes_on_size() {
        let mut processor = BatchProcessor::new(BatchConfig {
            max_batch_size: 3,
            ..Default::default()
        });
        let clock = MockClock::at(0.0);
        let dispatcher = AlwaysSucceed;
        let mut monitor = ThroughputMonitor::new(0.0);

        assert!(processor.submit_phase_event("init", event("a", 0.0), 0.0, &clock, &dispatcher, &mut monitor).is_none());
        assert!(processor.submit_phase_event("init", event("b", 0.0), 0.0, &clock, &dispatcher, &mut monitor).is_none());
        let completion = processor
            .submit_phase_event("init", event("c", 0.0), 0.0, &clock, &dispatcher, &mut monitor)
            .unwrap();
        assert_eq!(completion.count, 3);
        assert_eq!(completion.succeeded, 3);
    }

    #[test]
    fn flushes_on_timeout() {
        let mut processor = BatchProcessor::new(BatchConfig::default());
        let clock = MockClock::at(0.0);
        let dispatcher = AlwaysSucceed;
        let mut monitor = ThroughputMonitor::new(0.0);

        processor.submit_phase_event("init", event("a", 0.0), 0.0, &clock, &dispatcher, &mut monitor);
        let completions = processor.sweep(0.2, &clock, &dispatcher, &mut monitor);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].count, 1);
    }

    #[test]
    fn force_process_drains_everything() {
        let mut processor = BatchProcessor::new(BatchConfig::default());
        let clock = MockClock::at(0.0);
        let dispatcher = AlwaysSucceed;
        let mut monitor = ThroughputMonitor::new(0.0);

        processor.submit_phase_event("init", event("a", 0.0), 0.0, &clock, &dispatcher, &mut monitor);
        processor.submit_integration_event("schema_updates", event("b", 0.0), 0.0, &clock, &dispatcher, &mut monitor);

        let completions = processor.force_process_all_batches(0.0, &clock, &dispatcher, &mut monitor);
        assert_eq!(completions.len(), 2);
    }

    #[test]
    fn large_batch_becomes_cooperative_under_high_throughput() {
        let mut processor = BatchProcessor::new(BatchConfig {
            max_batch_size: 5,
            yield_threshold: 2,
            high_throughput_mode: true,
            cooperative_scheduling_available: true,
            ..Default::default()
        });
        let clock = MockClock::at(0.0);
        let dispatcher = AlwaysSucceed;
        let mut monitor = ThroughputMonitor::new(0.0);

        for i in 0..5 {
            processor.submit_phase_event("big", event(&format!("e{i}"), 0.0), 0.0, &clock, &dispatcher, &mut monitor);
        }
        assert!(processor.has_pending_cooperative_work());

        let step1 = processor.step(2, &clock, &dispatcher, &mut monitor);
        assert!(step1.is_empty());
        assert!(processor.has_pending_cooperative_work());

        let step2 = processor.step(10, &clock, &dispatcher, &mut monitor);
        assert_eq!(step2.len(), 1);
        assert_eq!(step2[0].count, 5);
        assert!(!processor.has_pending_cooperative_work());
    }
}
