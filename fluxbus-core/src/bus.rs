//! Bus Coordinator.
//!
//! Owns every subsystem plus the subscription table and is the only type a
//! host touches directly. Wires host capabilities in behind small traits;
//! until the required ones (`Clock`, `Dispatcher`) are injected, mutating
//! operations that need them are cached and drained once `is_ready()`.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use fluxbus_event::{Event, Payload, Priority};
use serde::Serialize;

use crate::backpressure::{BackpressureConfig, BackpressureController, BackpressureMetrics, BackpressureObserver, BackpressureStatus};
use crate::batch::{BatchCompletion, BatchConfig, BatchProcessor, BatchStatus};
use crate::errors::{CoreError, CoreResult};
use crate::host::{Clock, Dispatcher, Rng, ThreadRng};
use crate::queue::{DropPolicy, PersistentQueue, QueueConfig, SubscriberQueueMetrics};
use crate::replay::{ReplayConfig, ReplayStatus, ReplaySystem, ReplaySystemStatus};
use crate::router::{HealthEntry, HealthRouter, RoutingRecommendation};
use crate::throughput::{ThroughputMonitor, ThroughputStatus};
use crate::window::{AggregationResult, TimeWindowAggregator, WindowConfig};

/// Default bound for a subscription's opt-in replay buffer.
const DEFAULT_REPLAY_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: String,
    pub event_name: String,
    pub queue_size: usize,
    pub max_concurrent: usize,
    pub replay_enabled: bool,
}

enum PendingOp {
    Publish { name: String, payload: Payload, priority: Priority },
    Tick { now_wall_seconds: f64 },
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub queue: QueueConfig,
    pub backpressure: BackpressureConfig,
    pub batch: BatchConfig,
    pub replay: ReplayConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            backpressure: BackpressureConfig::default(),
            batch: BatchConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

/// Owns every subsystem in the dependency order Throughput Monitor →
/// Backpressure Controller → Persistent Queue → Health Router → Batch
/// Processor → Replay System → Time-Window Aggregator.
pub struct EventBus {
    throughput: ThroughputMonitor,
    backpressure: BackpressureController,
    queue: PersistentQueue,
    router: HealthRouter,
    batch: BatchProcessor,
    replay: ReplaySystem,
    windows: TimeWindowAggregator,

    subscriptions: AHashMap<String, Subscription>,

    clock: Option<Arc<dyn Clock>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    rng: Arc<dyn Rng>,

    pending_ops: VecDeque<PendingOp>,
    dispatched_total: u64,
    dispatch_failures: u64,
}

impl EventBus {
    pub fn new(config: EventBusConfig, start_ts: f64) -> Self {
        Self {
            throughput: ThroughputMonitor::new(start_ts),
            backpressure: BackpressureController::new(config.backpressure),
            queue: PersistentQueue::new(config.queue),
            router: HealthRouter::new(),
            batch: BatchProcessor::new(config.batch),
            replay: ReplaySystem::new(config.replay),
            windows: TimeWindowAggregator::new(),
            subscriptions: AHashMap::default(),
            clock: None,
            dispatcher: None,
            rng: Arc::new(ThreadRng),
            pending_ops: VecDeque::new(),
            dispatched_total: 0,
            dispatch_failures: 0,
        }
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = Some(clock);
        self.drain_pending_ops();
    }

    pub fn set_dispatcher(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatcher = Some(dispatcher);
        self.drain_pending_ops();
    }

    pub fn set_rng(&mut self, rng: Arc<dyn Rng>) {
        self.rng = rng;
    }

    pub fn register_backpressure_observer(&mut self, observer: Arc<dyn BackpressureObserver>) {
        self.backpressure.register_observer(observer);
    }

    pub fn is_ready(&self) -> bool {
        self.clock.is_some() && self.dispatcher.is_some()
    }

    fn drain_pending_ops(&mut self) {
        if !self.is_ready() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_ops);
        for op in pending {
            match op {
                PendingOp::Publish { name, payload, priority } => {
                    if let Err(err) = self.publish(&name, payload, priority) {
                        tracing::warn!(name, error = %err, "deferred publish failed on drain");
                    }
                }
                PendingOp::Tick { now_wall_seconds } => {
                    if let Err(err) = self.tick(now_wall_seconds) {
                        tracing::warn!(error = %err, "deferred tick failed on drain");
                    }
                }
            }
        }
    }

    // ---- subscription management ----------------------------------

    pub fn subscribe(
        &mut self,
        id: &str,
        event_name: &str,
        queue_size: usize,
        drop_policy: DropPolicy,
        max_concurrent: usize,
        replay_enabled: bool,
        now: f64,
    ) -> CoreResult<()> {
        if self.subscriptions.contains_key(id) {
            return Err(CoreError::already_exists(id));
        }
        self.queue.create_subscriber_queue(id, queue_size, drop_policy)?;
        if replay_enabled {
            self.replay.enable_replay(id, DEFAULT_REPLAY_BUFFER_SIZE, now)?;
        }
        self.subscriptions.insert(
            id.to_string(),
            Subscription {
                id: id.to_string(),
                event_name: event_name.to_string(),
                queue_size,
                max_concurrent,
                replay_enabled,
            },
        );
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: &str) -> CoreResult<()> {
        let subscription = self.subscriptions.remove(id).ok_or_else(|| CoreError::not_found(id))?;
        self.queue.remove_subscriber_queue(id)?;
        if subscription.replay_enabled {
            let _ = self.replay.disable_replay(id);
        }
        Ok(())
    }

    pub fn dequeue(&mut self, subscription_id: &str) -> CoreResult<Option<Event>> {
        let now = self.clock.as_ref().ok_or_else(|| CoreError::dependency_missing("Clock"))?.now_seconds();
        self.queue.dequeue(subscription_id, now)
    }

    // ---- publish path -----------------------------------------------

    /// Admits, fans out to subscriber queues, records to the global
    /// backlog, and feeds replay buffers and time windows.
    pub fn publish(&mut self, name: &str, payload: Payload, priority: Priority) -> CoreResult<()> {
        let (Some(clock), Some(_dispatcher)) = (self.clock.clone(), self.dispatcher.clone()) else {
            tracing::error!(name, "publish called before Clock/Dispatcher were injected");
            self.pending_ops.push_back(PendingOp::Publish {
                name: name.to_string(),
                payload,
                priority,
            });
            return Err(CoreError::dependency_missing("Clock/Dispatcher"));
        };

        let now = clock.now_seconds();
        let event = Event::builder().name(name).payload(payload).priority(priority).timestamp(now).build()?;

        if !self.backpressure.should_throttle_publisher(priority, self.rng.as_ref()) {
            tracing::warn!(name, "publish rejected by backpressure throttle");
            return Err(CoreError::rejected(name, "throttled"));
        }

        for subscription_id in self.matching_subscription_ids(name) {
            if self.backpressure.should_drop_event(priority, self.rng.as_ref()) {
                tracing::warn!(name, subscription_id, "event shed under backpressure");
                continue;
            }
            if let Err(err) = self.queue.enqueue(&subscription_id, event.clone(), now) {
                tracing::warn!(name, subscription_id, error = %err, "enqueue failed");
            }
        }

        let stamped = self.queue.add_to_global_backlog(event, now);
        self.replay.add_event_to_replay_buffers(&stamped);
        self.windows.on_event(&stamped, now);

        Ok(())
    }

    fn matching_subscription_ids(&self, event_name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .values()
            .filter(|s| s.event_name == event_name)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ---- batch submission (phase / integration) ----------------------

    pub fn submit_phase_event(&mut self, phase: &str, name: &str, payload: Payload, priority: Priority) -> CoreResult<Option<BatchCompletion>> {
        let clock = self.clock.clone().ok_or_else(|| CoreError::dependency_missing("Clock"))?;
        let dispatcher = self.dispatcher.clone().ok_or_else(|| CoreError::dependency_missing("Dispatcher"))?;
        let now = clock.now_seconds();
        let event = Event::builder().name(name).payload(payload).priority(priority).timestamp(now).build()?;
        Ok(self.batch.submit_phase_event(phase, event, now, clock.as_ref(), dispatcher.as_ref(), &mut self.throughput))
    }

    pub fn submit_integration_event(&mut self, bucket: &str, name: &str, payload: Payload, priority: Priority) -> CoreResult<Option<BatchCompletion>> {
        let clock = self.clock.clone().ok_or_else(|| CoreError::dependency_missing("Clock"))?;
        let dispatcher = self.dispatcher.clone().ok_or_else(|| CoreError::dependency_missing("Dispatcher"))?;
        let now = clock.now_seconds();
        let event = Event::builder().name(name).payload(payload).priority(priority).timestamp(now).build()?;
        Ok(self.batch.submit_integration_event(bucket, event, now, clock.as_ref(), dispatcher.as_ref(), &mut self.throughput))
    }

    pub fn force_process_all_batches(&mut self) -> CoreResult<Vec<BatchCompletion>> {
        let clock = self.clock.clone().ok_or_else(|| CoreError::dependency_missing("Clock"))?;
        let dispatcher = self.dispatcher.clone().ok_or_else(|| CoreError::dependency_missing("Dispatcher"))?;
        let now = clock.now_seconds();
        Ok(self.batch.force_process_all_batches(now, clock.as_ref(), dispatcher.as_ref(), &mut self.throughput))
    }

    // ---- replay ---------------------------------------------------

    pub fn start_replay_session(
        &mut self,
        subscription_id: &str,
        start_ts: f64,
        end_ts: f64,
        filters: Vec<String>,
        speed: f64,
    ) -> CoreResult<String> {
        let clock = self.clock.clone().ok_or_else(|| CoreError::dependency_missing("Clock"))?;
        self.replay.start_replay_session(subscription_id, start_ts, end_ts, filters, speed, clock.as_ref(), self.rng.as_ref())
    }

    pub fn pause_replay_session(&mut self, session_id: &str) -> CoreResult<()> {
        self.replay.pause_session(session_id)
    }

    pub fn resume_replay_session(&mut self, session_id: &str) -> CoreResult<()> {
        self.replay.resume_session(session_id)
    }

    pub fn stop_replay_session(&mut self, session_id: &str) {
        self.replay.stop_session(session_id)
    }

    pub fn replay_session_status(&self, session_id: &str) -> Option<ReplayStatus> {
        self.replay.session_status(session_id)
    }

    pub fn events_from_global_replay_buffer(&self, start_ts: f64, end_ts: f64, filters: &[String]) -> Vec<Event> {
        self.replay.get_events_from_global_buffer(start_ts, end_ts, filters)
    }

    // ---- time windows -----------------------------------------------

    pub fn create_time_window(&mut self, config: WindowConfig) -> CoreResult<()> {
        let now = self.clock.as_ref().ok_or_else(|| CoreError::dependency_missing("Clock"))?.now_seconds();
        self.windows.create_time_window(config, now)
    }

    pub fn remove_time_window(&mut self, id: &str) {
        self.windows.remove_time_window(id)
    }

    pub fn clear_all_windows(&mut self) -> usize {
        self.windows.clear_all_windows()
    }

    pub fn get_window_aggregation(&self, id: &str) -> CoreResult<AggregationResult> {
        self.windows.get_window_aggregation(id)
    }

    pub fn get_all_window_summaries(&self) -> Vec<(String, AggregationResult)> {
        self.windows.get_all_window_summaries()
    }

    // ---- health routing -----------------------------------------------

    pub fn update_system_health(&mut self, system: &str, failure_probability: f64) {
        self.router.update_system_health(system, failure_probability);
    }

    pub fn routing_recommendation(&self, targets: &[String], event_priority_adjustment: f64) -> RoutingRecommendation {
        self.router.get_routing_recommendation(targets, event_priority_adjustment)
    }

    // ---- tick -----------------------------------------------------

    /// The single entry point for the host's frame tick: sweeps batch
    /// buckets for timeout flush, advances cooperative batch work and
    /// replay pacing, and brackets the throughput monitor's frame window.
    #[tracing::instrument(skip(self))]
    pub fn tick(&mut self, now_wall_seconds: f64) -> CoreResult<()> {
        let (Some(clock), Some(dispatcher)) = (self.clock.clone(), self.dispatcher.clone()) else {
            tracing::error!("tick called before Clock/Dispatcher were injected");
            self.pending_ops.push_back(PendingOp::Tick { now_wall_seconds });
            return Err(CoreError::dependency_missing("Clock/Dispatcher"));
        };

        self.throughput.end_frame_monitoring(now_wall_seconds);

        let completions = self.batch.sweep(now_wall_seconds, clock.as_ref(), dispatcher.as_ref(), &mut self.throughput);
        self.record_completions(&completions);

        if self.batch.has_pending_cooperative_work() {
            let budget = self.batch.yield_threshold();
            let completions = self.batch.step(budget, clock.as_ref(), dispatcher.as_ref(), &mut self.throughput);
            self.record_completions(&completions);
        }

        self.replay.advance(now_wall_seconds, dispatcher.as_ref());
        self.refresh_backpressure_metrics(now_wall_seconds);

        self.throughput.start_frame_monitoring(now_wall_seconds);
        Ok(())
    }

    fn record_completions(&mut self, completions: &[BatchCompletion]) {
        for completion in completions {
            self.dispatched_total += completion.count as u64;
            self.dispatch_failures += completion.failed as u64;
        }
    }

    fn refresh_backpressure_metrics(&mut self, now: f64) {
        let total_capacity = self.queue.total_capacity().max(1) as f64;
        let queue_utilization = self.queue.total_queued_depth() as f64 / total_capacity;

        let max_backlog = self.queue.max_backlog_size().max(1) as f64;
        let memory_pressure = self.queue.backlog_len() as f64 / max_backlog;

        let frame_budget_ms = self.batch.frame_budget_ms().max(1e-9);
        let last_frame_ms = self.throughput.status().last_frame_ms.unwrap_or(0.0);
        let frame_budget_used = last_frame_ms / frame_budget_ms;

        let max_events_per_frame = self.batch.max_events_per_frame().max(1) as f64;
        let processing_rate = (self.throughput.events_per_frame() / max_events_per_frame).min(2.0);

        let events_per_second = self.throughput.total_events_per_second(now);
        let failed_events_rate = if self.dispatched_total == 0 {
            0.0
        } else {
            self.dispatch_failures as f64 / self.dispatched_total as f64
        };

        self.backpressure.update_metrics(BackpressureMetrics {
            queue_utilization,
            processing_rate,
            memory_pressure,
            frame_budget_used,
            events_per_second,
            failed_events_rate,
        });
    }

    // ---- status snapshots ---------------------------------------------

    pub fn queue_status(&self, subscription_id: &str) -> CoreResult<SubscriberQueueMetrics> {
        self.queue.queue_metrics(subscription_id)
    }

    pub fn backpressure_status(&self) -> BackpressureStatus {
        self.backpressure.status()
    }

    pub fn throughput_status(&self) -> ThroughputStatus {
        self.throughput.status()
    }

    pub fn window_summaries(&self) -> Vec<(String, AggregationResult)> {
        self.windows.get_all_window_summaries()
    }

    pub fn router_status(&self) -> Vec<(String, HealthEntry)> {
        self.router.all_health_statuses()
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.batch.status()
    }

    pub fn replay_status(&self) -> ReplaySystemStatus {
        self.replay.status()
    }
}
