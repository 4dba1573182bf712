//! Persistent Queue.
//!
//! Owns every subscriber's FIFO queue plus the single process-wide global
//! backlog. All operations are O(1) amortized except the backlog's
//! historical queries, which scan it in insertion order.

use std::collections::VecDeque;

use ahash::AHashMap;
use fluxbus_event::{BacklogMeta, Event, QueueMeta};
use serde::Serialize;

use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
    Block,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Fraction of `max_size` at which a queue is considered under
    /// backpressure (spec default 0.8).
    pub backpressure_threshold: f64,
    pub max_backlog_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: 0.8,
            max_backlog_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriberQueueMetrics {
    pub queued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub max_depth: usize,
    /// Rough running mean of queue depth, sampled on dequeue only using
    /// `queued` as the sample count. Not a true time-weighted average;
    /// read it as an indicator rather than a precise statistic.
    pub avg_depth: f64,
    pub backpressure_hits: u64,
    pub last_processed: Option<f64>,
}

struct SubscriberQueue {
    max_size: usize,
    drop_policy: DropPolicy,
    events: VecDeque<Event>,
    metrics: SubscriberQueueMetrics,
}

impl SubscriberQueue {
    fn current_depth(&self) -> usize {
        self.events.len()
    }
}

/// Per-subscriber FIFO plus the bounded, front-evicting global backlog.
pub struct PersistentQueue {
    config: QueueConfig,
    queues: AHashMap<String, SubscriberQueue>,
    backlog: VecDeque<Event>,
    next_sequence: u64,
}

impl PersistentQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: AHashMap::default(),
            backlog: VecDeque::new(),
            next_sequence: 0,
        }
    }

    pub fn create_subscriber_queue(
        &mut self,
        id: &str,
        max_size: usize,
        drop_policy: DropPolicy,
    ) -> CoreResult<()> {
        if self.queues.contains_key(id) {
            return Err(CoreError::already_exists(id));
        }
        if max_size == 0 {
            return Err(CoreError::invalid_argument("max_size must be > 0"));
        }
        self.queues.insert(
            id.to_string(),
            SubscriberQueue {
                max_size,
                drop_policy,
                events: VecDeque::new(),
                metrics: SubscriberQueueMetrics::default(),
            },
        );
        Ok(())
    }

    pub fn remove_subscriber_queue(&mut self, id: &str) -> CoreResult<()> {
        self.queues.remove(id).map(|_| ()).ok_or_else(|| CoreError::not_found(id))
    }

    pub fn clear_subscriber_queue(&mut self, id: &str) -> CoreResult<()> {
        let queue = self.queues.get_mut(id).ok_or_else(|| CoreError::not_found(id))?;
        queue.events.clear();
        queue.metrics.queued = 0;
        Ok(())
    }

    /// Enqueues `event` for subscriber `id`. Returns `Ok(true)` if the
    /// event (or its replacement, under `drop_oldest`) is now queued, or
    /// `Ok(false)` if it was rejected (`drop_newest` / `block`).
    pub fn enqueue(&mut self, id: &str, mut event: Event, now: f64) -> CoreResult<bool> {
        let queue = self.queues.get_mut(id).ok_or_else(|| CoreError::not_found(id))?;

        let threshold_depth = self.config.backpressure_threshold * queue.max_size as f64;
        if queue.current_depth() as f64 >= threshold_depth {
            queue.metrics.backpressure_hits += 1;
        }

        if queue.current_depth() >= queue.max_size {
            match queue.drop_policy {
                DropPolicy::DropOldest => {
                    queue.events.pop_front();
                    queue.metrics.dropped += 1;
                }
                DropPolicy::DropNewest => {
                    queue.metrics.dropped += 1;
                    return Ok(false);
                }
                DropPolicy::Block => return Ok(false),
            }
        }

        let depth_after = queue.events.len() + 1;
        event = event.with_queue_meta(QueueMeta {
            queued_at: now,
            subscription_id: id.to_string(),
            queue_depth: depth_after,
        });
        queue.events.push_back(event);
        queue.metrics.queued += 1;
        queue.metrics.max_depth = queue.metrics.max_depth.max(depth_after);

        Ok(true)
    }

    pub fn dequeue(&mut self, id: &str, now: f64) -> CoreResult<Option<Event>> {
        let queue = self.queues.get_mut(id).ok_or_else(|| CoreError::not_found(id))?;
        let Some(event) = queue.events.pop_front() else {
            return Ok(None);
        };
        queue.metrics.processed += 1;
        queue.metrics.last_processed = Some(now);

        // EMA-like update using `queued` as sample count; approximate and
        // only updated on dequeue, not a true time-weighted average.
        let n = queue.metrics.queued.max(1) as f64;
        let depth = queue.current_depth() as f64;
        queue.metrics.avg_depth += (depth - queue.metrics.avg_depth) / n;

        Ok(Some(event))
    }

    pub fn queue_metrics(&self, id: &str) -> CoreResult<SubscriberQueueMetrics> {
        self.queues
            .get(id)
            .map(|q| q.metrics.clone())
            .ok_or_else(|| CoreError::not_found(id))
    }

    pub fn current_depth(&self, id: &str) -> CoreResult<usize> {
        self.queues
            .get(id)
            .map(|q| q.current_depth())
            .ok_or_else(|| CoreError::not_found(id))
    }

    pub fn total_queued_depth(&self) -> usize {
        self.queues.values().map(|q| q.current_depth()).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.queues.values().map(|q| q.max_size).sum()
    }

    pub fn max_backlog_size(&self) -> usize {
        self.config.max_backlog_size
    }

    /// Appends `event` to the global backlog, stamping `backlog_meta` and
    /// evicting the oldest entry if the backlog is at capacity.
    pub fn add_to_global_backlog(&mut self, mut event: Event, now: f64) -> Event {
        event = event.with_backlog_meta(BacklogMeta {
            inserted_at: now,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;

        self.backlog.push_back(event.clone());
        while self.backlog.len() > self.config.max_backlog_size {
            self.backlog.pop_front();
        }
        event
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn get_events_since(&self, ts: f64) -> Vec<Event> {
        self.backlog.iter().filter(|e| e.timestamp >= ts).cloned().collect()
    }

    pub fn get_events_in_window(&self, start: f64, end: f64) -> Vec<Event> {
        self.backlog
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn get_recent(&self, n: usize) -> Vec<Event> {
        let skip = self.backlog.len().saturating_sub(n);
        self.backlog.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxbus_event::Payload;

    fn make_event(name: &str, ts: f64) -> Event {
        Event::new(name, Payload::default(), 0, ts)
    }

    #[test]
    fn drop_oldest_under_pressure() {
        let mut queue = PersistentQueue::new(QueueConfig::default());
        queue.create_subscriber_queue("s1", 3, DropPolicy::DropOldest).unwrap();

        for name in ["A", "B", "C", "D"] {
            queue.enqueue("s1", make_event(name, 0.0), 0.0).unwrap();
        }

        let metrics = queue.queue_metrics("s1").unwrap();
        assert_eq!(queue.current_depth("s1").unwrap(), 3);
        assert_eq!(metrics.dropped, 1);
        assert!(metrics.backpressure_hits >= 1);

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue("s1", 0.0).unwrap().map(|e| e.name))
            .collect();
        assert_eq!(order, vec!["B", "C", "D"]);
    }

    #[test]
    fn drop_newest_rejects_and_keeps_depth() {
        let mut queue = PersistentQueue::new(QueueConfig::default());
        queue.create_subscriber_queue("s1", 2, DropPolicy::DropNewest).unwrap();
        queue.enqueue("s1", make_event("A", 0.0), 0.0).unwrap();
        queue.enqueue("s1", make_event("B", 0.0), 0.0).unwrap();

        let accepted = queue.enqueue("s1", make_event("C", 0.0), 0.0).unwrap();
        assert!(!accepted);
        assert_eq!(queue.current_depth("s1").unwrap(), 2);
        assert_eq!(queue.queue_metrics("s1").unwrap().dropped, 1);
    }

    #[test]
    fn block_rejects_without_dropping() {
        let mut queue = PersistentQueue::new(QueueConfig::default());
        queue.create_subscriber_queue("s1", 1, DropPolicy::Block).unwrap();
        queue.enqueue("s1", make_event("A", 0.0), 0.0).unwrap();

        let accepted = queue.enqueue("s1", make_event("B", 0.0), 0.0).unwrap();
        assert!(!accepted);
        assert_eq!(queue.current_depth("s1").unwrap(), 1);
        assert_eq!(queue.queue_metrics("s1").unwrap().dropped, 0);
    }

    #[test]
    fn create_duplicate_fails() {
        let mut queue = PersistentQueue::new(QueueConfig::default());
        queue.create_subscriber_queue("s1", 4, DropPolicy::Block).unwrap();
        let result = queue.create_subscriber_queue("s1", 4, DropPolicy::Block);
        assert!(matches!(result, Err(CoreError::AlreadyExists(_))));
    }

    #[test]
    fn backlog_evicts_from_front() {
        let mut queue = PersistentQueue::new(QueueConfig {
            max_backlog_size: 2,
            ..Default::default()
        });
        queue.add_to_global_backlog(make_event("A", 1.0), 1.0);
        queue.add_to_global_backlog(make_event("B", 2.0), 2.0);
        queue.add_to_global_backlog(make_event("C", 3.0), 3.0);

        assert_eq!(queue.backlog_len(), 2);
        let recent = queue.get_recent(10);
        assert_eq!(recent.iter().map(|e| e.name.clone()).collect::<Vec<_>>(), vec!["B", "C"]);
    }

    #[test]
    fn window_and_since_filters() {
        let mut queue = PersistentQueue::new(QueueConfig::default());
        for (name, ts) in [("x", 1.0), ("y", 2.0), ("x", 3.0), ("y", 4.0), ("x", 5.0)] {
            queue.add_to_global_backlog(make_event(name, ts), ts);
        }

        let since = queue.get_events_since(3.0);
        assert_eq!(since.len(), 3);

        let window = queue.get_events_in_window(2.0, 4.0);
        assert_eq!(window.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }
}
