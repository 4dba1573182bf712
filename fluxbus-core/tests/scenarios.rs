//! End-to-end scenarios run against the public API with deterministic
//! host capabilities.

use std::sync::{Arc, Mutex};

use fluxbus_core::{
    AggregationFn, BackpressureConfig, BackpressureMetrics, BatchConfig, DropPolicy, Event,
    EventBus, EventBusConfig, FixedSequenceRng, MockClock, Payload, QueueConfig, WindowConfig,
};
use fluxbus_core::{BackpressureController, Clock, Dispatcher};

struct RecordingDispatcher(Mutex<Vec<String>>);

impl Dispatcher for RecordingDispatcher {
    fn dispatch_single(&self, event: &Event) -> bool {
        self.0.lock().unwrap().push(event.name.clone());
        true
    }
}

fn wired_bus(config: EventBusConfig) -> (EventBus, Arc<MockClock>, Arc<RecordingDispatcher>) {
    let mut bus = EventBus::new(config, 0.0);
    let clock = Arc::new(MockClock::at(0.0));
    let dispatcher = Arc::new(RecordingDispatcher(Mutex::new(Vec::new())));
    bus.set_clock(clock.clone());
    bus.set_dispatcher(dispatcher.clone());
    bus.set_rng(Arc::new(FixedSequenceRng::constant(0.0)));
    (bus, clock, dispatcher)
}

#[test]
fn scenario_1_drop_oldest_under_pressure() {
    let (mut bus, _clock, _dispatcher) = wired_bus(EventBusConfig::default());
    bus.subscribe("s1", "widget_created", 3, DropPolicy::DropOldest, 1, false, 0.0).unwrap();

    for name in ["A", "B", "C", "D"] {
        let mut payload = Payload::default();
        payload.insert("tag".to_string(), fluxbus_core::Value::String(name.to_string()));
        bus.publish("widget_created", payload, 0).unwrap();
    }

    let metrics = bus.queue_status("s1").unwrap();
    assert_eq!(metrics.dropped, 1);
    assert!(metrics.backpressure_hits >= 1);

    let mut order = Vec::new();
    while let Some(event) = bus.dequeue("s1").unwrap() {
        order.push(event.get_field("tag").unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(order, vec!["B", "C", "D"]);
}

#[test]
fn scenario_2_adaptive_throttle_escalation() {
    let mut controller = BackpressureController::new(BackpressureConfig::default());

    controller.update_metrics(BackpressureMetrics {
        queue_utilization: 0.72,
        ..Default::default()
    });
    assert!((controller.pressure() - 0.9).abs() < 1e-9);
    assert!((controller.throttle() - 0.6).abs() < 1e-9);
    assert!(controller.should_batch_aggressively());

    controller.update_metrics(BackpressureMetrics {
        queue_utilization: 0.9,
        ..Default::default()
    });
    assert!((controller.pressure() - 1.125).abs() < 1e-9);
    assert!((controller.throttle() - 0.45).abs() < 1e-9);
    assert!(controller.needs_emergency_flush());
}

#[test]
fn scenario_3_health_gating() {
    let mut bus = EventBus::new(EventBusConfig::default(), 0.0);
    bus.update_system_health("A", 0.85);
    assert!(!bus.routing_recommendation(&["A".to_string()], 0.0).recommended.contains(&"A".to_string()));

    bus.update_system_health("A", 0.3);
    let rec = bus.routing_recommendation(&["A".to_string()], 0.0);
    assert!(rec.recommended.contains(&"A".to_string()) || rec.degraded.contains(&"A".to_string()));
}

#[test]
fn scenario_4_replay_window_filter() {
    let (mut bus, clock, _dispatcher) = wired_bus(EventBusConfig::default());
    bus.subscribe("s1", "tick", 100, DropPolicy::Block, 1, true, 0.0).unwrap();

    for (name, ts) in [("x", 1.0), ("y", 2.0), ("x", 3.0), ("y", 4.0), ("x", 5.0)] {
        clock.set_seconds(ts);
        bus.publish(name, Payload::default(), 0).unwrap();
    }

    let matched = bus.events_from_global_replay_buffer(2.0, 4.0, &["x".to_string()]);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].timestamp, 3.0);
}

#[test]
fn scenario_5_sliding_window_aggregation() {
    let (mut bus, clock, _dispatcher) = wired_bus(EventBusConfig::default());
    bus.create_time_window(WindowConfig {
        id: "w1".to_string(),
        duration_s: 10.0,
        slide_interval_s: 5.0,
        event_filters: vec![],
        aggregation_functions: vec![AggregationFn::Count, AggregationFn::EventRate],
        max_events: 1000,
    })
    .unwrap();
    bus.subscribe("s1", "load", 1000, DropPolicy::Block, 1, false, 0.0).unwrap();

    for _ in 0..3 {
        clock.set_seconds(0.0);
        bus.publish("load", Payload::default(), 0).unwrap();
    }
    for _ in 0..4 {
        clock.set_seconds(6.0);
        bus.publish("load", Payload::default(), 0).unwrap();
    }
    for _ in 0..2 {
        clock.set_seconds(11.0);
        bus.publish("load", Payload::default(), 0).unwrap();
    }

    let result = bus.get_window_aggregation("w1").unwrap();
    // at now=11, cutoff = 11 - 10 = 1: only the t=6 (x4) and t=11 (x2) events survive.
    assert_eq!(result.count, 6);
    assert_eq!(result.event_rate, Some(0.6));
}

#[test]
fn scenario_6_batch_flush_on_timeout() {
    let (mut bus, clock, dispatcher) = wired_bus(EventBusConfig {
        batch: BatchConfig {
            high_throughput_mode: false,
            max_batch_size: 50,
            batch_timeout: 0.1,
            ..Default::default()
        },
        queue: QueueConfig::default(),
        ..Default::default()
    });

    for i in 0..3 {
        bus.submit_phase_event("startup", &format!("phase_evt_{i}"), Payload::default(), 0).unwrap();
    }

    clock.advance_seconds(0.12);
    bus.tick(clock.now_seconds()).unwrap();

    assert_eq!(dispatcher.0.lock().unwrap().len(), 3);
}
