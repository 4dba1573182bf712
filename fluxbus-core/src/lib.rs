//! Fluxbus core: an in-process event bus built from six cooperating
//! subsystems (persistent queue, backpressure controller, batch processor,
//! health-aware router, replay system, time-window aggregator) wired
//! together by a single [`EventBus`] coordinator, driven by a host-provided
//! tick rather than an async runtime (see [`host`] for the capabilities a
//! host must inject).

pub mod backpressure;
pub mod batch;
pub mod bus;
pub mod errors;
pub mod host;
pub mod queue;
pub mod replay;
pub mod router;
pub mod throughput;
pub mod window;

pub use backpressure::{
    Action, BackpressureConfig, BackpressureController, BackpressureMetrics, BackpressureObserver,
    BackpressureStatus, BackpressureThresholds,
};
pub use batch::{BatchCompletion, BatchConfig, BatchProcessor, BatchStatus};
pub use bus::{EventBus, EventBusConfig, Subscription};
pub use errors::{CoreError, CoreResult};
pub use host::{Clock, Dispatcher, FixedSequenceRng, MockClock, NullDispatcher, Rng, SystemClock, ThreadRng};
pub use queue::{DropPolicy, PersistentQueue, QueueConfig, SubscriberQueueMetrics};
pub use replay::{ReplayConfig, ReplayStatus, ReplaySystem, ReplaySystemStatus, SessionState};
pub use router::{HealthEntry, HealthRouter, RoutingRecommendation, RoutingVerdict};
pub use throughput::{ThroughputConfig, ThroughputMonitor, ThroughputStatus};
pub use window::{AggregationFn, AggregationResult, TimeWindowAggregator, WindowConfig};

pub use fluxbus_event::{Event, Payload, Priority, Value};
