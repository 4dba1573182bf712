//! Host-provided capabilities.
//!
//! The core never reads the wall clock, calls a global RNG, or invokes a
//! subscriber handler directly: it always goes through one of these
//! injected capabilities, so the whole bus can be driven deterministically
//! from a test without touching real time or true randomness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fluxbus_event::Event;

/// Clock capability: `now_seconds()` / `now_micros()`.
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> f64;
    fn now_micros(&self) -> i64;
}

/// Real wall-clock implementation.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests and replay-driven runs. Stores
/// microseconds in an atomic so it can be shared (`Arc<MockClock>`) and
/// advanced from outside while the bus holds its own handle.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    micros: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(seconds: f64) -> Self {
        let clock = Self::new();
        clock.set_seconds(seconds);
        clock
    }

    pub fn set_seconds(&self, seconds: f64) {
        self.micros.store((seconds * 1_000_000.0) as u64, Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, delta: f64) {
        let delta_us = (delta * 1_000_000.0) as u64;
        self.micros.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_seconds(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst) as i64
    }
}

/// RNG capability: `uniform() -> float in [0, 1)`.
pub trait Rng: Send + Sync {
    fn uniform(&self) -> f64;
}

/// Real RNG backed by the thread-local generator.
#[derive(Debug, Clone, Default)]
pub struct ThreadRng;

impl Rng for ThreadRng {
    fn uniform(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic RNG for tests: cycles through a fixed sequence of values
/// so probabilistic throttle/drop decisions become reproducible assertions.
#[derive(Debug, Clone)]
pub struct FixedSequenceRng {
    values: Vec<f64>,
    cursor: Arc<AtomicU64>,
}

impl FixedSequenceRng {
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "FixedSequenceRng needs at least one value");
        Self {
            values,
            cursor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Always returns the same value, useful for forcing a branch.
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }
}

impl Rng for FixedSequenceRng {
    fn uniform(&self) -> f64 {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) as usize % self.values.len();
        self.values[i]
    }
}

/// Dispatch capability: `dispatch_single(event) -> bool`.
/// The core decides whether and when to dispatch; actually invoking
/// subscriber handlers is always this collaborator's job.
pub trait Dispatcher: Send + Sync {
    fn dispatch_single(&self, event: &Event) -> bool;
}

/// Dispatcher used when no host dispatcher has been wired up yet; every
/// call fails, the same as a handler that always errors.
#[derive(Debug, Clone, Default)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn dispatch_single(&self, _event: &Event) -> bool {
        false
    }
}
