//! Fluxbus Event Model
//!
//! Defines the `Event` that flows through the bus: a name, a dynamically
//! typed payload, a priority, and the timestamps/metadata the core
//! subsystems attach as the event moves through queues, the backlog, and
//! replay buffers.

pub use fluxbus_schema::{self, is_reserved_key, Payload, Value};

/// Event priority, `0` (low) through `3` (critical), as named in the data
/// model.
pub type Priority = u8;

pub const PRIORITY_LOW: Priority = 0;
pub const PRIORITY_NORMAL: Priority = 1;
pub const PRIORITY_HIGH: Priority = 2;
pub const PRIORITY_CRITICAL: Priority = 3;

/// Structural metadata the persistent queue stamps onto an event at
/// enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMeta {
    pub queued_at: f64,
    pub subscription_id: String,
    pub queue_depth: usize,
}

/// Structural metadata the global backlog stamps onto an event at
/// insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogMeta {
    pub inserted_at: f64,
    /// Monotonically increasing insertion sequence number, unique for the
    /// lifetime of the backlog (not reused after eviction).
    pub sequence: u64,
}

/// A single event flowing through the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Payload,
    pub priority: Priority,
    /// Seconds, per the injected `Clock` capability.
    pub timestamp: f64,
    pub processing_time: Option<f64>,
    pub error_flag: bool,
    pub queue_meta: Option<QueueMeta>,
    pub backlog_meta: Option<BacklogMeta>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Payload, priority: Priority, timestamp: f64) -> Self {
        Self {
            name: name.into(),
            payload,
            priority,
            timestamp,
            processing_time: None,
            error_flag: false,
            queue_meta: None,
            backlog_meta: None,
        }
    }

    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    pub fn get_field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.payload.contains_key(key)
    }

    pub fn with_queue_meta(mut self, meta: QueueMeta) -> Self {
        self.queue_meta = Some(meta);
        self
    }

    pub fn with_backlog_meta(mut self, meta: BacklogMeta) -> Self {
        self.backlog_meta = Some(meta);
        self
    }
}

/// Builder for convenient, validated event construction.
#[derive(Debug, Default)]
pub struct EventBuilder {
    name: Option<String>,
    payload: Payload,
    priority: Priority,
    timestamp: Option<f64>,
    processing_time: Option<f64>,
    error_flag: bool,
}

impl EventBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timestamp(mut self, ts: f64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn processing_time(mut self, seconds: f64) -> Self {
        self.processing_time = Some(seconds);
        self
    }

    pub fn error_flag(mut self, flag: bool) -> Self {
        self.error_flag = flag;
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Result<Event, BuildError> {
        let name = self.name.ok_or(BuildError::MissingField("name"))?;
        if name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        if self.priority > PRIORITY_CRITICAL {
            return Err(BuildError::InvalidPriority(self.priority));
        }
        let timestamp = self.timestamp.ok_or(BuildError::MissingField("timestamp"))?;

        Ok(Event {
            name,
            payload: self.payload,
            priority: self.priority,
            timestamp,
            processing_time: self.processing_time,
            error_flag: self.error_flag,
            queue_meta: None,
            backlog_meta: None,
        })
    }
}

/// Error building an event.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("event name must not be empty")]
    EmptyName,

    #[error("invalid priority {0}, must be 0..=3")]
    InvalidPriority(Priority),
}
