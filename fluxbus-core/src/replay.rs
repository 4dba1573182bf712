//! Replay System.
//!
//! A global ring buffer mirrors every published event; subscriptions that
//! opt in get their own bounded buffer. Sessions replay a filtered window
//! of a subscription's buffer at a configurable speed, pacing playback off
//! the recorded timestamps rather than wall-clock arrival order.

use std::collections::VecDeque;

use ahash::AHashMap;
use fluxbus_event::Event;
use serde::Serialize;

use crate::errors::{CoreError, CoreResult};
use crate::host::{Clock, Dispatcher, Rng};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub max_global_buffer_size: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_global_buffer_size: 50_000,
        }
    }
}

struct ReplayBuffer {
    events: VecDeque<Event>,
    max_size: usize,
    #[allow(dead_code)]
    created_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Running,
    Paused,
    Completed,
}

struct ReplaySession {
    subscription_id: String,
    speed: f64,
    position: usize,
    state: SessionState,
    matched: Vec<Event>,
    next_due_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayStatus {
    pub session_id: String,
    pub subscription_id: String,
    pub state: SessionState,
    pub position: usize,
    pub total: usize,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySystemStatus {
    pub global_buffer_len: usize,
    pub enabled_subscription_buffers: usize,
    pub active_sessions: usize,
}

pub struct ReplaySystem {
    config: ReplayConfig,
    global: VecDeque<Event>,
    buffers: AHashMap<String, ReplayBuffer>,
    sessions: AHashMap<String, ReplaySession>,
}

impl ReplaySystem {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            global: VecDeque::new(),
            buffers: AHashMap::default(),
            sessions: AHashMap::default(),
        }
    }

    pub fn enable_replay(&mut self, subscription_id: &str, max_size: usize, now: f64) -> CoreResult<()> {
        if self.buffers.contains_key(subscription_id) {
            return Err(CoreError::already_exists(subscription_id));
        }
        self.buffers.insert(
            subscription_id.to_string(),
            ReplayBuffer {
                events: VecDeque::new(),
                max_size,
                created_at: now,
            },
        );
        Ok(())
    }

    pub fn disable_replay(&mut self, subscription_id: &str) -> CoreResult<()> {
        self.buffers
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(subscription_id))
    }

    /// Appends `event` to the global ring buffer and to every enabled
    /// subscription buffer, evicting from the front on overflow.
    pub fn add_event_to_replay_buffers(&mut self, event: &Event) {
        self.global.push_back(event.clone());
        while self.global.len() > self.config.max_global_buffer_size {
            self.global.pop_front();
        }
        for buffer in self.buffers.values_mut() {
            buffer.events.push_back(event.clone());
            while buffer.events.len() > buffer.max_size {
                buffer.events.pop_front();
            }
        }
    }

    pub fn global_buffer_len(&self) -> usize {
        self.global.len()
    }

    pub fn status(&self) -> ReplaySystemStatus {
        ReplaySystemStatus {
            global_buffer_len: self.global.len(),
            enabled_subscription_buffers: self.buffers.len(),
            active_sessions: self.sessions.values().filter(|s| s.state == SessionState::Running).count(),
        }
    }

    pub fn get_replay_buffer_events(&self, subscription_id: &str) -> CoreResult<Vec<Event>> {
        self.buffers
            .get(subscription_id)
            .map(|b| b.events.iter().cloned().collect())
            .ok_or_else(|| CoreError::not_found(subscription_id))
    }

    /// Queries the global ring buffer directly, restricted to `[start_ts,
    /// end_ts]` and (if non-empty) `filters` event names. Used for ad-hoc
    /// historical lookups that don't need a full replay session.
    pub fn get_events_from_global_buffer(&self, start_ts: f64, end_ts: f64, filters: &[String]) -> Vec<Event> {
        self.global
            .iter()
            .filter(|e| e.timestamp >= start_ts && e.timestamp <= end_ts)
            .filter(|e| filters.is_empty() || filters.contains(&e.name))
            .cloned()
            .collect()
    }

    /// Starts a new session over `subscription_id`'s buffer, restricted to
    /// `[start_ts, end_ts]` and (if non-empty) `filters` event names.
    /// Returns a session id built from the current time and a random value.
    pub fn start_replay_session(
        &mut self,
        subscription_id: &str,
        start_ts: f64,
        end_ts: f64,
        filters: Vec<String>,
        speed: f64,
        clock: &dyn Clock,
        rng: &dyn Rng,
    ) -> CoreResult<String> {
        let buffer = self
            .buffers
            .get(subscription_id)
            .ok_or_else(|| CoreError::not_found(subscription_id))?;

        let matched: Vec<Event> = buffer
            .events
            .iter()
            .filter(|e| e.timestamp >= start_ts && e.timestamp <= end_ts)
            .filter(|e| filters.is_empty() || filters.contains(&e.name))
            .cloned()
            .collect();

        let session_id = format!("replay-{}-{}", clock.now_micros(), rng.uniform());
        self.sessions.insert(
            session_id.clone(),
            ReplaySession {
                subscription_id: subscription_id.to_string(),
                speed: speed.max(1e-9),
                position: 0,
                state: SessionState::Running,
                matched,
                next_due_at: None,
            },
        );
        Ok(session_id)
    }

    pub fn pause_session(&mut self, session_id: &str) -> CoreResult<()> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| CoreError::not_found(session_id))?;
        if session.state == SessionState::Running {
            session.state = SessionState::Paused;
        }
        Ok(())
    }

    pub fn resume_session(&mut self, session_id: &str) -> CoreResult<()> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| CoreError::not_found(session_id))?;
        if session.state == SessionState::Paused {
            session.state = SessionState::Running;
            session.next_due_at = None;
        }
        Ok(())
    }

    /// Stops (erases) a session. Idempotent: stopping a session that has
    /// already completed or no longer exists is not an error.
    pub fn stop_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_status(&self, session_id: &str) -> Option<ReplayStatus> {
        self.sessions.get(session_id).map(|s| {
            let total = s.matched.len();
            let progress = if total == 0 { 1.0 } else { s.position as f64 / total as f64 };
            ReplayStatus {
                session_id: session_id.to_string(),
                subscription_id: s.subscription_id.clone(),
                state: s.state,
                position: s.position,
                total,
                progress,
            }
        })
    }

    /// Advances every running session's pacing: emits the next due event
    /// (if any) through `dispatcher` and schedules the following one using
    /// `(e2.ts - e1.ts) / speed` as the wall-clock gap.
    pub fn advance(&mut self, now: f64, dispatcher: &dyn Dispatcher) {
        for session in self.sessions.values_mut() {
            if session.state != SessionState::Running {
                continue;
            }
            if session.position >= session.matched.len() {
                session.state = SessionState::Completed;
                continue;
            }
            if let Some(due) = session.next_due_at {
                if now < due {
                    continue;
                }
            }

            let event = &session.matched[session.position];
            dispatcher.dispatch_single(event);
            let prev_ts = event.timestamp;
            session.position += 1;

            if session.position < session.matched.len() {
                let gap = (session.matched[session.position].timestamp - prev_ts) / session.speed;
                session.next_due_at = Some(now + gap.max(0.0));
            } else {
                session.state = SessionState::Completed;
                session.next_due_at = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FixedSequenceRng, MockClock};
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
    fn buffers_mirror_global_and_enabled_subscriptions() {
        let mut replay = ReplaySystem::new(ReplayConfig::default());
        replay.enable_replay("s1", 10, 0.0).unwrap();

        replay.add_event_to_replay_buffers(&event("x", 1.0));
        assert_eq!(replay.global_buffer_len(), 1);
        assert_eq!(replay.get_replay_buffer_events("s1").unwrap().len(), 1);
        assert!(replay.get_replay_buffer_events("s2").is_err());
    }

    #[test]
    fn session_filters_window_and_names() {
        let mut replay = ReplaySystem::new(ReplayConfig::default());
        replay.enable_replay("s1", 100, 0.0).unwrap();
        for (name, ts) in [("x", 1.0), ("y", 2.0), ("x", 3.0), ("y", 10.0)] {
            replay.add_event_to_replay_buffers(&event(name, ts));
        }

        let clock = MockClock::at(0.0);
        let rng = FixedSequenceRng::constant(0.5);
        let id = replay
            .start_replay_session("s1", 0.0, 5.0, vec!["x".to_string()], 1.0, &clock, &rng)
            .unwrap();

        let status = replay.session_status(&id).unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn pacing_emits_in_order_with_speed() {
        let mut replay = ReplaySystem::new(ReplayConfig::default());
        replay.enable_replay("s1", 100, 0.0).unwrap();
        for (name, ts) in [("x", 0.0), ("x", 1.0), ("x", 3.0)] {
            replay.add_event_to_replay_buffers(&event(name, ts));
        }
        let clock = MockClock::at(0.0);
        let rng = FixedSequenceRng::constant(0.1);
        let id = replay
            .start_replay_session("s1", 0.0, 10.0, vec![], 2.0, &clock, &rng)
            .unwrap();

        let dispatcher = AlwaysSucceed;
        replay.advance(0.0, &dispatcher);
        assert_eq!(replay.session_status(&id).unwrap().position, 1);

        // gap to next event is (1.0 - 0.0) / 2.0 = 0.5s; not due yet at 0.2
        replay.advance(0.2, &dispatcher);
        assert_eq!(replay.session_status(&id).unwrap().position, 1);

        replay.advance(0.5, &dispatcher);
        assert_eq!(replay.session_status(&id).unwrap().position, 2);

        replay.advance(1.5, &dispatcher);
        let status = replay.session_status(&id).unwrap();
        assert_eq!(status.position, 3);
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(status.progress, 1.0);
    }

    #[test]
    fn global_buffer_query_filters_window_and_names() {
        let mut replay = ReplaySystem::new(ReplayConfig::default());
        for (name, ts) in [("x", 1.0), ("y", 2.0), ("x", 3.0), ("y", 4.0), ("x", 5.0)] {
            replay.add_event_to_replay_buffers(&event(name, ts));
        }
        let matched = replay.get_events_from_global_buffer(2.0, 4.0, &["x".to_string()]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].timestamp, 3.0);
    }

    #[test]
    fn paused_session_emits_nothing_and_stop_is_idempotent() {
        let mut replay = ReplaySystem::new(ReplayConfig::default());
        replay.enable_replay("s1", 100, 0.0).unwrap();
        replay.add_event_to_replay_buffers(&event("x", 0.0));
        let clock = MockClock::at(0.0);
        let rng = FixedSequenceRng::constant(0.1);
        let id = replay
            .start_replay_session("s1", 0.0, 10.0, vec![], 1.0, &clock, &rng)
            .unwrap();

        replay.pause_session(&id).unwrap();
        let dispatcher = AlwaysSucceed;
        replay.advance(100.0, &dispatcher);
        assert_eq!(replay.session_status(&id).unwrap().position, 0);

        replay.stop_session(&id);
        replay.stop_session(&id); // idempotent
        assert!(replay.session_status(&id).is_none());
    }
}
