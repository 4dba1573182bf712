//! Health-Aware Router.
//!
//! Caches a routing decision per downstream system and logs only on band
//! transitions, so a system wobbling around a threshold doesn't spam the
//! log on every tick.

use ahash::AHashMap;
use serde::Serialize;

/// `should_route` flips at this health score.
const ROUTING_THRESHOLD: f64 = 0.2;
const WARNING_THRESHOLD: f64 = 0.5;
const CRITICAL_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthBand {
    Healthy,
    Warning,
    Critical,
}

fn band_for(score: f64) -> HealthBand {
    if score <= CRITICAL_THRESHOLD {
        HealthBand::Critical
    } else if score <= WARNING_THRESHOLD {
        HealthBand::Warning
    } else {
        HealthBand::Healthy
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthEntry {
    pub health_score: f64,
    pub should_route: bool,
    #[serde(skip)]
    band: HealthBand,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RoutingVerdict {
    Proceed,
    ProceedWithCaution,
    Block,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingRecommendation {
    pub recommended: Vec<String>,
    pub degraded: Vec<String>,
    pub blocked: Vec<String>,
    pub overall: RoutingVerdict,
}

#[derive(Default)]
pub struct HealthRouter {
    systems: AHashMap<String, HealthEntry>,
}

impl HealthRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes `health_score = 1 - failure_probability` for `system`,
    /// logging a warn/critical message only when the health band actually
    /// changes.
    pub fn update_system_health(&mut self, system: &str, failure_probability: f64) {
        let score = (1.0 - failure_probability).clamp(0.0, 1.0);
        let new_band = band_for(score);
        let should_route = score > ROUTING_THRESHOLD;

        let previous_band = self.systems.get(system).map(|e| e.band);
        if previous_band != Some(new_band) {
            match new_band {
                HealthBand::Critical => {
                    tracing::error!(system, health_score = score, "system health critical")
                }
                HealthBand::Warning => {
                    tracing::warn!(system, health_score = score, "system health degraded")
                }
                HealthBand::Healthy => {
                    if previous_band.is_some() {
                        tracing::info!(system, health_score = score, "system health recovered")
                    }
                }
            }
        }

        self.systems.insert(
            system.to_string(),
            HealthEntry {
                health_score: score,
                should_route,
                band: new_band,
            },
        );
    }

    pub fn health_entry(&self, system: &str) -> Option<HealthEntry> {
        self.systems.get(system).copied()
    }

    /// Every tracked system's current health entry, sorted by name.
    pub fn all_health_statuses(&self) -> Vec<(String, HealthEntry)> {
        let mut entries: Vec<_> = self.systems.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// `false` if the cached routing decision is `false`; otherwise applies
    /// `event_priority_adjustment`. A negative adjustment raises the bar
    /// the cached score must clear.
    pub fn should_route_to_system(&self, system: &str, event_priority_adjustment: f64) -> bool {
        let Some(entry) = self.systems.get(system) else {
            return false;
        };
        if !entry.should_route {
            return false;
        }
        if event_priority_adjustment < 0.0 {
            let required = ROUTING_THRESHOLD + (-event_priority_adjustment) * 0.1;
            return entry.health_score > required;
        }
        true
    }

    pub fn get_routing_recommendation(
        &self,
        targets: &[String],
        event_priority_adjustment: f64,
    ) -> RoutingRecommendation {
        let mut recommended = Vec::new();
        let mut degraded = Vec::new();
        let mut blocked = Vec::new();

        for system in targets {
            if !self.should_route_to_system(system, event_priority_adjustment) {
                blocked.push(system.clone());
                continue;
            }
            match self.systems.get(system).map(|e| e.band) {
                Some(HealthBand::Warning) | Some(HealthBand::Critical) => {
                    degraded.push(system.clone())
                }
                _ => recommended.push(system.clone()),
            }
        }

        let overall = if !targets.is_empty() && blocked.len() == targets.len() {
            RoutingVerdict::Block
        } else if !degraded.is_empty() {
            RoutingVerdict::ProceedWithCaution
        } else {
            RoutingVerdict::Proceed
        };

        RoutingRecommendation {
            recommended,
            degraded,
            blocked,
            overall,
        }
    }
}
