//! Per-model health tracking: rolling counters plus a 60-second
//! rate-limit bucket, collapsed into a healthy/unhealthy verdict that
//! feeds worker selection.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::types::ModelId;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Thresholds controlling when a model is considered unhealthy.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Minimum sample size before failure-rate thresholds apply.
    pub min_samples: u32,
    pub max_failure_rate: f64,
    pub max_hollow_rate: f64,
    pub max_rate_limits_per_window: u32,
    pub max_quality_rejections: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_samples: 5,
            max_failure_rate: 0.5,
            max_hollow_rate: 0.3,
            max_rate_limits_per_window: 2,
            max_quality_rejections: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Counters {
    successes: u64,
    failures: u64,
    hollow: u64,
    quality_rejections: u64,
    latency_samples: VecDeque<Duration>,
    rate_limit_hits: VecDeque<std::time::Instant>,
}

const MAX_LATENCY_SAMPLES: usize = 64;

impl Counters {
    fn total(&self) -> u64 {
        self.successes + self.failures
    }

    fn failure_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.failures as f64 / self.total() as f64
        }
    }

    fn hollow_rate(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.hollow as f64 / self.successes as f64
        }
    }

    fn prune_rate_limits(&mut self, now: std::time::Instant) {
        while let Some(&front) = self.rate_limit_hits.front() {
            if now.duration_since(front) > RATE_LIMIT_WINDOW {
                self.rate_limit_hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn mean_latency(&self) -> Option<Duration> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let total: Duration = self.latency_samples.iter().sum();
        Some(total / self.latency_samples.len() as u32)
    }
}

/// A point-in-time health verdict for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub model: ModelId,
    pub healthy: bool,
    pub total_dispatches: u64,
    pub failure_rate: f64,
    pub hollow_rate: f64,
    pub active_rate_limit_hits: u32,
    pub mean_latency: Option<Duration>,
}

/// Tracks rolling success/failure/hollow/latency/rate-limit counters per
/// model and derives a healthy/unhealthy verdict worker selection can use
/// to deprioritize a flaky backend without removing it outright.
#[derive(Debug, Default)]
pub struct ModelHealthTracker {
    thresholds: HealthThresholds,
    counters: HashMap<ModelId, Counters>,
}

impl ModelHealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds, counters: HashMap::new() }
    }

    pub fn record_success(&mut self, model: &ModelId, latency: Duration) {
        let c = self.counters.entry(model.clone()).or_default();
        c.successes += 1;
        c.latency_samples.push_back(latency);
        if c.latency_samples.len() > MAX_LATENCY_SAMPLES {
            c.latency_samples.pop_front();
        }
    }

    pub fn record_failure(&mut self, model: &ModelId) {
        self.counters.entry(model.clone()).or_default().failures += 1;
    }

    /// A hollow completion counts toward `hollow_rate` and, like any
    /// other non-genuine completion, toward `failure_rate` too.
    pub fn record_hollow(&mut self, model: &ModelId) {
        let c = self.counters.entry(model.clone()).or_default();
        c.hollow += 1;
        c.failures += 1;
    }

    /// A quality-gate rejection claws back one recorded success (down to
    /// zero) and counts as a failure, so a model that keeps passing the
    /// hollow check but failing review doesn't look healthy.
    pub fn record_quality_rejection(&mut self, model: &ModelId) {
        let c = self.counters.entry(model.clone()).or_default();
        c.quality_rejections += 1;
        c.successes = c.successes.saturating_sub(1);
        c.failures += 1;
    }

    pub fn record_rate_limit(&mut self, model: &ModelId, now: std::time::Instant) {
        let c = self.counters.entry(model.clone()).or_default();
        c.prune_rate_limits(now);
        c.rate_limit_hits.push_back(now);
    }

    pub fn snapshot(&mut self, model: &ModelId, now: std::time::Instant) -> HealthSnapshot {
        let c = self.counters.entry(model.clone()).or_default();
        c.prune_rate_limits(now);
        let healthy = Self::thresholds_ok(&self.thresholds, c);
        HealthSnapshot {
            model: model.clone(),
            healthy,
            total_dispatches: c.total(),
            failure_rate: c.failure_rate(),
            hollow_rate: c.hollow_rate(),
            active_rate_limit_hits: c.rate_limit_hits.len() as u32,
            mean_latency: c.mean_latency(),
        }
    }

    fn thresholds_ok(thresholds: &HealthThresholds, c: &Counters) -> bool {
        if c.rate_limit_hits.len() as u32 >= thresholds.max_rate_limits_per_window {
            return false;
        }
        if c.quality_rejections as u32 >= thresholds.max_quality_rejections {
            return false;
        }
        if c.total() < thresholds.min_samples as u64 {
            return true;
        }
        if c.failure_rate() > thresholds.max_failure_rate {
            return false;
        }
        if c.hollow_rate() > thresholds.max_hollow_rate {
            return false;
        }
        true
    }

    /// `hollow / successes` for a model with no recorded successes is 0,
    /// i.e. an untested model is never deprioritized for hollowness.
    pub fn hollow_rate(&self, model: &ModelId) -> f64 {
        self.counters.get(model).map(Counters::hollow_rate).unwrap_or(0.0)
    }

    pub fn is_healthy(&mut self, model: &ModelId, now: std::time::Instant) -> bool {
        self.snapshot(model, now).healthy
    }
}
