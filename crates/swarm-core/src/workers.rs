//! Worker pool and model selection: capability routing first (falling
//! back to a capability-precedence table rather than failing outright),
//! then a healthy/unhealthy split, round-robin load spreading within the
//! eligible set, and hollow-rate deprioritization as a tie-break rather
//! than a hard exclusion.

use std::collections::HashMap;
use std::time::Instant;

use thiserror::Error;

use crate::health::ModelHealthTracker;
use crate::types::{ModelId, SubtaskType, WorkerSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerSelectionError {
    #[error("no worker is configured to handle subtask type {0}")]
    NoCapableWorker(SubtaskType),
}

/// A subtask type with no directly-capable worker falls back to the
/// closest related type rather than failing the dispatch outright. Never
/// invents a worker: if no configured worker handles any type in the
/// chain, selection still fails.
const CAPABILITY_PRECEDENCE: &[(SubtaskType, SubtaskType)] = &[
    (SubtaskType::Verify, SubtaskType::Test),
    (SubtaskType::Refactor, SubtaskType::Implement),
    (SubtaskType::Review, SubtaskType::Implement),
    (SubtaskType::Document, SubtaskType::Research),
];

fn precedence_fallback(subtask_type: SubtaskType) -> Option<SubtaskType> {
    CAPABILITY_PRECEDENCE.iter().find(|(from, _)| *from == subtask_type).map(|(_, to)| *to)
}

/// A configured fleet of workers plus a round-robin cursor per subtask
/// type, used to spread load evenly across equally-eligible workers.
pub struct WorkerPool {
    workers: Vec<WorkerSpec>,
    cursors: HashMap<SubtaskType, usize>,
}

impl WorkerPool {
    pub fn new(workers: Vec<WorkerSpec>) -> Self {
        Self { workers, cursors: HashMap::new() }
    }

    pub fn workers(&self) -> &[WorkerSpec] {
        &self.workers
    }

    fn capable(&self, subtask_type: SubtaskType) -> Vec<&WorkerSpec> {
        self.workers.iter().filter(|w| w.capabilities.contains(&subtask_type)).collect()
    }

    /// Capable workers for `subtask_type`, walking the capability
    /// precedence table when no worker directly declares it. The chain
    /// is followed until a non-empty set is found or it runs out.
    fn capable_with_fallback(&self, subtask_type: SubtaskType) -> Vec<&WorkerSpec> {
        let direct = self.capable(subtask_type);
        if !direct.is_empty() {
            return direct;
        }
        let mut next = precedence_fallback(subtask_type);
        let mut visited = vec![subtask_type];
        while let Some(candidate) = next {
            if visited.contains(&candidate) {
                break;
            }
            let workers = self.capable(candidate);
            if !workers.is_empty() {
                return workers;
            }
            visited.push(candidate);
            next = precedence_fallback(candidate);
        }
        Vec::new()
    }

    /// Select a worker for `subtask_type`.
    ///
    /// Order of preference: capability match (with precedence-table
    /// fallback) is mandatory; among capable workers, healthy ones are
    /// preferred over unhealthy ones, but an all-unhealthy capable set
    /// still degrades to round-robin over the unhealthy workers rather
    /// than failing outright (a flaky model is still strictly better than
    /// no dispatch at all). Within whichever set is chosen, workers with
    /// a meaningfully higher hollow rate (a gap of 0.15 or more) are
    /// pushed behind the rest; smaller differences are noise and don't
    /// reorder the round-robin sequence. `avoid_model` lets a caller doing
    /// model failover steer away from a model that just failed this task,
    /// without ever stranding the task if it's the only option.
    pub fn select_worker(
        &mut self,
        subtask_type: SubtaskType,
        health: &mut ModelHealthTracker,
        now: Instant,
        avoid_model: Option<&ModelId>,
    ) -> Result<WorkerSpec, WorkerSelectionError> {
        let capable = self.capable_with_fallback(subtask_type);
        if capable.is_empty() {
            return Err(WorkerSelectionError::NoCapableWorker(subtask_type));
        }

        let without_avoided: Vec<&WorkerSpec> = match avoid_model {
            Some(model) => {
                let filtered: Vec<&WorkerSpec> = capable.iter().copied().filter(|w| &w.model != model).collect();
                if filtered.is_empty() { capable } else { filtered }
            }
            None => capable,
        };

        let healthy: Vec<&WorkerSpec> = without_avoided.iter().copied().filter(|w| health.is_healthy(&w.model, now)).collect();

        let mut pool: Vec<&WorkerSpec> = if healthy.is_empty() { without_avoided } else { healthy };
        pool.sort_by(|a, b| {
            let hollow_a = health.hollow_rate(&a.model);
            let hollow_b = health.hollow_rate(&b.model);
            if hollow_a - hollow_b >= 0.15 {
                std::cmp::Ordering::Greater
            } else if hollow_b - hollow_a >= 0.15 {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let pool: Vec<WorkerSpec> = pool.into_iter().cloned().collect();
        let cursor = self.cursors.entry(subtask_type).or_insert(0);
        let idx = *cursor % pool.len();
        *cursor = cursor.wrapping_add(1);
        Ok(pool[idx].clone())
    }

    /// A different model than `failed_model` with the same capability,
    /// preferring a healthy one, or `None` if the configured set has no
    /// other worker for this capability. Never falls back to the
    /// precedence table and never invents an unconfigured model.
    pub fn select_alternative_model(
        &self,
        failed_model: &ModelId,
        subtask_type: SubtaskType,
        health: &mut ModelHealthTracker,
        now: Instant,
    ) -> Option<WorkerSpec> {
        let mut candidates: Vec<&WorkerSpec> = self.capable(subtask_type).into_iter().filter(|w| &w.model != failed_model).collect();
        candidates.sort_by_key(|w| !health.is_healthy(&w.model, now));
        candidates.first().map(|w| (*w).clone())
    }
}
