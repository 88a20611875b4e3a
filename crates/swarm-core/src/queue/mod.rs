//! Task queue & wave scheduler.
//!
//! Loads a decomposition into an arena-indexed DAG (a contiguous
//! `Vec<TaskRecord>` plus an id-to-index map built once at load), computes
//! wave assignments, serializes write-write file conflicts across waves,
//! and exposes ready-set views that respect dependencies, the
//! partial-dependency threshold, and wave ordering.
//!
//! Dependents/dependency edges are stored as arena indices rather than ids
//! so repeated ready-set computation never re-hashes a `SubtaskId`.

mod checkpoint;

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FailureMode, ModelId, PartialContext, Subtask, SubtaskId, TaskStatus};

pub use checkpoint::{QueueCheckpoint, TaskRecordSnapshot};

/// A write-write conflict between tasks over a named resource (typically a
/// file path). `strategy: None` defers to [`QueueConfig::file_conflict_strategy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub resource: String,
    pub tasks: Vec<SubtaskId>,
    pub strategy: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Serialize,
    Ignore,
}

/// The output of the decomposition step: a flat subtask list plus
/// advisory parallel groupings and detected resource conflicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Decomposition {
    pub subtasks: Vec<Subtask>,
    pub parallel_groups: Vec<Vec<SubtaskId>>,
    pub conflicts: Vec<Conflict>,
}

/// Queue-level configuration (the subset of [`crate::config::SwarmConfig`]
/// the scheduler needs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_dispatches_per_task: u32,
    pub partial_dependency_threshold: f64,
    pub file_conflict_strategy: ConflictStrategy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_dispatches_per_task: 3,
            partial_dependency_threshold: 0.5,
            file_conflict_strategy: ConflictStrategy::Serialize,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("cyclic dependency detected among subtasks: {0:?}")]
    CyclicDependency(Vec<SubtaskId>),
    #[error("unknown subtask id: {0}")]
    UnknownSubtask(SubtaskId),
    #[error("invalid state transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: SubtaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("attempts exhausted for {0}")]
    AttemptsExhausted(SubtaskId),
    #[error("partial_dependency_threshold must be in [0,1], got {0}")]
    InvalidThreshold(f64),
}

/// One row in the task arena: the immutable subtask plus its mutable
/// scheduling state and precomputed edge indices.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub subtask: Subtask,
    pub status: TaskStatus,
    pub wave: u32,
    pub attempts: u32,
    pub failure_mode: Option<FailureMode>,
    pub partial_context: Option<PartialContext>,
    pub dispatched_model: Option<ModelId>,
    dependency_idx: Vec<usize>,
    dependent_idx: Vec<usize>,
}

impl TaskRecord {
    fn is_terminal(&self, max_dispatches: u32) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Skipped => true,
            TaskStatus::Failed => self.attempts >= max_dispatches,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct TaskQueue {
    tasks: Vec<TaskRecord>,
    id_to_index: HashMap<SubtaskId, usize>,
    current_wave: u32,
    total_waves: u32,
    config: QueueConfig,
    decomposition_echo: Decomposition,
}

impl TaskQueue {
    /// Load a decomposition into the queue, assigning waves and applying
    /// file-conflict serialization. Rejects cyclic dependency graphs.
    pub fn load_from_decomposition(
        decomposition: Decomposition,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        if !(0.0..=1.0).contains(&config.partial_dependency_threshold) {
            return Err(QueueError::InvalidThreshold(config.partial_dependency_threshold));
        }

        let mut id_to_index = HashMap::with_capacity(decomposition.subtasks.len());
        for (idx, s) in decomposition.subtasks.iter().enumerate() {
            id_to_index.insert(s.id.clone(), idx);
        }

        // Resolve dependency/dependent edges as arena indices.
        let mut dependency_idx: Vec<Vec<usize>> = vec![Vec::new(); decomposition.subtasks.len()];
        let mut dependent_idx: Vec<Vec<usize>> = vec![Vec::new(); decomposition.subtasks.len()];
        for (idx, s) in decomposition.subtasks.iter().enumerate() {
            for dep in &s.dependencies {
                let dep_idx = *id_to_index
                    .get(dep)
                    .ok_or_else(|| QueueError::UnknownSubtask(dep.clone()))?;
                dependency_idx[idx].push(dep_idx);
                dependent_idx[dep_idx].push(idx);
            }
        }

        let waves = compute_waves(&decomposition.subtasks, &dependency_idx)?;

        let mut tasks: Vec<TaskRecord> = decomposition
            .subtasks
            .iter()
            .enumerate()
            .map(|(idx, s)| TaskRecord {
                subtask: s.clone(),
                status: TaskStatus::Pending,
                wave: waves[idx],
                attempts: 0,
                failure_mode: None,
                partial_context: None,
                dispatched_model: None,
                dependency_idx: dependency_idx[idx].clone(),
                dependent_idx: dependent_idx[idx].clone(),
            })
            .collect();

        apply_conflict_serialization(&mut tasks, &decomposition.conflicts, config.file_conflict_strategy);

        let total_waves = tasks.iter().map(|t| t.wave).max().map(|w| w + 1).unwrap_or(0);

        let mut queue = Self {
            tasks,
            id_to_index,
            current_wave: 0,
            total_waves,
            config,
            decomposition_echo: decomposition,
        };
        queue.promote_current_wave();
        Ok(queue)
    }

    pub fn total_waves(&self) -> u32 {
        self.total_waves
    }

    pub fn current_wave(&self) -> u32 {
        self.current_wave
    }

    pub fn task(&self, id: &SubtaskId) -> Option<&TaskRecord> {
        self.id_to_index.get(id).map(|&idx| &self.tasks[idx])
    }

    fn index_of(&self, id: &SubtaskId) -> Result<usize, QueueError> {
        self.id_to_index
            .get(id)
            .copied()
            .ok_or_else(|| QueueError::UnknownSubtask(id.clone()))
    }

    /// Transition `ready -> dispatched`, recording the chosen model and
    /// incrementing the attempt counter.
    pub fn mark_dispatched(&mut self, id: &SubtaskId, model: ModelId) -> Result<(), QueueError> {
        let idx = self.index_of(id)?;
        let task = &mut self.tasks[idx];
        if task.status != TaskStatus::Ready {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Dispatched,
            });
        }
        task.status = TaskStatus::Dispatched;
        task.dispatched_model = Some(model);
        task.attempts += 1;
        Ok(())
    }

    /// Transition `dispatched -> completed` and recompute readiness for
    /// every direct dependent.
    pub fn mark_completed(&mut self, id: &SubtaskId) -> Result<(), QueueError> {
        let idx = self.index_of(id)?;
        {
            let task = &mut self.tasks[idx];
            if task.status != TaskStatus::Dispatched {
                return Err(QueueError::InvalidTransition {
                    id: id.clone(),
                    from: task.status,
                    to: TaskStatus::Completed,
                });
            }
            task.status = TaskStatus::Completed;
        }
        self.repromote_dependents(idx);
        Ok(())
    }

    /// Transition `dispatched -> failed`. Returns `true` if the task is
    /// still eligible for another dispatch (`attempts < max_dispatches`).
    pub fn mark_failed(&mut self, id: &SubtaskId, failure_mode: FailureMode) -> Result<bool, QueueError> {
        let idx = self.index_of(id)?;
        let task = &mut self.tasks[idx];
        if task.status != TaskStatus::Dispatched {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        task.status = TaskStatus::Failed;
        task.failure_mode = Some(failure_mode);
        Ok(task.attempts < self.config.max_dispatches_per_task)
    }

    /// Fail a `ready` task outright with no possibility of retry -- used
    /// when no capable worker exists for its type, so no dispatch ever
    /// happens. Skips the `dispatched` state and consumes every
    /// remaining attempt immediately.
    pub fn fail_ready_task(&mut self, id: &SubtaskId, failure_mode: FailureMode) -> Result<(), QueueError> {
        let idx = self.index_of(id)?;
        let task = &mut self.tasks[idx];
        if task.status != TaskStatus::Ready {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        task.status = TaskStatus::Failed;
        task.failure_mode = Some(failure_mode);
        task.attempts = self.config.max_dispatches_per_task.max(task.attempts + 1);
        Ok(())
    }

    /// Re-enter a failed task into `ready` for another dispatch attempt.
    /// Errors if attempts are already exhausted.
    pub fn requeue(&mut self, id: &SubtaskId) -> Result<(), QueueError> {
        let idx = self.index_of(id)?;
        let task = &mut self.tasks[idx];
        if task.status != TaskStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Ready,
            });
        }
        if task.attempts >= self.config.max_dispatches_per_task {
            return Err(QueueError::AttemptsExhausted(id.clone()));
        }
        task.status = TaskStatus::Ready;
        Ok(())
    }

    /// Walk every transitive dependent of `id` and skip those whose
    /// effective partial-dependency threshold is no longer satisfiable.
    pub fn trigger_cascade_skip(&mut self, id: &SubtaskId) -> Result<Vec<SubtaskId>, QueueError> {
        let idx = self.index_of(id)?;
        let mut skipped = Vec::new();
        let mut queue: VecDeque<usize> = self.tasks[idx].dependent_idx.clone().into_iter().collect();
        let mut visited = std::collections::HashSet::new();

        while let Some(dep_idx) = queue.pop_front() {
            if !visited.insert(dep_idx) {
                continue;
            }
            if self.tasks[dep_idx].status != TaskStatus::Pending {
                continue;
            }
            if !self.all_deps_terminal(dep_idx) {
                continue;
            }
            let ratio = self.success_ratio(dep_idx);
            let threshold = self.effective_threshold(dep_idx);
            if ratio + f64::EPSILON < threshold {
                self.tasks[dep_idx].status = TaskStatus::Skipped;
                skipped.push(self.tasks[dep_idx].subtask.id.clone());
                queue.extend(self.tasks[dep_idx].dependent_idx.clone());
            } else {
                self.promote_if_ready(dep_idx);
            }
        }
        Ok(skipped)
    }

    /// Atomic step: advance to the next wave and promote any pending
    /// tasks whose wave now matches and whose dependencies are satisfied.
    pub fn advance_wave(&mut self) {
        self.current_wave += 1;
        self.promote_current_wave();
    }

    /// Tasks in the current wave with status `ready`, ordered
    /// `(complexity desc, dependency-count asc)` per the dispatch
    /// ordering guarantee.
    pub fn get_ready_tasks(&self) -> Vec<&TaskRecord> {
        let mut ready: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready && t.wave == self.current_wave)
            .collect();
        ready.sort_by(|a, b| {
            b.subtask
                .complexity
                .cmp(&a.subtask.complexity)
                .then_with(|| a.subtask.dependencies.len().cmp(&b.subtask.dependencies.len()))
        });
        ready
    }

    /// Every ready task across all waves, ordered `(wave asc, complexity desc)`.
    pub fn get_all_ready_tasks(&self) -> Vec<&TaskRecord> {
        let mut ready: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            a.wave
                .cmp(&b.wave)
                .then_with(|| b.subtask.complexity.cmp(&a.subtask.complexity))
        });
        ready
    }

    pub fn all_terminal_in_wave(&self, wave: u32) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.wave == wave)
            .all(|t| t.is_terminal(self.config.max_dispatches_per_task))
    }

    pub fn is_complete(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.is_terminal(self.config.max_dispatches_per_task))
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    fn all_deps_terminal(&self, idx: usize) -> bool {
        self.tasks[idx]
            .dependency_idx
            .iter()
            .all(|&d| self.tasks[d].is_terminal(self.config.max_dispatches_per_task))
    }

    fn success_ratio(&self, idx: usize) -> f64 {
        let deps = &self.tasks[idx].dependency_idx;
        if deps.is_empty() {
            return 1.0;
        }
        let succeeded = deps
            .iter()
            .filter(|&&d| self.tasks[d].status == TaskStatus::Completed)
            .count();
        succeeded as f64 / deps.len() as f64
    }

    /// `min(configured, min(leniency_threshold(d.failure_mode) for failed d in deps))`.
    fn effective_threshold(&self, idx: usize) -> f64 {
        let mut threshold = self.config.partial_dependency_threshold;
        for &d in &self.tasks[idx].dependency_idx {
            let dep = &self.tasks[d];
            let lenient = match dep.status {
                TaskStatus::Failed => dep.failure_mode.map(FailureMode::leniency_threshold),
                TaskStatus::Skipped => Some(FailureMode::Cascade.leniency_threshold()),
                _ => None,
            };
            if let Some(l) = lenient {
                threshold = threshold.min(l);
            }
        }
        threshold
    }

    fn build_partial_context(&self, idx: usize) -> Option<PartialContext> {
        let deps = &self.tasks[idx].dependency_idx;
        if deps.is_empty() {
            return None;
        }
        let mut ctx = PartialContext::default();
        let mut any_failed = false;
        for &d in deps {
            let dep = &self.tasks[d];
            match dep.status {
                TaskStatus::Completed => ctx.succeeded.push(dep.subtask.id.clone()),
                TaskStatus::Failed => {
                    any_failed = true;
                    ctx.failed
                        .push((dep.subtask.id.clone(), dep.failure_mode.unwrap_or(FailureMode::Error)));
                }
                TaskStatus::Skipped => {
                    any_failed = true;
                    ctx.failed.push((dep.subtask.id.clone(), FailureMode::Cascade));
                }
                _ => {}
            }
        }
        any_failed.then_some(ctx)
    }

    fn promote_current_wave(&mut self) {
        let wave = self.current_wave;
        let candidates: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending && t.wave == wave)
            .map(|(idx, _)| idx)
            .collect();
        for idx in candidates {
            self.promote_if_ready(idx);
        }
    }

    fn promote_if_ready(&mut self, idx: usize) {
        if self.tasks[idx].status != TaskStatus::Pending {
            return;
        }
        if !self.all_deps_terminal(idx) {
            return;
        }
        let ratio = self.success_ratio(idx);
        let threshold = self.effective_threshold(idx);
        if ratio + f64::EPSILON >= threshold {
            let ctx = self.build_partial_context(idx);
            self.tasks[idx].status = TaskStatus::Ready;
            self.tasks[idx].partial_context = ctx;
        } else {
            self.tasks[idx].status = TaskStatus::Skipped;
            let dependents = self.tasks[idx].dependent_idx.clone();
            for d in dependents {
                self.promote_if_ready(d);
            }
        }
    }

    fn repromote_dependents(&mut self, idx: usize) {
        let dependents = self.tasks[idx].dependent_idx.clone();
        for d in dependents {
            self.promote_if_ready(d);
        }
    }
}

/// Kahn's-algorithm-style topological wave assignment: `wave(s) = 1 +
/// max(wave(d) for d in deps(s))`, roots at wave 0. Detects cycles by
/// comparing the number of resolved nodes against the total.
fn compute_waves(subtasks: &[Subtask], dependency_idx: &[Vec<usize>]) -> Result<Vec<u32>, QueueError> {
    let n = subtasks.len();
    let mut waves = vec![None; n];
    let mut resolved = 0usize;
    let mut changed = true;

    while changed && resolved < n {
        changed = false;
        for idx in 0..n {
            if waves[idx].is_some() {
                continue;
            }
            let deps = &dependency_idx[idx];
            if deps.iter().all(|&d| waves[d].is_some()) {
                let w = deps.iter().map(|&d| waves[d].unwrap() + 1).max().unwrap_or(0);
                waves[idx] = Some(w);
                resolved += 1;
                changed = true;
            }
        }
    }

    if resolved < n {
        let cycle = (0..n)
            .filter(|&idx| waves[idx].is_none())
            .map(|idx| subtasks[idx].id.clone())
            .collect();
        return Err(QueueError::CyclicDependency(cycle));
    }

    Ok(waves.into_iter().map(|w| w.unwrap()).collect())
}

/// Chain write-write conflicts across successive waves in declaration
/// order, then propagate the bump forward through dependency edges so no
/// dependent ends up scheduled before (or alongside) its bumped parent.
fn apply_conflict_serialization(tasks: &mut [TaskRecord], conflicts: &[Conflict], default_strategy: ConflictStrategy) {
    let id_to_index: HashMap<SubtaskId, usize> = tasks
        .iter()
        .enumerate()
        .map(|(idx, t)| (t.subtask.id.clone(), idx))
        .collect();

    for conflict in conflicts {
        let strategy = conflict.strategy.unwrap_or(default_strategy);
        if strategy != ConflictStrategy::Serialize {
            continue;
        }
        let mut prev_idx: Option<usize> = None;
        for task_id in &conflict.tasks {
            let Some(&idx) = id_to_index.get(task_id) else { continue };
            if let Some(prev) = prev_idx {
                let min_wave = tasks[prev].wave + 1;
                if tasks[idx].wave < min_wave {
                    bump_wave(tasks, idx, min_wave);
                }
            }
            prev_idx = Some(idx);
        }
    }
}

fn bump_wave(tasks: &mut [TaskRecord], idx: usize, new_wave: u32) {
    if tasks[idx].wave >= new_wave {
        return;
    }
    tasks[idx].wave = new_wave;
    let dependents = tasks[idx].dependent_idx.clone();
    for d in dependents {
        let min_wave = new_wave + 1;
        if tasks[d].wave < min_wave {
            bump_wave(tasks, d, min_wave);
        }
    }
}
