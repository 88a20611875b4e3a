//! Per-task phase tracking: exploring -> planning -> acting -> verifying,
//! with saturation detection when a task lingers in exploring without
//! producing a plan.

use std::collections::HashMap;
use std::time::Instant;

use crate::types::SubtaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Exploring,
    Planning,
    Acting,
    Verifying,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exploring => "exploring",
            Self::Planning => "planning",
            Self::Acting => "acting",
            Self::Verifying => "verifying",
        }
    }

    /// Whether `to` is a legal forward (or lateral) transition from
    /// `self`. Tasks may regress from verifying back to acting (a failed
    /// check sends them back to fix something) but may never jump
    /// backward past that -- re-exploring mid-task is a different task.
    fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Exploring, Planning)
                | (Exploring, Acting)
                | (Planning, Acting)
                | (Acting, Verifying)
                | (Verifying, Acting)
                | (Verifying, Verifying)
                | (Acting, Acting)
                | (Exploring, Exploring)
                | (Planning, Planning)
        )
    }
}

struct PhaseState {
    phase: Phase,
    entered_at: Instant,
    exploring_tool_calls: u32,
    saturated: bool,
}

/// The saturation threshold: this many tool calls spent in `Exploring`
/// without advancing to `Planning` or `Acting` is treated as the task
/// failing to converge on a plan.
const EXPLORATION_SATURATION_CALLS: u32 = 12;

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidPhaseTransition {
    pub from: Phase,
    pub to: Phase,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracks the current phase of every in-flight task and whether it has
/// saturated in exploration.
pub struct PhaseTracker {
    states: HashMap<SubtaskId, PhaseState>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self { states: HashMap::new() }
    }

    pub fn phase_of(&self, task: &SubtaskId) -> Phase {
        self.states.get(task).map(|s| s.phase).unwrap_or(Phase::Exploring)
    }

    /// Register a task entering the tracker fresh (always starts in
    /// `Exploring`).
    pub fn start(&mut self, task: &SubtaskId) {
        self.states.entry(task.clone()).or_insert_with(|| PhaseState {
            phase: Phase::Exploring,
            entered_at: Instant::now(),
            exploring_tool_calls: 0,
            saturated: false,
        });
    }

    /// Record a tool call against the task's current phase, and return
    /// `true` the instant this call causes exploration saturation
    /// (fires exactly once per task).
    pub fn record_tool_call(&mut self, task: &SubtaskId) -> bool {
        self.start(task);
        let state = self.states.get_mut(task).expect("start() just inserted it");
        if state.phase != Phase::Exploring || state.saturated {
            return false;
        }
        state.exploring_tool_calls += 1;
        if state.exploring_tool_calls >= EXPLORATION_SATURATION_CALLS {
            state.saturated = true;
            return true;
        }
        false
    }

    pub fn transition(&mut self, task: &SubtaskId, to: Phase) -> Result<(Phase, Phase), InvalidPhaseTransition> {
        self.start(task);
        let state = self.states.get_mut(task).expect("start() just inserted it");
        let from = state.phase;
        if !from.can_transition_to(to) {
            return Err(InvalidPhaseTransition { from, to });
        }
        state.phase = to;
        state.entered_at = Instant::now();
        if to != Phase::Exploring {
            state.exploring_tool_calls = 0;
        }
        Ok((from, to))
    }

    pub fn time_in_phase(&self, task: &SubtaskId) -> Option<std::time::Duration> {
        self.states.get(task).map(|s| s.entered_at.elapsed())
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_exploring() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        tracker.start(&task);
        assert_eq!(tracker.phase_of(&task), Phase::Exploring);
    }

    #[test]
    fn legal_forward_transitions_succeed() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        tracker.transition(&task, Phase::Planning).unwrap();
        tracker.transition(&task, Phase::Acting).unwrap();
        tracker.transition(&task, Phase::Verifying).unwrap();
        assert_eq!(tracker.phase_of(&task), Phase::Verifying);
    }

    #[test]
    fn verifying_may_regress_to_acting() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        tracker.transition(&task, Phase::Acting).unwrap();
        tracker.transition(&task, Phase::Verifying).unwrap();
        tracker.transition(&task, Phase::Acting).unwrap();
        assert_eq!(tracker.phase_of(&task), Phase::Acting);
    }

    #[test]
    fn acting_cannot_regress_to_exploring() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        tracker.transition(&task, Phase::Acting).unwrap();
        let err = tracker.transition(&task, Phase::Exploring).unwrap_err();
        assert_eq!(err, InvalidPhaseTransition { from: Phase::Acting, to: Phase::Exploring });
    }

    #[test]
    fn exploration_saturation_fires_once_at_threshold() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        let mut fired = 0;
        for _ in 0..20 {
            if tracker.record_tool_call(&task) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn transitioning_out_of_exploring_stops_counting_tool_calls() {
        let mut tracker = PhaseTracker::new();
        let task = SubtaskId::new("t1");
        for _ in 0..5 {
            tracker.record_tool_call(&task);
        }
        tracker.transition(&task, Phase::Planning).unwrap();
        let mut fired = false;
        for _ in 0..20 {
            if tracker.record_tool_call(&task) {
                fired = true;
            }
        }
        assert!(!fired, "tool calls made after leaving exploring must not count toward saturation");
    }
}
