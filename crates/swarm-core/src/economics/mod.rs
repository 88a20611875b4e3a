//! Execution economics: incremental token/cost accounting, graduated
//! budget enforcement across every resource dimension the swarm can run
//! out of (tokens, cost, wall-clock duration, iteration count), and the
//! loop/phase trackers that feed its decisions.
//!
//! [`EconomicsManager`] owns a [`LoopDetector`] and a [`PhaseTracker`] by
//! value rather than reaching for them through a shared back-pointer --
//! every outward signal (a budget warning, a detected loop, a phase
//! change) goes out through one injected `emit` closure instead of a
//! trait object with a wide surface, so a caller can wire it to an
//! [`crate::events::EventBus`], a test-only `Vec`, or nothing at all.

pub mod loop_detect;
pub mod phase;
pub mod prompts;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::types::SubtaskId;
pub use loop_detect::{canonical_fingerprint, sha256_fingerprint, LoopDetector};
pub use phase::{InvalidPhaseTransition, Phase, PhaseTracker};

/// Whether the budget table enforces every resource dimension, or only
/// watches for doom loops and otherwise lets the run proceed regardless
/// of spend -- useful for an exploratory run where the operator would
/// rather eat the cost than have it cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    Strict,
    DoomloopOnly,
}

/// Configuration for the graduated budget table. Every dimension beyond
/// tokens is optional -- a caller that doesn't track cost or wall-clock
/// spend simply leaves those `None` and the table ignores them.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_tokens: u64,
    /// Fraction of `max_tokens` at which a soft warning begins.
    pub warning_threshold: f64,
    /// Fraction of `max_tokens` at which throttling begins.
    pub throttle_threshold: f64,
    pub extension_allowance_tokens: u64,
    pub max_extensions: u32,
    pub max_cost: Option<f64>,
    pub soft_cost_limit: Option<f64>,
    pub max_duration: Option<Duration>,
    pub soft_duration_limit: Option<Duration>,
    pub max_iterations: Option<u32>,
    pub target_iterations: Option<u32>,
    pub mode: BudgetMode,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2_000_000,
            warning_threshold: 0.7,
            throttle_threshold: 0.85,
            extension_allowance_tokens: 200_000,
            max_extensions: 2,
            max_cost: None,
            soft_cost_limit: None,
            max_duration: None,
            soft_duration_limit: None,
            max_iterations: None,
            target_iterations: None,
            mode: BudgetMode::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Continue,
    Warn(&'static str),
    Throttle(&'static str),
    GrantExtension { additional_tokens: u64 },
    Deny(&'static str),
    ForceComplete(&'static str),
}

type EmitFn = Box<dyn Fn(crate::events::Event) + Send + Sync>;

/// Owns token/cost/duration/iteration accounting plus the loop/phase
/// trackers, and runs the priority-ordered budget decision table.
pub struct EconomicsManager {
    budget: BudgetConfig,
    /// Last reported cumulative token total per task. Models report the
    /// full conversation's cumulative usage on every turn (the KV cache
    /// makes re-sending the whole prefix cheap but its token count is
    /// still included in the report), so only the delta since the last
    /// report is new spend -- summing raw per-call totals would double
    /// count every prior turn's prefix on every subsequent call.
    last_reported: HashMap<SubtaskId, u64>,
    tokens_used: u64,
    cost_used: f64,
    iterations_used: u32,
    started_at: Instant,
    extensions_granted: u32,
    warned: bool,
    exceeded: bool,
    loop_detector: LoopDetector,
    phase_tracker: PhaseTracker,
    emit: EmitFn,
}

impl EconomicsManager {
    pub fn new(budget: BudgetConfig, emit: EmitFn) -> Self {
        Self {
            budget,
            last_reported: HashMap::new(),
            tokens_used: 0,
            cost_used: 0.0,
            iterations_used: 0,
            started_at: Instant::now(),
            extensions_granted: 0,
            warned: false,
            exceeded: false,
            loop_detector: LoopDetector::default(),
            phase_tracker: PhaseTracker::new(),
            emit,
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    pub fn iterations_used(&self) -> u32 {
        self.iterations_used
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn token_ratio(&self) -> f64 {
        if self.budget.max_tokens == 0 {
            return 1.0;
        }
        self.tokens_used as f64 / self.budget.max_tokens as f64
    }

    fn cost_ratio(&self) -> Option<f64> {
        self.budget.max_cost.map(|max| if max <= 0.0 { 1.0 } else { self.cost_used / max })
    }

    fn duration_ratio(&self) -> Option<f64> {
        self.budget
            .max_duration
            .map(|max| if max.is_zero() { 1.0 } else { self.elapsed().as_secs_f64() / max.as_secs_f64() })
    }

    fn iteration_ratio(&self) -> Option<f64> {
        self.budget
            .max_iterations
            .map(|max| if max == 0 { 1.0 } else { self.iterations_used as f64 / max as f64 })
    }

    /// The governing ratio across every tracked dimension -- whichever
    /// resource is closest to (or past) exhaustion decides the band.
    pub fn percent_used(&self) -> f64 {
        [Some(self.token_ratio()), self.cost_ratio(), self.duration_ratio(), self.iteration_ratio()]
            .into_iter()
            .flatten()
            .fold(0.0, f64::max)
    }

    /// Record a task's cumulative reported token total and fold the
    /// incremental delta into the swarm-wide counter. Returns the delta.
    pub fn record_token_usage(&mut self, task: &SubtaskId, cumulative_total: u64) -> u64 {
        let last = *self.last_reported.get(task).unwrap_or(&0);
        let delta = cumulative_total.saturating_sub(last);
        self.last_reported.insert(task.clone(), cumulative_total.max(last));
        self.tokens_used += delta;
        self.check_threshold_crossings();
        delta
    }

    pub fn record_cost(&mut self, delta: f64) {
        self.cost_used += delta.max(0.0);
        self.check_threshold_crossings();
    }

    /// Count one more iteration (dispatch attempt) toward the swarm-wide
    /// iteration budget, distinct from any single task's retry count.
    pub fn record_iteration(&mut self) {
        self.iterations_used += 1;
        self.check_threshold_crossings();
    }

    /// Whether the configured target iteration count (a soft planning
    /// hint, not an enforcement limit) has been reached.
    pub fn reached_target_iterations(&self) -> bool {
        self.budget.target_iterations.is_some_and(|target| self.iterations_used >= target)
    }

    fn check_threshold_crossings(&mut self) {
        let pct = self.percent_used();
        if !self.warned && pct >= self.budget.warning_threshold {
            self.warned = true;
            (self.emit)(crate::events::Event::BudgetWarning { percent_used: pct, reason: prompts::MAX_STEPS_PROMPT.to_string() });
        }
        if !self.exceeded && pct >= 1.0 {
            self.exceeded = true;
            (self.emit)(crate::events::Event::BudgetExceeded { reason: "budget exhausted".to_string() });
        }
    }

    /// Feed an action (tool call name + normalized args, typically) into
    /// the loop detector and emit [`crate::events::Event::DoomLoopDetected`]
    /// the instant it first trips for this task.
    pub fn record_action(&mut self, task: &SubtaskId, action: &Value) -> bool {
        let now_looping = self.loop_detector.record(task, action);
        if now_looping {
            let fingerprint = canonical_fingerprint(action);
            (self.emit)(crate::events::Event::DoomLoopDetected {
                task_id: task.clone(),
                fingerprint: sha256_fingerprint(&fingerprint),
                global: false,
            });
        }
        now_looping
    }

    pub fn is_looping(&self, task: &SubtaskId) -> bool {
        self.loop_detector.is_looping(task)
    }

    pub fn reset_loop_state(&mut self, task: &SubtaskId) {
        self.loop_detector.reset(task);
    }

    pub fn phase_of(&self, task: &SubtaskId) -> Phase {
        self.phase_tracker.phase_of(task)
    }

    pub fn transition_phase(&mut self, task: &SubtaskId, to: Phase) -> Result<(), InvalidPhaseTransition> {
        let (from, to) = self.phase_tracker.transition(task, to)?;
        (self.emit)(crate::events::Event::PhaseTransition {
            task_id: task.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
        Ok(())
    }

    /// Record a tool call toward exploration-saturation tracking; emits
    /// [`crate::events::Event::ExplorationSaturation`] the instant it trips.
    pub fn record_tool_call(&mut self, task: &SubtaskId) {
        if self.phase_tracker.record_tool_call(task) {
            (self.emit)(crate::events::Event::ExplorationSaturation { task_id: task.clone() });
        }
    }

    /// Run the graduated, priority-ordered budget decision table.
    /// `global_doom_loop` lets the caller fold in a blackboard-wide loop
    /// verdict that spans workers, in addition to this task's own.
    pub fn evaluate_budget(&mut self, task: &SubtaskId, near_completion: bool, global_doom_loop: bool) -> BudgetDecision {
        let pct = self.percent_used();
        let phase = self.phase_of(task);
        let doom_looping = global_doom_loop || self.is_looping(task);
        let hard_exceeded = pct >= 1.0;
        let extensions_remaining = self.extensions_granted < self.budget.max_extensions;

        use Phase::{Acting, Exploring, Planning, Verifying};

        // 1: an active doom loop with budget already exhausted leaves
        // nothing left to spend even if we wanted to recover.
        if doom_looping && hard_exceeded {
            return BudgetDecision::ForceComplete("doom loop active and budget exhausted");
        }
        // 2: a doom loop alone dominates every other signal -- there is no
        // point spending more budget on a task that is not making progress.
        if doom_looping {
            return BudgetDecision::Deny("doom loop detected; halting dispatch until resolved");
        }

        // 3: doom-loop-only mode stops enforcing every other dimension
        // once the loop check has cleared.
        if self.budget.mode == BudgetMode::DoomloopOnly {
            return BudgetDecision::Continue;
        }

        // 4-6: hard budget exceeded, across whichever dimension governs.
        if hard_exceeded && near_completion && extensions_remaining {
            self.extensions_granted += 1;
            return BudgetDecision::GrantExtension { additional_tokens: self.budget.extension_allowance_tokens };
        }
        if hard_exceeded && near_completion && !extensions_remaining {
            return BudgetDecision::ForceComplete("near completion but extension allowance exhausted");
        }
        if hard_exceeded {
            return BudgetDecision::ForceComplete("hard budget exceeded with task not near completion");
        }

        // 7: an iteration cap is a hard count, not a ratio -- a task can
        // still be under every other ratio yet have run out of turns.
        if let Some(max_iterations) = self.budget.max_iterations {
            if self.iterations_used >= max_iterations && !near_completion {
                return BudgetDecision::ForceComplete("iteration cap reached with task not near completion");
            }
        }

        // 8-9: dimension-specific soft limits fire a warning independent
        // of the blended ratio, so a caller that cares specifically about
        // cost or wall-clock spend gets signal even while token usage is
        // still low.
        if let Some(soft_cost) = self.budget.soft_cost_limit {
            if self.cost_used >= soft_cost {
                return BudgetDecision::Warn("cost usage has crossed its soft limit");
            }
        }
        if let Some(soft_duration) = self.budget.soft_duration_limit {
            if self.elapsed() >= soft_duration {
                return BudgetDecision::Warn("wall-clock duration has crossed its soft limit");
            }
        }

        // 10-14: throttle band, split by phase and near-completion so work
        // already close to landing isn't interrupted mid-verification.
        if pct >= self.budget.throttle_threshold {
            if phase == Verifying && near_completion {
                return BudgetDecision::Continue;
            }
            if phase == Acting && near_completion {
                return BudgetDecision::Continue;
            }
            if phase == Exploring {
                return BudgetDecision::Throttle("exploration curtailed under budget pressure");
            }
            if phase == Planning {
                return BudgetDecision::Throttle("planning curtailed under budget pressure");
            }
            if phase == Acting {
                return BudgetDecision::Throttle("acting throttled, not yet near completion");
            }
            return BudgetDecision::Throttle("verification throttled");
        }

        // 15-16: warning band.
        if pct >= self.budget.warning_threshold {
            if phase == Exploring && !near_completion {
                return BudgetDecision::Warn("exploration continuing into elevated budget usage");
            }
            return BudgetDecision::Warn("budget usage elevated");
        }

        // 17: nothing to report.
        BudgetDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn manager_with_capture() -> (EconomicsManager, Arc<Mutex<Vec<crate::events::Event>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let manager = EconomicsManager::new(
            BudgetConfig { max_tokens: 1000, warning_threshold: 0.5, throttle_threshold: 0.8, ..Default::default() },
            Box::new(move |event| sink.lock().unwrap().push(event)),
        );
        (manager, captured)
    }

    #[test]
    fn incremental_accounting_avoids_double_counting_cumulative_reports() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        let d1 = manager.record_token_usage(&task, 100);
        let d2 = manager.record_token_usage(&task, 250);
        assert_eq!(d1, 100);
        assert_eq!(d2, 150);
        assert_eq!(manager.tokens_used(), 250);
    }

    #[test]
    fn multiple_tasks_sum_independently() {
        let (mut manager, _) = manager_with_capture();
        manager.record_token_usage(&SubtaskId::new("a"), 100);
        manager.record_token_usage(&SubtaskId::new("b"), 50);
        assert_eq!(manager.tokens_used(), 150);
    }

    #[test]
    fn warning_threshold_emits_exactly_once() {
        let (mut manager, captured) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 600);
        manager.record_token_usage(&task, 700);
        let events = captured.lock().unwrap();
        let warnings = events.iter().filter(|e| matches!(e, crate::events::Event::BudgetWarning { .. })).count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn budget_exceeded_with_near_completion_grants_extension() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 1100);
        let decision = manager.evaluate_budget(&task, true, false);
        assert_eq!(decision, BudgetDecision::GrantExtension { additional_tokens: manager.budget.extension_allowance_tokens });
    }

    #[test]
    fn budget_exceeded_without_near_completion_forces_completion() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 1100);
        let decision = manager.evaluate_budget(&task, false, false);
        assert!(matches!(decision, BudgetDecision::ForceComplete(_)));
    }

    #[test]
    fn extension_allowance_exhausts_after_max_extensions() {
        let (mut manager, _) = manager_with_capture();
        manager.budget.max_extensions = 1;
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 1100);
        let first = manager.evaluate_budget(&task, true, false);
        assert!(matches!(first, BudgetDecision::GrantExtension { .. }));
        let second = manager.evaluate_budget(&task, true, false);
        assert_eq!(second, BudgetDecision::ForceComplete("near completion but extension allowance exhausted"));
    }

    #[test]
    fn doom_loop_denies_dispatch_before_budget_exhausted() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        let action = serde_json::json!({"tool": "x"});
        manager.record_action(&task, &action);
        manager.record_action(&task, &action);
        manager.record_action(&task, &action);
        assert!(manager.is_looping(&task));
        let decision = manager.evaluate_budget(&task, false, false);
        assert_eq!(decision, BudgetDecision::Deny("doom loop detected; halting dispatch until resolved"));
    }

    #[test]
    fn global_doom_loop_flag_denies_even_when_local_detector_is_clean() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        assert!(!manager.is_looping(&task));
        let decision = manager.evaluate_budget(&task, false, true);
        assert_eq!(decision, BudgetDecision::Deny("doom loop detected; halting dispatch until resolved"));
    }

    #[test]
    fn doomloop_only_mode_ignores_token_exhaustion() {
        let (mut manager, _) = manager_with_capture();
        manager.budget.mode = BudgetMode::DoomloopOnly;
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 5000);
        assert_eq!(manager.evaluate_budget(&task, false, false), BudgetDecision::Continue);
    }

    #[test]
    fn iteration_cap_forces_completion_once_reached() {
        let (mut manager, _) = manager_with_capture();
        manager.budget.max_iterations = Some(2);
        let task = SubtaskId::new("t1");
        manager.record_iteration();
        manager.record_iteration();
        let decision = manager.evaluate_budget(&task, false, false);
        assert_eq!(decision, BudgetDecision::ForceComplete("iteration cap reached with task not near completion"));
    }

    #[test]
    fn cost_ratio_feeds_into_the_blended_percent_used() {
        let (mut manager, _) = manager_with_capture();
        manager.budget.max_cost = Some(10.0);
        manager.record_cost(11.0);
        let task = SubtaskId::new("t1");
        let decision = manager.evaluate_budget(&task, false, false);
        assert!(matches!(decision, BudgetDecision::ForceComplete(_)));
    }

    #[test]
    fn soft_duration_limit_warns_independent_of_token_ratio() {
        let (mut manager, _) = manager_with_capture();
        manager.budget.soft_duration_limit = Some(Duration::from_secs(0));
        let task = SubtaskId::new("t1");
        let decision = manager.evaluate_budget(&task, false, false);
        assert_eq!(decision, BudgetDecision::Warn("wall-clock duration has crossed its soft limit"));
    }

    #[test]
    fn throttle_band_allows_near_complete_verification_to_continue() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.transition_phase(&task, Phase::Acting).unwrap();
        manager.transition_phase(&task, Phase::Verifying).unwrap();
        manager.record_token_usage(&task, 850);
        let decision = manager.evaluate_budget(&task, true, false);
        assert_eq!(decision, BudgetDecision::Continue);
    }

    #[test]
    fn throttle_band_throttles_exploration() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 850);
        let decision = manager.evaluate_budget(&task, false, false);
        assert!(matches!(decision, BudgetDecision::Throttle(_)));
    }

    #[test]
    fn under_warning_threshold_continues() {
        let (mut manager, _) = manager_with_capture();
        let task = SubtaskId::new("t1");
        manager.record_token_usage(&task, 100);
        assert_eq!(manager.evaluate_budget(&task, false, false), BudgetDecision::Continue);
    }

    #[test]
    fn exploration_saturation_propagates_as_event() {
        let (mut manager, captured) = manager_with_capture();
        let task = SubtaskId::new("t1");
        for _ in 0..20 {
            manager.record_tool_call(&task);
        }
        let events = captured.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, crate::events::Event::ExplorationSaturation { .. })));
    }
}
