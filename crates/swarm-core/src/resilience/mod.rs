//! Resilience layer: detects a completion that claims success without
//! doing the work (hollow completion, or a future-intent statement
//! standing in for an executed action) and decides how to recover --
//! split the task smaller, accept a degraded result with a caveat, or
//! treat it as a genuine failure. A flagged completion with retries
//! still on the table is simply retried; the recovery strategies below
//! only decide a task's *final* disposition once attempts are exhausted.

use std::sync::LazyLock;

use regex::Regex;

use crate::events::ResilienceStrategy;
use crate::types::{Subtask, SubtaskType};

static COMPLETION_CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(done|complete|completed|finished|implemented|fixed|resolved|all set)\b").unwrap()
});

static FUTURE_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(i will|i'll|next,? i|going to|planning to|let me now|i plan to)\b").unwrap()
});

/// Language admitting the task wasn't actually finished, surfacing even
/// when the response is otherwise confidently worded.
static FAILURE_ADMISSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(unable to|couldn't|could not|wasn't able to|was not able to|failed to (complete|finish|implement))\b").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub struct HollowDetectionResult {
    pub hollow: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Tasks at or above this complexity are worth splitting rather than
    /// just accepting a degraded result.
    pub micro_decompose_min_complexity: u8,
    /// Minimum tool calls (or artifacts found) to treat a hollow-flagged
    /// completion as partially trustworthy instead of a clean failure.
    pub degraded_acceptance_min_tool_calls: i64,
    /// Below this response length, a zero-tool-call completion is hollow
    /// regardless of its wording.
    pub hollow_output_threshold: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self { micro_decompose_min_complexity: 6, degraded_acceptance_min_tool_calls: 1, hollow_output_threshold: 40 }
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceOutcome {
    pub strategy: ResilienceStrategy,
    pub succeeded: bool,
    pub reason: String,
    pub artifacts_found: bool,
    pub tool_calls: i64,
    pub replacement_subtasks: Vec<Subtask>,
    pub caveat: Option<String>,
    /// `true` when attempts remain and the caller should simply requeue
    /// the task rather than treat this outcome as its final disposition.
    pub retry: bool,
}

pub struct ResilienceEngine {
    config: ResilienceConfig,
}

impl ResilienceEngine {
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config }
    }

    /// A completion is hollow when either no tool call ran and the
    /// response is suspiciously short, or the response itself admits the
    /// task wasn't actually finished despite nominally succeeding.
    pub fn detect_hollow(&self, content: &str, tool_calls: i64, artifacts_found: bool) -> HollowDetectionResult {
        if tool_calls == 0 && !artifacts_found && content.len() < self.config.hollow_output_threshold {
            return HollowDetectionResult {
                hollow: true,
                reason: Some(format!(
                    "no tool call ran and the response is only {} characters, under the {}-character hollow threshold",
                    content.len(),
                    self.config.hollow_output_threshold
                )),
            };
        }
        if FAILURE_ADMISSION_RE.is_match(content) {
            return HollowDetectionResult {
                hollow: true,
                reason: Some("response admits the task was not actually completed".to_string()),
            };
        }
        if COMPLETION_CLAIM_RE.is_match(content) && tool_calls == 0 && !artifacts_found {
            return HollowDetectionResult {
                hollow: true,
                reason: Some("response claims completion but no tool call ran and no artifact was produced".to_string()),
            };
        }
        HollowDetectionResult { hollow: false, reason: None }
    }

    /// A future-intent statement ("I will now...") presented as the
    /// final turn means the described action never actually happened.
    pub fn detect_future_intent(&self, content: &str) -> bool {
        FUTURE_INTENT_RE.is_match(content)
    }

    /// Decide how to handle a task whose completion looked suspicious.
    /// Returns `None`-strategy, `succeeded: true` outcomes for genuine
    /// completions too, so callers can treat this as the single entry
    /// point for post-completion triage. While attempts remain,
    /// suspicious completions come back with `retry: true` and no
    /// strategy decision; the recovery strategies below only fire once
    /// `attempts >= max_dispatches`.
    pub fn decide(
        &self,
        task: &Subtask,
        content: &str,
        tool_calls: i64,
        artifacts_found: bool,
        attempts: u32,
        max_dispatches: u32,
    ) -> ResilienceOutcome {
        let hollow = self.detect_hollow(content, tool_calls, artifacts_found);
        let future_intent = self.detect_future_intent(content);

        if !hollow.hollow && !future_intent {
            return ResilienceOutcome {
                strategy: ResilienceStrategy::None,
                succeeded: true,
                reason: "completion looks genuine".to_string(),
                artifacts_found,
                tool_calls,
                replacement_subtasks: Vec::new(),
                caveat: None,
                retry: false,
            };
        }

        let reason = hollow
            .reason
            .clone()
            .unwrap_or_else(|| "response describes a future action instead of executing it".to_string());

        if attempts < max_dispatches {
            return ResilienceOutcome {
                strategy: ResilienceStrategy::None,
                succeeded: false,
                reason,
                artifacts_found,
                tool_calls,
                replacement_subtasks: Vec::new(),
                caveat: None,
                retry: true,
            };
        }

        if task.complexity >= self.config.micro_decompose_min_complexity {
            return ResilienceOutcome {
                strategy: ResilienceStrategy::MicroDecompose,
                succeeded: false,
                reason,
                artifacts_found,
                tool_calls,
                replacement_subtasks: micro_decompose(task),
                caveat: None,
                retry: false,
            };
        }

        if tool_calls >= self.config.degraded_acceptance_min_tool_calls || artifacts_found {
            return ResilienceOutcome {
                strategy: ResilienceStrategy::DegradedAcceptance,
                succeeded: true,
                reason: reason.clone(),
                artifacts_found,
                tool_calls,
                replacement_subtasks: Vec::new(),
                caveat: Some(format!("accepted with reduced confidence: {reason}")),
                retry: false,
            };
        }

        ResilienceOutcome {
            strategy: ResilienceStrategy::None,
            succeeded: false,
            reason,
            artifacts_found,
            tool_calls,
            replacement_subtasks: Vec::new(),
            caveat: None,
            retry: false,
        }
    }
}

impl Default for ResilienceEngine {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

/// Split a suspiciously-completed task into a smaller retry plus a
/// dedicated verification pass. The caller is responsible for splicing
/// these into the queue in place of the original.
fn micro_decompose(task: &Subtask) -> Vec<Subtask> {
    let retry = Subtask::new(
        format!("{}-retry", task.id),
        format!("Retry with a narrower scope: {}", task.description),
        task.task_type,
    )
    .with_complexity(task.complexity.saturating_sub(2).max(1))
    .with_files(task.relevant_files.clone());

    let verify = Subtask::new(
        format!("{}-verify", task.id),
        format!("Verify the result of: {}", task.description),
        SubtaskType::Verify,
    )
    .with_complexity(2)
    .depends_on([retry.id.clone()]);

    vec![retry, verify]
}
