//! Shared state visible across every worker in a swarm run: findings
//! other tasks should know about, exclusive claims over resources the
//! static conflict graph didn't anticipate, and a registry of action
//! fingerprints used to detect a doom loop spanning more than one task.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::SubtaskId;

/// A global doom loop requires the same fingerprint to recur at least
/// this many times, contributed by at least two distinct tasks -- a
/// single flaky worker repeating itself is a per-task concern, not a
/// swarm-wide one.
const DEFAULT_GLOBAL_REPEAT_THRESHOLD: u32 = 3;

/// A discovery one task wants visible to the rest of the swarm --
/// typically surfaced to newly-dispatched tasks as extra context.
#[derive(Debug, Clone)]
pub struct Finding {
    pub task_id: SubtaskId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub confidence: f64,
    pub related_files: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("resource {resource} is already exclusively claimed by {holder}")]
    AlreadyClaimed { resource: String, holder: SubtaskId },
    #[error("{task_id} does not hold a claim on {resource}")]
    NotHeld { resource: String, task_id: SubtaskId },
}

#[derive(Debug, Default)]
struct GlobalFingerprintEntry {
    count: u32,
    workers: HashSet<SubtaskId>,
}

/// Shared findings, resource claims, and cross-worker loop fingerprints.
/// Every method takes `&mut self`; callers are expected to hold it
/// behind a `tokio::sync::Mutex` when shared across tasks.
pub struct Blackboard {
    findings: Vec<Finding>,
    claims: HashMap<String, SubtaskId>,
    global_fingerprints: HashMap<String, GlobalFingerprintEntry>,
    global_doom_loop_tasks: HashSet<SubtaskId>,
    global_repeat_threshold: u32,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self {
            findings: Vec::new(),
            claims: HashMap::new(),
            global_fingerprints: HashMap::new(),
            global_doom_loop_tasks: HashSet::new(),
            global_repeat_threshold: DEFAULT_GLOBAL_REPEAT_THRESHOLD,
        }
    }

    pub fn with_global_repeat_threshold(mut self, threshold: u32) -> Self {
        self.global_repeat_threshold = threshold.max(1);
        self
    }

    pub fn post_finding(&mut self, task_id: SubtaskId, content: impl Into<String>, now: DateTime<Utc>) {
        self.post_finding_with_detail(task_id, content, now, 1.0, Vec::new());
    }

    pub fn post_finding_with_detail(
        &mut self,
        task_id: SubtaskId,
        content: impl Into<String>,
        now: DateTime<Utc>,
        confidence: f64,
        related_files: Vec<String>,
    ) {
        self.findings.push(Finding { task_id, content: content.into(), created_at: now, confidence, related_files });
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn findings_excluding(&self, task_id: &SubtaskId) -> Vec<&Finding> {
        self.findings.iter().filter(|f| &f.task_id != task_id).collect()
    }

    /// Exclusively claim `resource` for `task_id`. Idempotent for the
    /// current holder; fails for anyone else while the claim is held.
    pub fn claim(&mut self, resource: impl Into<String>, task_id: SubtaskId) -> Result<(), ClaimError> {
        let resource = resource.into();
        match self.claims.get(&resource) {
            Some(holder) if holder != &task_id => {
                Err(ClaimError::AlreadyClaimed { resource, holder: holder.clone() })
            }
            _ => {
                self.claims.insert(resource, task_id);
                Ok(())
            }
        }
    }

    pub fn release(&mut self, resource: &str, task_id: &SubtaskId) -> Result<(), ClaimError> {
        match self.claims.get(resource) {
            Some(holder) if holder == task_id => {
                self.claims.remove(resource);
                Ok(())
            }
            _ => Err(ClaimError::NotHeld { resource: resource.to_string(), task_id: task_id.clone() }),
        }
    }

    pub fn is_claimed(&self, resource: &str) -> bool {
        self.claims.contains_key(resource)
    }

    /// Record a SHA-256 action fingerprint on the shared registry.
    /// Returns `true` once the fingerprint has recurred at least
    /// `global_repeat_threshold` times across at least two distinct
    /// tasks -- a single worker repeating itself is local noise, not
    /// the cross-worker doom loop signal this is meant to catch.
    pub fn record_global_fingerprint(&mut self, fingerprint: String, task_id: SubtaskId) -> bool {
        let entry = self.global_fingerprints.entry(fingerprint).or_default();
        entry.count += 1;
        entry.workers.insert(task_id.clone());
        let tripped = entry.count >= self.global_repeat_threshold && entry.workers.len() >= 2;
        if tripped {
            for worker in &entry.workers {
                self.global_doom_loop_tasks.insert(worker.clone());
            }
        }
        tripped
    }

    /// Whether `task_id` has been implicated in a tripped global doom
    /// loop fingerprint -- sticky once tripped, since the condition that
    /// caused it does not retroactively become untrue.
    pub fn is_global_doom_loop(&self, task_id: &SubtaskId) -> bool {
        self.global_doom_loop_tasks.contains(task_id)
    }

    pub fn claimed_resources(&self) -> HashSet<&str> {
        self.claims.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_excluding_filters_own_task() {
        let mut board = Blackboard::new();
        let now = Utc::now();
        board.post_finding(SubtaskId::new("a"), "found X", now);
        board.post_finding(SubtaskId::new("b"), "found Y", now);
        let visible = board.findings_excluding(&SubtaskId::new("a"));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "found Y");
    }

    #[test]
    fn claim_is_exclusive_across_tasks() {
        let mut board = Blackboard::new();
        board.claim("src/lib.rs", SubtaskId::new("a")).unwrap();
        let err = board.claim("src/lib.rs", SubtaskId::new("b")).unwrap_err();
        assert_eq!(err, ClaimError::AlreadyClaimed { resource: "src/lib.rs".into(), holder: SubtaskId::new("a") });
    }

    #[test]
    fn claim_is_idempotent_for_current_holder() {
        let mut board = Blackboard::new();
        board.claim("src/lib.rs", SubtaskId::new("a")).unwrap();
        board.claim("src/lib.rs", SubtaskId::new("a")).unwrap();
    }

    #[test]
    fn release_frees_resource_for_others() {
        let mut board = Blackboard::new();
        board.claim("src/lib.rs", SubtaskId::new("a")).unwrap();
        board.release("src/lib.rs", &SubtaskId::new("a")).unwrap();
        board.claim("src/lib.rs", SubtaskId::new("b")).unwrap();
    }

    #[test]
    fn release_by_non_holder_fails() {
        let mut board = Blackboard::new();
        board.claim("src/lib.rs", SubtaskId::new("a")).unwrap();
        let err = board.release("src/lib.rs", &SubtaskId::new("b")).unwrap_err();
        assert_eq!(err, ClaimError::NotHeld { resource: "src/lib.rs".into(), task_id: SubtaskId::new("b") });
    }

    #[test]
    fn single_task_repeating_its_own_fingerprint_never_trips_global_loop() {
        let mut board = Blackboard::new().with_global_repeat_threshold(3);
        for _ in 0..10 {
            assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("a")));
        }
        assert!(!board.is_global_doom_loop(&SubtaskId::new("a")));
    }

    #[test]
    fn two_tasks_below_count_threshold_do_not_trip_global_loop() {
        let mut board = Blackboard::new().with_global_repeat_threshold(3);
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("a")));
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("b")));
    }

    #[test]
    fn two_distinct_tasks_at_or_above_threshold_trip_global_loop() {
        let mut board = Blackboard::new().with_global_repeat_threshold(3);
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("a")));
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("b")));
        assert!(board.record_global_fingerprint("fp1".into(), SubtaskId::new("a")));
        assert!(board.is_global_doom_loop(&SubtaskId::new("a")));
        assert!(board.is_global_doom_loop(&SubtaskId::new("b")));
    }

    #[test]
    fn distinct_fingerprints_do_not_accumulate_together() {
        let mut board = Blackboard::new().with_global_repeat_threshold(3);
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("a")));
        assert!(!board.record_global_fingerprint("fp2".into(), SubtaskId::new("b")));
        assert!(!board.record_global_fingerprint("fp1".into(), SubtaskId::new("b")));
    }
}
