//! Doom-loop detection via canonical action fingerprinting.
//!
//! An "action" is whatever shape the caller wants to dedupe on -- a tool
//! name plus its normalized arguments is the common case. Fingerprints
//! are computed over a canonical (sorted-key) JSON encoding so semantically
//! identical calls collapse to the same string regardless of field order.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::SubtaskId;

const DEFAULT_WINDOW: usize = 8;
const DEFAULT_REPEAT_THRESHOLD: u32 = 3;

/// Canonicalize a JSON value by recursively sorting object keys, then
/// serialize. Two values that are structurally equal but differ in key
/// order or whitespace fingerprint identically.
pub fn canonical_fingerprint(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hash a fingerprint for cross-worker comparison on a shared blackboard,
/// where carrying the raw JSON around is wasteful and leaks task content
/// into a structure every worker can read.
pub fn sha256_fingerprint(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

struct TaskHistory {
    recent: VecDeque<String>,
    counts: HashMap<String, u32>,
}

impl TaskHistory {
    fn new() -> Self {
        Self { recent: VecDeque::new(), counts: HashMap::new() }
    }
}

/// Tracks recent action fingerprints per task and flags a doom loop when
/// the same fingerprint recurs past a threshold within a bounded window.
pub struct LoopDetector {
    window: usize,
    repeat_threshold: u32,
    history: HashMap<SubtaskId, TaskHistory>,
}

impl LoopDetector {
    pub fn new(window: usize, repeat_threshold: u32) -> Self {
        Self { window, repeat_threshold, history: HashMap::new() }
    }

    /// Record an action for `task` and return `true` if this recording
    /// pushed the task's repeat count for that fingerprint past the
    /// threshold (i.e. a doom loop is now active).
    pub fn record(&mut self, task: &SubtaskId, action: &Value) -> bool {
        let fingerprint = canonical_fingerprint(action);
        let history = self.history.entry(task.clone()).or_insert_with(TaskHistory::new);

        history.recent.push_back(fingerprint.clone());
        *history.counts.entry(fingerprint.clone()).or_insert(0) += 1;

        if history.recent.len() > self.window {
            if let Some(evicted) = history.recent.pop_front() {
                if let Some(count) = history.counts.get_mut(&evicted) {
                    *count -= 1;
                    if *count == 0 {
                        history.counts.remove(&evicted);
                    }
                }
            }
        }

        history.counts.get(&fingerprint).copied().unwrap_or(0) >= self.repeat_threshold
    }

    pub fn is_looping(&self, task: &SubtaskId) -> bool {
        self.history
            .get(task)
            .map(|h| h.counts.values().any(|&c| c >= self.repeat_threshold))
            .unwrap_or(false)
    }

    pub fn reset(&mut self, task: &SubtaskId) {
        self.history.remove(task);
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_REPEAT_THRESHOLD)
    }
}
