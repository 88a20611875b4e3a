//! Shared test fakes for swarm-core's own tests and for downstream
//! integration tests: a scripted [`Provider`], a recording [`Tool`], a
//! manually-advanced clock for health/rate-limit windows, and a handful
//! of builders that save repeating `Subtask::new(...).with_complexity(...)`
//! boilerplate across test modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use swarm_core::provider::{ChatOptions, ChatResponse, Message, Provider, StopReason, Tool, Usage};
use swarm_core::queue::Decomposition;
use swarm_core::types::{ModelId, Subtask, SubtaskId, SubtaskType, WorkerSpec};

/// A provider that plays back a fixed script of responses, one per
/// call, repeating the last entry once the script is exhausted. Useful
/// for driving a dispatch loop through a specific sequence of hollow,
/// looping, or genuine completions without a network call.
pub struct ScriptedProvider {
    model: ModelId,
    context_window: u32,
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    last: Mutex<Option<ChatResponse>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<ModelId>, responses: Vec<ChatResponse>) -> Self {
        Self {
            model: model.into(),
            context_window: 200_000,
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// A provider whose every call fails with `message`, for exercising
    /// retry and cascade-skip paths.
    pub fn failing(model: impl Into<ModelId>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            model: model.into(),
            context_window: 200_000,
            script: Mutex::new(VecDeque::from([Err(anyhow::anyhow!(message))])),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn model(&self) -> &ModelId {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn chat(&self, _messages: &[Message], _options: &ChatOptions) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => {
                *self.last.lock().unwrap() = Some(response.clone());
                Ok(response)
            }
            Some(Err(err)) => Err(err),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("scripted provider has no responses queued")),
        }
    }
}

/// Build a plain, non-hollow completion: some tool calls, modest token
/// usage, no fuss.
pub fn genuine_completion(content: impl Into<String>, tool_calls: i64, cumulative_tokens: u64) -> ChatResponse {
    ChatResponse {
        content: content.into(),
        tool_calls: (0..tool_calls)
            .map(|i| swarm_core::provider::ToolCall { name: format!("tool_{i}"), arguments: Value::Null })
            .collect(),
        usage: Usage { prompt_tokens: cumulative_tokens / 2, completion_tokens: cumulative_tokens / 2, cumulative_total_tokens: cumulative_tokens },
        stop_reason: StopReason::EndTurn,
    }
}

/// A completion that claims success with no supporting tool calls --
/// the shape the resilience layer is meant to catch.
pub fn hollow_completion(cumulative_tokens: u64) -> ChatResponse {
    ChatResponse {
        content: "Done! The task is now complete.".to_string(),
        tool_calls: vec![],
        usage: Usage { prompt_tokens: cumulative_tokens / 2, completion_tokens: cumulative_tokens / 2, cumulative_total_tokens: cumulative_tokens },
        stop_reason: StopReason::EndTurn,
    }
}

/// A tool that records every invocation it receives and returns a
/// fixed value, so tests can assert on call count and arguments without
/// a real side effect.
pub struct RecordingTool {
    name: String,
    description: String,
    result: Value,
    invocations: Mutex<Vec<Value>>,
}

impl RecordingTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, result: Value) -> Self {
        Self { name: name.into(), description: description.into(), result, invocations: Mutex::new(Vec::new()) }
    }

    pub fn invocations(&self) -> Vec<Value> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, arguments: Value) -> Result<Value> {
        self.invocations.lock().unwrap().push(arguments);
        Ok(self.result.clone())
    }
}

/// A manually-advanced clock producing [`Instant`]s on demand, so tests
/// of the rate-limit window and health-tracker latency samples don't
/// need to sleep in real time to exercise window expiry.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }

    pub fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) -> Instant {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
        self.base + *offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A subtask with a given complexity and dependency set, saving the
/// `Subtask::new(...).with_complexity(...).depends_on(...)` chain in
/// tests that build out whole decompositions by hand.
pub fn subtask(id: &str, task_type: SubtaskType, complexity: u8, deps: &[&str]) -> Subtask {
    Subtask::new(id, format!("do {id}"), task_type)
        .with_complexity(complexity)
        .depends_on(deps.iter().map(|d| SubtaskId::new(*d)))
}

/// A worker spec covering exactly the given capabilities, routed to a
/// model named after the worker for easy identification in assertions.
pub fn worker(name: &str, capabilities: &[SubtaskType]) -> WorkerSpec {
    WorkerSpec::new(name, format!("{name}-model").as_str(), capabilities.iter().copied())
}

/// A decomposition with no conflicts or parallel-group hints, built
/// from a flat list of subtasks -- the common case for queue tests.
pub fn decomposition(subtasks: Vec<Subtask>) -> Decomposition {
    Decomposition { subtasks, parallel_groups: vec![], conflicts: vec![] }
}
