//! A provider that stands in for a real LLM backend when no API keys
//! are configured: it reports the subtask as done after recording one
//! tool call, so `swarm run` can demonstrate the dispatch loop without
//! network access. Not meant to produce useful work.

use anyhow::Result;
use async_trait::async_trait;

use swarm_core::provider::{ChatOptions, ChatResponse, Message, Provider, StopReason, ToolCall, Usage};
use swarm_core::types::ModelId;

pub struct StubProvider {
    model: ModelId,
}

impl StubProvider {
    pub fn new(model: ModelId) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn model(&self) -> &ModelId {
        &self.model
    }

    fn context_window(&self) -> u32 {
        128_000
    }

    async fn chat(&self, messages: &[Message], _options: &ChatOptions) -> Result<ChatResponse> {
        let task_description = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatResponse {
            content: format!("Completed: {task_description}"),
            tool_calls: vec![ToolCall { name: "noop".to_string(), arguments: serde_json::Value::Null }],
            usage: Usage { prompt_tokens: 200, completion_tokens: 100, cumulative_total_tokens: 300 },
            stop_reason: StopReason::EndTurn,
        })
    }
}
