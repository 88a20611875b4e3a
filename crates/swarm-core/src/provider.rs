//! The `Provider` trait -- the adapter interface for LLM backends -- and
//! the `Tool` trait workers expose to them.
//!
//! Concrete providers (Anthropic, OpenAI, a local model server) implement
//! `Provider`; the orchestrator and resilience layer only ever see `dyn
//! Provider`, so swapping a backend never touches dispatch logic.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::ModelId;

/// A single turn in a conversation sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub tool_names: Vec<String>,
}

/// Token usage as reported by the provider for this call. Reported
/// cumulatively for the conversation, not just this turn -- see
/// [`crate::economics::EconomicsManager::record_token_usage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cumulative_total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Cancelled,
}

/// Adapter interface for an LLM backend.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `Box<dyn Provider>`
/// can be stored in the worker pool and swapped per [`crate::types::WorkerSpec`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> &ModelId;

    fn context_window(&self) -> u32;

    async fn chat(&self, messages: &[Message], options: &ChatOptions) -> Result<ChatResponse>;
}

const _: () = {
    fn _assert_provider_object_safe(_: &dyn Provider) {}
};

/// A tool a worker can invoke mid-conversation. Distinct from `Provider`
/// because tools are shared across every provider/model, not swapped per
/// backend.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn invoke(&self, arguments: Value) -> Result<Value>;
}

const _: () = {
    fn _assert_tool_object_safe(_: &dyn Tool) {}
};
