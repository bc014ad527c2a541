pub mod scripted;
pub mod tools;

use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::core::chunks::{FinishReason, Usage};
use crate::core::run::Message;

pub use scripted::{ScriptStep, ScriptedAgent};
pub use tools::{EnvelopeTool, ToolExecutor, ToolRegistry, ToolSpec};

/// How a previously deferred call was resolved by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInput {
    Approved,
    Denied,
    ClientOutput(Value),
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: String,
    pub model: String,
    pub history: Vec<Message>,
    pub resume: BTreeMap<String, ResumeInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        requires_approval: bool,
        client_side: bool,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Execution(String),
    #[error("tool {tool} failed: {message}")]
    Tool { tool: String, message: String },
    #[error("unknown tool {0}")]
    UnknownTool(String),
}

pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

/// The model-driving collaborator. One call per execution phase; the stream
/// ends after `Finish` or an error.
pub trait Agent: Send + Sync {
    fn run(&self, request: AgentRequest, cancel: CancellationToken) -> AgentEventStream;
}

/// Rough token estimate (~4 chars per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
