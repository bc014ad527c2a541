//! Wire chunks streamed to the client, one per SSE `data:` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPayload {
    id: String,
    #[serde(rename = "needsApproval")]
    pub needs_approval: bool,
}

impl ApprovalPayload {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChunkBody {
    #[serde(rename = "content")]
    Content {
        content: String,
        delta: String,
        role: String,
    },
    #[serde(rename = "thinking")]
    Thinking { content: String, delta: String },
    #[serde(rename = "tool_call")]
    ToolCall {
        index: usize,
        #[serde(rename = "toolCall")]
        tool_call: ToolCallPayload,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        content: String,
    },
    #[serde(rename = "approval-requested")]
    ApprovalRequested {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
        approval: ApprovalPayload,
    },
    #[serde(rename = "tool-input-available")]
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    #[serde(rename = "error")]
    Error { error: ErrorPayload },
    #[serde(rename = "done")]
    Done {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl ChunkBody {
    /// Builds an approval request; the approval id is taken from the call id.
    pub fn approval_requested(tool_call_id: &str, tool_name: &str, input: Value) -> Self {
        Self::ApprovalRequested {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            input,
            approval: ApprovalPayload {
                id: tool_call_id.to_string(),
                needs_approval: true,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Wire discriminant, handy for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ApprovalRequested { .. } => "approval-requested",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Always the run id.
    pub id: String,
    pub model: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: ChunkBody,
}

/// Common envelope fields stamped onto every chunk of a phase.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    run_id: String,
    model: String,
}

impl ChunkContext {
    pub fn new(run_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            model: model.into(),
        }
    }

    pub fn chunk(&self, body: ChunkBody) -> StreamChunk {
        StreamChunk {
            id: self.run_id.clone(),
            model: self.model.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }
}
