use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::agent::AgentEvent;
use crate::core::chunks::{
    ChunkBody, ChunkContext, ErrorPayload, FinishReason, StreamChunk, ToolCallPayload, Usage,
};
use crate::core::run::{PendingCall, PendingKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("tool call {0} announced twice in one phase")]
    DuplicateToolCall(String),
    #[error("tool result for unknown call {0}")]
    UnknownToolCall(String),
    #[error("agent emitted content after a halting tool call")]
    ContentAfterHalt,
    #[error("agent stream ended without finishing")]
    UnexpectedEnd,
    #[error("encoder already emitted a terminal chunk")]
    AfterTerminal,
    #[error("finish events are not encoded directly")]
    UnexpectedFinish,
}

/// Chunks for one agent event, plus the call it deferred, if any.
#[derive(Debug, Default)]
pub struct Encoded {
    pub chunks: Vec<StreamChunk>,
    pub deferred: Option<PendingCall>,
}

/// Maps agent events of a single phase to wire chunks. State is limited to
/// cumulative text and the tool-call indices announced so far.
pub struct ChunkEncoder {
    ctx: ChunkContext,
    text: String,
    thinking: String,
    tool_indices: HashMap<String, usize>,
    known_calls: BTreeSet<String>,
    approvals: BTreeMap<String, bool>,
    finished: bool,
}

impl ChunkEncoder {
    /// `known_calls` are ids announced in earlier phases of the run;
    /// `approvals` are decisions already recorded for them.
    pub fn new(
        ctx: ChunkContext,
        known_calls: BTreeSet<String>,
        approvals: BTreeMap<String, bool>,
    ) -> Self {
        Self {
            ctx,
            text: String::new(),
            thinking: String::new(),
            tool_indices: HashMap::new(),
            known_calls,
            approvals,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn encode(&mut self, event: &AgentEvent) -> Result<Encoded, EncodeError> {
        if self.finished {
            return Err(EncodeError::AfterTerminal);
        }
        let mut out = Encoded::default();
        match event {
            AgentEvent::TextDelta(delta) => {
                if !delta.is_empty() {
                    self.text.push_str(delta);
                    out.chunks.push(self.ctx.chunk(ChunkBody::Content {
                        content: self.text.clone(),
                        delta: delta.clone(),
                        role: "assistant".to_string(),
                    }));
                }
            }
            AgentEvent::ThinkingDelta(delta) => {
                if !delta.is_empty() {
                    self.thinking.push_str(delta);
                    out.chunks.push(self.ctx.chunk(ChunkBody::Thinking {
                        content: self.thinking.clone(),
                        delta: delta.clone(),
                    }));
                }
            }
            AgentEvent::ToolCall {
                id,
                name,
                arguments,
                requires_approval,
                client_side,
            } => {
                if self.tool_indices.contains_key(id) {
                    return Err(EncodeError::DuplicateToolCall(id.clone()));
                }
                let index = self.tool_indices.len();
                self.tool_indices.insert(id.clone(), index);
                out.chunks.push(self.ctx.chunk(ChunkBody::ToolCall {
                    index,
                    tool_call: ToolCallPayload {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.to_string(),
                    },
                }));

                let recorded = self.approvals.get(id).copied();
                let kind = match recorded {
                    None if *requires_approval => Some(PendingKind::Approval),
                    Some(false) => None,
                    _ if *client_side => Some(PendingKind::ClientTool),
                    _ => None,
                };
                if let Some(kind) = kind {
                    out.chunks.push(self.ctx.chunk(deferral_body(kind, id, name, arguments)));
                    out.deferred = Some(PendingCall {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        input: arguments.clone(),
                        kind,
                    });
                }
            }
            AgentEvent::ToolResult {
                tool_call_id,
                content,
            } => {
                if !self.tool_indices.contains_key(tool_call_id)
                    && !self.known_calls.contains(tool_call_id)
                {
                    return Err(EncodeError::UnknownToolCall(tool_call_id.clone()));
                }
                out.chunks.push(self.ctx.chunk(ChunkBody::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    content: content.clone(),
                }));
            }
            AgentEvent::Finish { .. } => return Err(EncodeError::UnexpectedFinish),
        }
        Ok(out)
    }

    /// Terminal `done` chunk. Returns `None` once a terminal chunk went out.
    pub fn done(&mut self, finish_reason: FinishReason, usage: Option<Usage>) -> Option<StreamChunk> {
        self.terminal(ChunkBody::Done {
            finish_reason,
            usage,
        })
    }

    /// Terminal `error` chunk. Returns `None` once a terminal chunk went out.
    pub fn error(&mut self, message: impl Into<String>, code: &str) -> Option<StreamChunk> {
        self.terminal(ChunkBody::Error {
            error: ErrorPayload {
                message: message.into(),
                code: Some(code.to_string()),
            },
        })
    }

    fn terminal(&mut self, body: ChunkBody) -> Option<StreamChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.ctx.chunk(body))
    }
}

fn deferral_body(kind: PendingKind, id: &str, name: &str, arguments: &Value) -> ChunkBody {
    match kind {
        PendingKind::Approval => ChunkBody::approval_requested(id, name, arguments.clone()),
        PendingKind::ClientTool => ChunkBody::ToolInputAvailable {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            input: arguments.clone(),
        },
    }
}
