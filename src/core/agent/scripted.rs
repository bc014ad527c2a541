//! Deterministic agent that replays a fixed script, one turn per phase.
//! Used by the bundled binary and by tests in place of a model provider.

use async_stream::try_stream;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Agent, AgentError, AgentEvent, AgentEventStream, AgentRequest, EnvelopeTool, ResumeInput,
    ToolRegistry, ToolSpec, estimate_tokens,
};
use crate::core::chunks::{FinishReason, Usage};
use crate::core::envelope::ToolResultEnvelope;
use crate::core::run::{Message, MessagePart, Role};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Text(String),
    Thinking(String),
    CallTool {
        id: String,
        name: String,
        arguments: Value,
    },
    Fail(String),
}

impl ScriptStep {
    pub fn text(s: &str) -> Self {
        Self::Text(s.to_string())
    }

    pub fn call(id: &str, name: &str, arguments: Value) -> Self {
        Self::CallTool {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }
}

#[derive(Clone)]
pub struct ScriptedAgent {
    turns: Arc<Vec<Vec<ScriptStep>>>,
    tools: Arc<ToolRegistry>,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<Vec<ScriptStep>>, tools: ToolRegistry) -> Self {
        Self {
            turns: Arc::new(turns),
            tools: Arc::new(tools),
            delay: None,
        }
    }

    /// Pause between emitted events.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Query, then CSV export: an approval-gated server tool followed by an
    /// approval-gated client tool.
    pub fn demo() -> Self {
        let tools = ToolRegistry::new()
            .with(
                ToolSpec::server(
                    "run_query",
                    "Run a read-only SQL query",
                    Arc::new(EnvelopeTool::new("Query executed")),
                )
                .needs_approval(),
            )
            .with(ToolSpec::client("export_csv", "Export a result set as CSV").needs_approval());

        Self::new(
            vec![
                vec![
                    ScriptStep::Thinking("A database query needs the user's sign-off.".into()),
                    ScriptStep::text("I'll run a query against the sales table."),
                    ScriptStep::call(
                        "call_query",
                        "run_query",
                        json!({
                            "sql": "SELECT region, SUM(amount) AS total FROM sales GROUP BY region LIMIT 100"
                        }),
                    ),
                ],
                vec![
                    ScriptStep::text("The query finished. I can export the result as CSV."),
                    ScriptStep::call(
                        "call_export",
                        "export_csv",
                        json!({"artifact_id": "sales_by_region"}),
                    ),
                ],
                vec![ScriptStep::text("The export is ready.")],
            ],
            tools,
        )
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: AgentRequest, cancel: CancellationToken) -> AgentEventStream {
        let turns = self.turns.clone();
        let tools = self.tools.clone();
        let delay = self.delay;

        let stream = try_stream! {
            let prompt_tokens: u64 = request
                .history
                .iter()
                .map(|m| estimate_tokens(&m.text()))
                .sum();
            let mut completion = String::new();
            let mut deferred = false;

            for (call_id, input) in &request.resume {
                let (name, arguments) = find_call(&request.history, call_id).ok_or_else(|| {
                    AgentError::Execution(format!("no tool call {call_id} in history"))
                })?;
                let spec = tools
                    .get(&name)
                    .ok_or_else(|| AgentError::UnknownTool(name.clone()))?;
                match input {
                    ResumeInput::Approved if spec.client_side => {
                        deferred = true;
                        yield AgentEvent::ToolCall {
                            id: call_id.clone(),
                            name,
                            arguments,
                            requires_approval: spec.requires_approval,
                            client_side: true,
                        };
                    }
                    ResumeInput::Approved => {
                        let content = spec.execute(&arguments).await?;
                        yield AgentEvent::ToolResult {
                            tool_call_id: call_id.clone(),
                            content,
                        };
                    }
                    ResumeInput::Denied => {
                        debug!(call_id = %call_id, tool = %name, "Tool call denied, skipping execution");
                        yield AgentEvent::ToolResult {
                            tool_call_id: call_id.clone(),
                            content: denial(&name)?,
                        };
                    }
                    ResumeInput::ClientOutput(output) => {
                        yield AgentEvent::ToolResult {
                            tool_call_id: call_id.clone(),
                            content: output.to_string(),
                        };
                    }
                }
            }

            if !deferred {
                let steps = turns
                    .get(turn_index(&request.history))
                    .cloned()
                    .unwrap_or_default();
                for step in steps {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    match step {
                        ScriptStep::Text(text) => {
                            for delta in text.split_inclusive(' ') {
                                completion.push_str(delta);
                                yield AgentEvent::TextDelta(delta.to_string());
                            }
                        }
                        ScriptStep::Thinking(thought) => {
                            yield AgentEvent::ThinkingDelta(thought);
                        }
                        ScriptStep::CallTool { id, name, arguments } => {
                            let spec = tools
                                .get(&name)
                                .ok_or_else(|| AgentError::UnknownTool(name.clone()))?;
                            let gated = spec.requires_approval || spec.client_side;
                            yield AgentEvent::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: arguments.clone(),
                                requires_approval: spec.requires_approval,
                                client_side: spec.client_side,
                            };
                            if gated {
                                deferred = true;
                            } else {
                                let content = spec.execute(&arguments).await?;
                                yield AgentEvent::ToolResult {
                                    tool_call_id: id,
                                    content,
                                };
                            }
                        }
                        ScriptStep::Fail(message) => {
                            Err::<(), _>(AgentError::Execution(message))?;
                        }
                    }
                }
            }

            let reason = if deferred {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            };
            yield AgentEvent::Finish {
                reason,
                usage: Some(Usage::new(prompt_tokens, estimate_tokens(&completion))),
            };
        };
        stream.boxed()
    }
}

fn denial(tool: &str) -> Result<String, AgentError> {
    ToolResultEnvelope::message(format!("Tool call {tool} was denied by the user."))
        .encode()
        .map_err(|e| AgentError::Execution(e.to_string()))
}

fn find_call(history: &[Message], call_id: &str) -> Option<(String, Value)> {
    history
        .iter()
        .rev()
        .flat_map(|m| m.parts.iter().rev())
        .find_map(|p| match p {
            MessagePart::ToolCall {
                id,
                name,
                arguments,
                ..
            } if id == call_id => Some((name.clone(), arguments.clone())),
            _ => None,
        })
}

/// Number of script turns already played: assistant messages that added text
/// or announced a new tool call. Re-announcements of approved client tools do
/// not advance the script.
fn turn_index(history: &[Message]) -> usize {
    let mut seen = HashSet::new();
    let mut turns = 0;
    for message in history.iter().filter(|m| m.role == Role::Assistant) {
        let mut advanced = false;
        for part in &message.parts {
            match part {
                MessagePart::Text { .. } | MessagePart::Thinking { .. } => advanced = true,
                MessagePart::ToolCall { id, .. } => {
                    if seen.insert(id.as_str()) {
                        advanced = true;
                    }
                }
                MessagePart::ToolResult { .. } => {}
            }
        }
        if advanced {
            turns += 1;
        }
    }
    turns
}
