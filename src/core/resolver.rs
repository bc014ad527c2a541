use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::agent::ResumeInput;
use crate::core::error::RelayError;
use crate::core::run::{Message, PendingKind, Role, Run, RunStatus};
use crate::core::store::RunStore;

/// Inbound body of `POST /api/chat`.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub approvals: BTreeMap<String, bool>,
    #[serde(default)]
    pub tool_results: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Client decisions carried by a continuation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decisions {
    pub approvals: BTreeMap<String, bool>,
    pub tool_results: BTreeMap<String, Value>,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty() && self.tool_results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.approvals.len() + self.tool_results.len()
    }

    pub fn to_resume_inputs(&self) -> BTreeMap<String, ResumeInput> {
        let approvals = self.approvals.iter().map(|(id, approved)| {
            let input = if *approved {
                ResumeInput::Approved
            } else {
                ResumeInput::Denied
            };
            (id.clone(), input)
        });
        let outputs = self
            .tool_results
            .iter()
            .map(|(id, output)| (id.clone(), ResumeInput::ClientOutput(output.clone())));
        approvals.chain(outputs).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub run: Run,
    pub is_continuation: bool,
    pub decisions: Decisions,
}

pub struct ContinuationResolver {
    store: Arc<dyn RunStore>,
}

impl ContinuationResolver {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, body: &[u8]) -> Result<ResolvedRequest, RelayError> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidRequest(format!("malformed body: {e}")))?;
        self.resolve_request(request).await
    }

    pub async fn resolve_request(&self, request: ChatRequest) -> Result<ResolvedRequest, RelayError> {
        match request.run_id.filter(|id| !id.trim().is_empty()) {
            Some(run_id) => {
                let decisions = Decisions {
                    approvals: request.approvals,
                    tool_results: request.tool_results,
                };
                self.resume(&run_id, decisions).await
            }
            None => {
                let history = seed_history(request.messages)?;
                let run = self.store.create(history, request.model).await?;
                info!(run_id = %run.id, "Run created");
                Ok(ResolvedRequest {
                    run,
                    is_continuation: false,
                    decisions: Decisions::default(),
                })
            }
        }
    }

    async fn resume(&self, run_id: &str, decisions: Decisions) -> Result<ResolvedRequest, RelayError> {
        let applied = decisions.clone();
        let run = self
            .store
            .update(run_id, Box::new(move |run: &mut Run| consume_decisions(run, &applied)))
            .await
            .inspect_err(|e| warn!(run_id = %run_id, code = e.code(), "Continuation rejected: {e}"))?;
        info!(run_id = %run_id, decisions = decisions.len(), "Run resumed");
        Ok(ResolvedRequest {
            run,
            is_continuation: true,
            decisions,
        })
    }
}

fn seed_history(messages: Vec<InboundMessage>) -> Result<Vec<Message>, RelayError> {
    let mut history = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(RelayError::InvalidRequest(format!(
                    "unsupported message role '{other}'"
                )));
            }
        };
        let text = match message.content {
            Value::String(s) => s,
            Value::Null => continue,
            other => {
                return Err(RelayError::InvalidRequest(format!(
                    "message content must be a string, got {other}"
                )));
            }
        };
        history.push(match role {
            Role::User => Message::user_text(text),
            Role::Assistant => Message::assistant_text(text),
        });
    }
    if !history.iter().any(|m| m.role == Role::User) {
        return Err(RelayError::InvalidRequest(
            "at least one user message is required".to_string(),
        ));
    }
    Ok(history)
}

/// Validates `decisions` against the run's pending calls and consumes them.
/// Must run inside a store update so a rejection leaves the run untouched.
pub fn consume_decisions(run: &mut Run, decisions: &Decisions) -> Result<(), RelayError> {
    match run.status {
        RunStatus::Active => return Err(RelayError::ConflictingResume(run.id.clone())),
        RunStatus::Completed | RunStatus::Failed => {
            return Err(RelayError::InvalidContinuation(format!(
                "run {} is {} and has nothing to resume",
                run.id, run.status
            )));
        }
        RunStatus::AwaitingApproval | RunStatus::AwaitingToolResult => {}
    }
    if decisions.is_empty() {
        return Err(RelayError::InvalidContinuation(
            "no approvals or tool_results supplied".to_string(),
        ));
    }

    let keyed = decisions
        .approvals
        .keys()
        .map(|id| (id, PendingKind::Approval))
        .chain(decisions.tool_results.keys().map(|id| (id, PendingKind::ClientTool)));
    for (call_id, kind) in keyed {
        match run.pending_calls.get(call_id) {
            Some(pending) if pending.kind == kind => {}
            Some(pending) => {
                return Err(RelayError::InvalidContinuation(format!(
                    "call {call_id} is awaiting {:?}, not {:?}",
                    pending.kind, kind
                )));
            }
            None if run.resolved.contains_key(call_id) => {
                return Err(RelayError::InvalidContinuation(format!(
                    "call {call_id} was already resolved"
                )));
            }
            None => {
                return Err(RelayError::InvalidContinuation(format!(
                    "call {call_id} is not pending"
                )));
            }
        }
    }
    let missing: Vec<&str> = run
        .pending_calls
        .keys()
        .filter(|id| !decisions.approvals.contains_key(*id) && !decisions.tool_results.contains_key(*id))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(RelayError::InvalidContinuation(format!(
            "missing decisions for pending calls: {}",
            missing.join(", ")
        )));
    }

    for (call_id, approved) in &decisions.approvals {
        run.pending_calls.remove(call_id);
        run.resolved.entry(call_id.clone()).or_default().approved = Some(*approved);
        run.merge_approval(call_id, *approved);
    }
    for (call_id, output) in &decisions.tool_results {
        run.pending_calls.remove(call_id);
        run.resolved.entry(call_id.clone()).or_default().output = Some(output.clone());
    }
    run.transition(RunStatus::Active)
}
