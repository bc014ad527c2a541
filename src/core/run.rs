use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::core::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    AwaitingApproval,
    AwaitingToolResult,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingApproval => "awaiting_approval",
            Self::AwaitingToolResult => "awaiting_tool_result",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::AwaitingToolResult)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition(from: Self, to: Self) -> bool {
        if from == to {
            return !from.is_terminal();
        }
        match from {
            Self::Active => true,
            Self::AwaitingApproval | Self::AwaitingToolResult => matches!(to, Self::Active),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Approval,
    ClientTool,
}

impl PendingKind {
    /// Run status a phase halts into when calls of this kind are outstanding.
    pub fn halt_status(&self) -> RunStatus {
        match self {
            Self::Approval => RunStatus::AwaitingApproval,
            Self::ClientTool => RunStatus::AwaitingToolResult,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub kind: PendingKind,
}

/// A decision that has been consumed by a continuation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    InputComplete,
    ApprovalRequested,
    ApprovalResponded,
    AwaitingClient,
    Complete,
}

/// Approval tag carried by a `tool_call` part. Its id is always the owning
/// call's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTag {
    id: String,
    #[serde(rename = "needsApproval")]
    pub needs_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

impl ApprovalTag {
    pub fn requested(call_id: &str) -> Self {
        Self {
            id: call_id.to_string(),
            needs_approval: true,
            approved: None,
        }
    }

    pub fn decided(call_id: &str, approved: bool) -> Self {
        Self {
            id: call_id.to_string(),
            needs_approval: true,
            approved: Some(approved),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        state: ToolCallState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval: Option<ApprovalTag>,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn user_text(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::Text {
                content: content.into(),
            }],
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![MessagePart::Text {
                content: content.into(),
            }],
        }
    }

    /// Concatenated text parts, used for token estimates and logs.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub message_history: Vec<Message>,
    #[serde(default)]
    pub pending_calls: BTreeMap<String, PendingCall>,
    #[serde(default)]
    pub resolved: BTreeMap<String, ResolvedDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(message_history: Vec<Message>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Active,
            model,
            message_history,
            pending_calls: BTreeMap::new(),
            resolved: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: RunStatus) -> Result<(), RelayError> {
        if !RunStatus::can_transition(self.status, to) {
            return Err(RelayError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Status a run should halt into given its outstanding calls. Approvals win
    /// when both kinds are pending.
    pub fn halt_status(&self) -> Option<RunStatus> {
        let mut status = None;
        for call in self.pending_calls.values() {
            match call.kind {
                PendingKind::Approval => return Some(RunStatus::AwaitingApproval),
                PendingKind::ClientTool => status = Some(RunStatus::AwaitingToolResult),
            }
        }
        status
    }

    /// Every tool-call id that has ever been announced in this run.
    pub fn known_call_ids(&self) -> BTreeSet<String> {
        self.message_history
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                MessagePart::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded approval decisions, by call id.
    pub fn recorded_approvals(&self) -> BTreeMap<String, bool> {
        self.resolved
            .iter()
            .filter_map(|(id, d)| d.approved.map(|a| (id.clone(), a)))
            .collect()
    }

    /// Merges an approval decision into the most recent `tool_call` part for
    /// `call_id`. Returns false when no such part exists.
    pub fn merge_approval(&mut self, call_id: &str, approved: bool) -> bool {
        match self.last_tool_call_mut(call_id) {
            Some(MessagePart::ToolCall {
                id,
                state,
                approval,
                ..
            }) => {
                *approval = Some(ApprovalTag::decided(id, approved));
                *state = ToolCallState::ApprovalResponded;
                true
            }
            _ => false,
        }
    }

    /// Moves an existing `tool_call` part to `state`, keeping its tag unless a
    /// new one is given. Returns false when no such part exists.
    pub fn revise_tool_call(
        &mut self,
        call_id: &str,
        new_state: ToolCallState,
        new_approval: Option<ApprovalTag>,
    ) -> bool {
        match self.last_tool_call_mut(call_id) {
            Some(MessagePart::ToolCall {
                state, approval, ..
            }) => {
                *state = new_state;
                if new_approval.is_some() {
                    *approval = new_approval;
                }
                true
            }
            _ => false,
        }
    }

    pub fn mark_tool_complete(&mut self, call_id: &str) {
        if let Some(MessagePart::ToolCall { state, .. }) = self.last_tool_call_mut(call_id) {
            *state = ToolCallState::Complete;
        }
    }

    fn last_tool_call_mut(&mut self, call_id: &str) -> Option<&mut MessagePart> {
        self.message_history
            .iter_mut()
            .rev()
            .flat_map(|m| m.parts.iter_mut().rev())
            .find(|p| matches!(p, MessagePart::ToolCall { id, .. } if id == call_id))
    }

    /// Drops the oldest messages beyond `max`.
    pub fn cap_history(&mut self, max: usize) {
        if max > 0 && self.message_history.len() > max {
            let excess = self.message_history.len() - max;
            self.message_history.drain(..excess);
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.updated_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_with_call(call_id: &str) -> Run {
        let mut run = Run::new(vec![Message::user_text("export it")], None);
        run.message_history.push(Message {
            role: Role::Assistant,
            parts: vec![MessagePart::ToolCall {
                id: call_id.to_string(),
                name: "export_csv".to_string(),
                arguments: json!({"artifact_id": "a1"}),
                state: ToolCallState::ApprovalRequested,
                approval: Some(ApprovalTag::requested(call_id)),
            }],
        });
        run
    }

    #[test]
    fn halted_states_only_resume_to_active() {
        assert!(RunStatus::can_transition(
            RunStatus::Active,
            RunStatus::AwaitingApproval
        ));
        assert!(RunStatus::can_transition(
            RunStatus::AwaitingToolResult,
            RunStatus::Active
        ));
        assert!(!RunStatus::can_transition(
            RunStatus::AwaitingApproval,
            RunStatus::Completed
        ));
        assert!(!RunStatus::can_transition(
            RunStatus::Completed,
            RunStatus::Active
        ));
        assert!(!RunStatus::can_transition(
            RunStatus::Failed,
            RunStatus::Failed
        ));
    }

    #[test]
    fn status_strings_match_wire_names() {
        for status in [
            RunStatus::Active,
            RunStatus::AwaitingApproval,
            RunStatus::AwaitingToolResult,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
    }

    #[test]
    fn transition_rejects_leaving_terminal_state() {
        let mut run = Run::new(vec![], None);
        run.transition(RunStatus::Completed).unwrap();
        let err = run.transition(RunStatus::Active).unwrap_err();
        assert!(matches!(err, RelayError::IllegalTransition { .. }));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn approval_wins_halt_status() {
        let mut run = Run::new(vec![], None);
        assert_eq!(run.halt_status(), None);
        run.pending_calls.insert(
            "c2".into(),
            PendingCall {
                call_id: "c2".into(),
                tool_name: "export_csv".into(),
                input: json!({}),
                kind: PendingKind::ClientTool,
            },
        );
        assert_eq!(run.halt_status(), Some(RunStatus::AwaitingToolResult));
        run.pending_calls.insert(
            "c1".into(),
            PendingCall {
                call_id: "c1".into(),
                tool_name: "run_query".into(),
                input: json!({}),
                kind: PendingKind::Approval,
            },
        );
        assert_eq!(run.halt_status(), Some(RunStatus::AwaitingApproval));
    }

    #[test]
    fn merge_approval_tags_the_call_part() {
        let mut run = run_with_call("c1");
        assert!(run.merge_approval("c1", true));
        match &run.message_history[1].parts[0] {
            MessagePart::ToolCall {
                state, approval, ..
            } => {
                assert_eq!(*state, ToolCallState::ApprovalResponded);
                let tag = approval.as_ref().unwrap();
                assert_eq!(tag.id(), "c1");
                assert_eq!(tag.approved, Some(true));
            }
            other => panic!("unexpected part {other:?}"),
        }
        assert!(!run.merge_approval("missing", false));
    }

    #[test]
    fn revise_keeps_tag_unless_replaced() {
        let mut run = run_with_call("c1");
        assert!(run.revise_tool_call("c1", ToolCallState::AwaitingClient, None));
        assert!(matches!(
            &run.message_history[1].parts[0],
            MessagePart::ToolCall { state: ToolCallState::AwaitingClient, approval: Some(tag), .. }
                if tag.approved.is_none()
        ));

        let tag = ApprovalTag::decided("c1", true);
        assert!(run.revise_tool_call("c1", ToolCallState::AwaitingClient, Some(tag)));
        assert!(matches!(
            &run.message_history[1].parts[0],
            MessagePart::ToolCall { approval: Some(tag), .. } if tag.approved == Some(true)
        ));
        assert!(!run.revise_tool_call("missing", ToolCallState::Complete, None));
    }

    #[test]
    fn tool_call_part_serializes_with_approval_tag() {
        let run = run_with_call("c9");
        let v = serde_json::to_value(&run.message_history[1].parts[0]).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["state"], "approval-requested");
        assert_eq!(v["approval"]["id"], "c9");
        assert_eq!(v["approval"]["needsApproval"], true);
        assert!(v["approval"].get("approved").is_none());
    }

    #[test]
    fn cap_history_drops_oldest() {
        let mut run = Run::new(
            (0..5).map(|i| Message::user_text(format!("m{i}"))).collect(),
            None,
        );
        run.cap_history(2);
        assert_eq!(run.message_history.len(), 2);
        assert_eq!(run.message_history[0].text(), "m3");
        run.cap_history(0);
        assert_eq!(run.message_history.len(), 2);
    }

    #[test]
    fn expiry_uses_last_update() {
        let mut run = Run::new(vec![], None);
        assert!(!run.is_expired(Duration::from_secs(60)));
        run.updated_at = Utc::now() - chrono::Duration::minutes(5);
        assert!(run.is_expired(Duration::from_secs(60)));
    }
}
