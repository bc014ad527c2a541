pub mod types;

pub use types::{PhaseOutcome, PhaseState, can_transition};

use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::agent::{Agent, AgentEvent, AgentRequest};
use crate::core::chunks::{ChunkContext, FinishReason, StreamChunk, Usage};
use crate::core::encoder::{ChunkEncoder, EncodeError};
use crate::core::error::RelayError;
use crate::core::resolver::ResolvedRequest;
use crate::core::run::{
    ApprovalTag, Message, MessagePart, PendingCall, PendingKind, Role, Run, RunStatus,
    ToolCallState,
};
use crate::core::store::RunStore;

const CHUNK_BUFFER: usize = 64;

/// Drives one execution phase of a run: agent events in, wire chunks out,
/// run state persisted before the terminal chunk.
#[derive(Clone)]
pub struct StreamOrchestrator {
    store: Arc<dyn RunStore>,
    agent: Arc<dyn Agent>,
    default_model: String,
}

enum Step {
    Event(Option<Result<AgentEvent, crate::core::agent::AgentError>>),
    Cancelled,
}

impl StreamOrchestrator {
    pub fn new(store: Arc<dyn RunStore>, agent: Arc<dyn Agent>, default_model: impl Into<String>) -> Self {
        Self {
            store,
            agent,
            default_model: default_model.into(),
        }
    }

    /// Runs the phase on its own task. Dropping the receiver cancels it.
    pub fn spawn_phase(&self, resolved: ResolvedRequest) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let span = info_span!(
            "phase",
            run_id = %resolved.run.id,
            continuation = resolved.is_continuation
        );
        let this = self.clone();
        tokio::spawn(
            async move {
                let outcome = this.drive(resolved, tx, CancellationToken::new()).await;
                debug!(state = outcome.state.as_str(), chunks = outcome.chunks, "Phase ended");
            }
            .instrument(span),
        );
        rx
    }

    pub async fn drive(
        &self,
        resolved: ResolvedRequest,
        tx: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> PhaseOutcome {
        let ResolvedRequest { run, decisions, .. } = resolved;
        let model = run
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let approvals = run.recorded_approvals();
        let known_calls = run.known_call_ids();
        let encoder = ChunkEncoder::new(
            ChunkContext::new(run.id.clone(), model.clone()),
            known_calls.clone(),
            approvals.clone(),
        );
        let mut phase = Phase {
            run_id: run.id.clone(),
            state: PhaseState::Starting,
            encoder,
            approvals,
            known_calls,
            parts: Vec::new(),
            pending: BTreeMap::new(),
            revisions: Vec::new(),
            completed_calls: Vec::new(),
            outbox: Vec::new(),
            tx,
            emitted: 0,
        };

        let request = AgentRequest {
            run_id: run.id,
            model,
            history: run.message_history,
            resume: decisions.to_resume_inputs(),
        };
        let mut events = self.agent.run(request, cancel.child_token());

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = phase.tx.closed() => Step::Cancelled,
                event = events.next() => Step::Event(event),
            };
            if matches!(step, Step::Event(Some(_))) && phase.state == PhaseState::Starting {
                phase.advance(PhaseState::Streaming);
            }
            match step {
                Step::Cancelled => {
                    cancel.cancel();
                    return phase.abandon();
                }
                Step::Event(None) if phase.pending.is_empty() => {
                    return self
                        .fail(phase, EncodeError::UnexpectedEnd.into())
                        .await;
                }
                Step::Event(None) => return self.halt(phase, None).await,
                Step::Event(Some(Err(e))) => return self.fail(phase, e.into()).await,
                Step::Event(Some(Ok(AgentEvent::Finish { reason, usage }))) => {
                    return if phase.pending.is_empty() {
                        self.complete(phase, reason, usage).await
                    } else {
                        self.halt(phase, usage).await
                    };
                }
                Step::Event(Some(Ok(event))) => {
                    if let Err(e) = phase.accept(&event) {
                        return self.fail(phase, e.into()).await;
                    }
                    if !phase.flush().await {
                        cancel.cancel();
                        return phase.abandon();
                    }
                }
            }
        }
    }

    async fn halt(&self, mut phase: Phase, usage: Option<Usage>) -> PhaseOutcome {
        let message = phase.take_message();
        let pending = std::mem::take(&mut phase.pending);
        let revisions = std::mem::take(&mut phase.revisions);
        let completed = phase.completed_calls.clone();
        let persisted = self
            .store
            .update(
                &phase.run_id,
                Box::new(move |run: &mut Run| {
                    apply_revisions(run, revisions);
                    for id in &completed {
                        run.mark_tool_complete(id);
                    }
                    run.message_history.extend(message);
                    run.pending_calls.extend(pending);
                    let status = run.halt_status().unwrap_or(RunStatus::AwaitingToolResult);
                    run.transition(status)
                }),
            )
            .await;
        match persisted {
            Ok(run) => {
                info!(
                    status = %run.status,
                    pending = run.pending_calls.len(),
                    "Run halted awaiting client"
                );
                let done = phase.encoder.done(FinishReason::ToolCalls, usage);
                phase.finish(done).await
            }
            Err(e) => self.storage_failure(phase, e).await,
        }
    }

    async fn complete(
        &self,
        mut phase: Phase,
        reason: FinishReason,
        usage: Option<Usage>,
    ) -> PhaseOutcome {
        // tool_calls without anything pending is an ordinary stop
        let reason = match reason {
            FinishReason::ToolCalls => FinishReason::Stop,
            other => other,
        };
        let message = phase.take_message();
        let revisions = std::mem::take(&mut phase.revisions);
        let completed = phase.completed_calls.clone();
        let persisted = self
            .store
            .update(
                &phase.run_id,
                Box::new(move |run: &mut Run| {
                    apply_revisions(run, revisions);
                    for id in &completed {
                        run.mark_tool_complete(id);
                    }
                    run.message_history.extend(message);
                    run.transition(RunStatus::Completed)
                }),
            )
            .await;
        match persisted {
            Ok(_) => {
                phase.advance(PhaseState::Completed);
                info!("Run completed");
                let done = phase.encoder.done(reason, usage);
                phase.finish(done).await
            }
            Err(e) => self.storage_failure(phase, e).await,
        }
    }

    async fn fail(&self, mut phase: Phase, err: RelayError) -> PhaseOutcome {
        warn!(code = err.code(), "Phase failed: {err}");
        phase.advance(PhaseState::Failed);
        let chunk = phase.encoder.error(err.to_string(), err.code());
        let message = phase.take_message();
        let revisions = std::mem::take(&mut phase.revisions);
        let outcome = phase.finish(chunk).await;
        let persisted = self
            .store
            .update(
                &phase.run_id,
                Box::new(move |run: &mut Run| {
                    apply_revisions(run, revisions);
                    run.message_history.extend(message);
                    run.pending_calls.clear();
                    run.transition(RunStatus::Failed)
                }),
            )
            .await;
        if let Err(e) = persisted {
            error!("Failed to record run failure: {e}");
        }
        outcome
    }

    async fn storage_failure(&self, mut phase: Phase, err: RelayError) -> PhaseOutcome {
        error!("Failed to persist run state: {err}");
        phase.advance(PhaseState::Failed);
        let chunk = phase.encoder.error(err.to_string(), "storage_error");
        phase.finish(chunk).await
    }
}

/// New state for a tool call part recorded in an earlier phase.
struct Revision {
    call_id: String,
    state: ToolCallState,
    approval: Option<ApprovalTag>,
}

fn apply_revisions(run: &mut Run, revisions: Vec<Revision>) {
    for rev in revisions {
        if !run.revise_tool_call(&rev.call_id, rev.state, rev.approval) {
            warn!(call_id = %rev.call_id, "No tool call part to revise");
        }
    }
}

/// Per-phase working state, owned by the driving task.
struct Phase {
    run_id: String,
    state: PhaseState,
    encoder: ChunkEncoder,
    approvals: BTreeMap<String, bool>,
    /// Call ids already present in the run's history.
    known_calls: BTreeSet<String>,
    parts: Vec<MessagePart>,
    pending: BTreeMap<String, PendingCall>,
    /// Re-announced calls from earlier phases; updated in place, never re-pushed.
    revisions: Vec<Revision>,
    /// Calls from earlier phases that got their result in this one.
    completed_calls: Vec<String>,
    outbox: Vec<StreamChunk>,
    tx: mpsc::Sender<StreamChunk>,
    emitted: usize,
}

impl Phase {
    fn advance(&mut self, to: PhaseState) {
        if can_transition(self.state, to) {
            self.state = to;
        } else {
            warn!(
                from = self.state.as_str(),
                to = to.as_str(),
                "Ignoring illegal phase transition"
            );
        }
    }

    fn accept(&mut self, event: &AgentEvent) -> Result<(), EncodeError> {
        if self.state.is_halted() && !matches!(event, AgentEvent::ToolCall { .. }) {
            return Err(EncodeError::ContentAfterHalt);
        }
        let encoded = self.encoder.encode(event)?;
        self.record(event, encoded.deferred.as_ref().map(|c| c.kind));
        if let Some(call) = encoded.deferred {
            let next = match (call.kind, self.state) {
                (PendingKind::Approval, _) => PhaseState::HaltedForApproval,
                (PendingKind::ClientTool, PhaseState::HaltedForApproval) => {
                    PhaseState::HaltedForApproval
                }
                (PendingKind::ClientTool, _) => PhaseState::HaltedForClientTool,
            };
            debug!(call_id = %call.call_id, tool = %call.tool_name, "Deferring tool call");
            self.advance(next);
            self.pending.insert(call.call_id.clone(), call);
        }
        self.outbox.extend(encoded.chunks);
        Ok(())
    }

    fn record(&mut self, event: &AgentEvent, deferred: Option<PendingKind>) {
        match event {
            AgentEvent::TextDelta(delta) => match self.parts.last_mut() {
                Some(MessagePart::Text { content }) => content.push_str(delta),
                _ => self.parts.push(MessagePart::Text {
                    content: delta.clone(),
                }),
            },
            AgentEvent::ThinkingDelta(delta) => match self.parts.last_mut() {
                Some(MessagePart::Thinking { content }) => content.push_str(delta),
                _ => self.parts.push(MessagePart::Thinking {
                    content: delta.clone(),
                }),
            },
            AgentEvent::ToolCall {
                id,
                name,
                arguments,
                ..
            } => {
                let decided = self.approvals.get(id).map(|a| ApprovalTag::decided(id, *a));
                let (state, approval) = match deferred {
                    Some(PendingKind::Approval) => (
                        ToolCallState::ApprovalRequested,
                        Some(ApprovalTag::requested(id)),
                    ),
                    Some(PendingKind::ClientTool) => (ToolCallState::AwaitingClient, decided),
                    None => (ToolCallState::InputComplete, decided),
                };
                if self.known_calls.contains(id) {
                    self.revisions.push(Revision {
                        call_id: id.clone(),
                        state,
                        approval,
                    });
                    return;
                }
                self.parts.push(MessagePart::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                    state,
                    approval,
                });
            }
            AgentEvent::ToolResult {
                tool_call_id,
                content,
            } => {
                let local = self.parts.iter_mut().find_map(|p| match p {
                    MessagePart::ToolCall { id, state, .. } if id == tool_call_id => Some(state),
                    _ => None,
                });
                match local {
                    Some(state) => *state = ToolCallState::Complete,
                    None => self.completed_calls.push(tool_call_id.clone()),
                }
                self.parts.push(MessagePart::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    content: content.clone(),
                });
            }
            AgentEvent::Finish { .. } => {}
        }
    }

    fn take_message(&mut self) -> Option<Message> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Message {
            role: Role::Assistant,
            parts: std::mem::take(&mut self.parts),
        })
    }

    /// Sends buffered chunks; false once the client has gone.
    async fn flush(&mut self) -> bool {
        for chunk in std::mem::take(&mut self.outbox) {
            if self.tx.send(chunk).await.is_err() {
                return false;
            }
            self.emitted += 1;
        }
        true
    }

    async fn finish(&mut self, terminal: Option<StreamChunk>) -> PhaseOutcome {
        let mut delivered = self.flush().await;
        if let Some(chunk) = terminal {
            delivered = delivered && self.tx.send(chunk).await.is_ok();
            if delivered {
                self.emitted += 1;
            }
        }
        if !delivered {
            debug!("Client left before the terminal chunk");
        }
        PhaseOutcome {
            state: self.state,
            chunks: self.emitted,
            cancelled: !delivered,
        }
    }

    fn abandon(&self) -> PhaseOutcome {
        info!("Client disconnected, abandoning phase");
        PhaseOutcome {
            state: self.state,
            chunks: self.emitted,
            cancelled: true,
        }
    }
}
