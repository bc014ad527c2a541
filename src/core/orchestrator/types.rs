#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Starting,
    Streaming,
    HaltedForApproval,
    HaltedForClientTool,
    Completed,
    Failed,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseState::Starting => "starting",
            PhaseState::Streaming => "streaming",
            PhaseState::HaltedForApproval => "halted_for_approval",
            PhaseState::HaltedForClientTool => "halted_for_client_tool",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
        }
    }

    pub fn is_halted(self) -> bool {
        matches!(
            self,
            PhaseState::HaltedForApproval | PhaseState::HaltedForClientTool
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::Failed)
    }
}

pub fn can_transition(from: PhaseState, to: PhaseState) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        PhaseState::Starting => matches!(to, PhaseState::Streaming | PhaseState::Failed),
        PhaseState::Streaming => matches!(
            to,
            PhaseState::HaltedForApproval
                | PhaseState::HaltedForClientTool
                | PhaseState::Completed
                | PhaseState::Failed
        ),
        // an approval request outranks a client-side deferral in the same step
        PhaseState::HaltedForClientTool => {
            matches!(to, PhaseState::HaltedForApproval | PhaseState::Failed)
        }
        PhaseState::HaltedForApproval => matches!(to, PhaseState::Failed),
        PhaseState::Completed | PhaseState::Failed => false,
    }
}

/// What a driven phase ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub state: PhaseState,
    pub chunks: usize,
    /// The client went away before the phase ended.
    pub cancelled: bool,
}
