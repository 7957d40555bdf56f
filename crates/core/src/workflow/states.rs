use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::suggestion::SuggestionId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

/// States of the per-suggestion approval machine. `AwaitingDecision` is the
/// only non-terminal state; a timed-out wait resolves to `Rejected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    AwaitingDecision,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingDecision => "awaiting_decision",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "awaiting_decision" => Some(Self::AwaitingDecision),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// External reviewer input delivered to a running workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ApprovalSignal {
    Approve { reviewer_id: String, note: Option<String> },
    Reject { reviewer_id: String, note: Option<String> },
}

impl ApprovalSignal {
    pub fn reviewer_id(&self) -> &str {
        match self {
            Self::Approve { reviewer_id, .. } | Self::Reject { reviewer_id, .. } => reviewer_id,
        }
    }
}

/// Everything that can advance the machine: a reviewer signal, or the
/// decision timer firing with no signal received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum WorkflowInput {
    Signal(ApprovalSignal),
    TimerFired,
}

/// Side effects the machine requests. The machine itself performs no I/O;
/// the runtime executes these through the terminal activities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkflowCommand {
    NotifyPendingReview { suggestion_id: SuggestionId },
    ApplyApproved { suggestion_id: SuggestionId, reviewer_id: String, note: Option<String> },
    ApplyRejected { suggestion_id: SuggestionId, reviewer_id: String, note: Option<String> },
}

/// The at-most-once decision record checkpointed with the machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: Option<bool>,
    pub reviewer_id: Option<String>,
    pub note: Option<String>,
}

/// Read-only answer to a status query. Never mutates the machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub approved: Option<bool>,
    pub reviewer_id: Option<String>,
    pub note: Option<String>,
    pub awaiting_decision: bool,
}

/// Result of applying one input: the state after the input, whether it
/// changed anything, and the commands the runtime must execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub state: ApprovalState,
    pub changed: bool,
    pub commands: Vec<WorkflowCommand>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowTransitionError {
    #[error("reviewer id must not be empty for workflow {workflow_id}")]
    EmptyReviewer { workflow_id: String },
    #[error("workflow {workflow_id} log is inconsistent at seq {seq}: {detail}")]
    InconsistentLog { workflow_id: String, seq: i64, detail: String },
}
