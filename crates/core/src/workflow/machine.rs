use serde::{Deserialize, Serialize};

use crate::domain::suggestion::SuggestionId;
use crate::workflow::states::{
    ApprovalDecision, ApprovalSignal, ApprovalState, StatusSnapshot, TransitionOutcome,
    WorkflowCommand, WorkflowId, WorkflowInput, WorkflowTransitionError,
};

/// Note recorded when the decision window elapses with no signal.
pub const AUTO_REJECT_NOTE: &str = "auto-rejected after timeout with no response";

/// Reviewer recorded for system-originated resolutions.
pub const SYSTEM_REVIEWER: &str = "system";

/// The pure approval state machine: no clocks, no I/O, no storage. Inputs
/// are signals and a timer-fired event; outputs are commands for the
/// runtime to execute. Replaying the same inputs always reproduces the
/// same state, which is what lets the event-sourced runtime rehydrate an
/// instance from its log after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    workflow_id: WorkflowId,
    suggestion_id: SuggestionId,
    state: ApprovalState,
    decision: ApprovalDecision,
}

impl ApprovalWorkflow {
    /// Start a fresh instance in `AwaitingDecision`. The returned commands
    /// carry the one-shot pending-review notification.
    pub fn new(workflow_id: WorkflowId, suggestion_id: SuggestionId) -> (Self, Vec<WorkflowCommand>) {
        let machine = Self {
            workflow_id,
            suggestion_id: suggestion_id.clone(),
            state: ApprovalState::AwaitingDecision,
            decision: ApprovalDecision::default(),
        };
        (machine, vec![WorkflowCommand::NotifyPendingReview { suggestion_id }])
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn suggestion_id(&self) -> &SuggestionId {
        &self.suggestion_id
    }

    pub fn state(&self) -> ApprovalState {
        self.state
    }

    /// Apply one input. The first decision wins: any input arriving after a
    /// terminal state is an acknowledged no-op with no commands, never an
    /// error surfaced to the sender.
    pub fn apply(&mut self, input: WorkflowInput) -> Result<TransitionOutcome, WorkflowTransitionError> {
        if self.state.is_terminal() {
            return Ok(TransitionOutcome { state: self.state, changed: false, commands: Vec::new() });
        }

        match input {
            WorkflowInput::Signal(signal) => {
                if signal.reviewer_id().trim().is_empty() {
                    return Err(WorkflowTransitionError::EmptyReviewer {
                        workflow_id: self.workflow_id.0.clone(),
                    });
                }
                match signal {
                    ApprovalSignal::Approve { reviewer_id, note } => {
                        Ok(self.resolve(true, reviewer_id, note))
                    }
                    ApprovalSignal::Reject { reviewer_id, note } => {
                        Ok(self.resolve(false, reviewer_id, note))
                    }
                }
            }
            WorkflowInput::TimerFired => Ok(self.resolve(
                false,
                SYSTEM_REVIEWER.to_string(),
                Some(AUTO_REJECT_NOTE.to_string()),
            )),
        }
    }

    fn resolve(&mut self, approved: bool, reviewer_id: String, note: Option<String>) -> TransitionOutcome {
        self.state = if approved { ApprovalState::Approved } else { ApprovalState::Rejected };
        self.decision = ApprovalDecision {
            approved: Some(approved),
            reviewer_id: Some(reviewer_id.clone()),
            note: note.clone(),
        };

        let command = if approved {
            WorkflowCommand::ApplyApproved {
                suggestion_id: self.suggestion_id.clone(),
                reviewer_id,
                note,
            }
        } else {
            WorkflowCommand::ApplyRejected {
                suggestion_id: self.suggestion_id.clone(),
                reviewer_id,
                note,
            }
        };

        TransitionOutcome { state: self.state, changed: true, commands: vec![command] }
    }

    /// Read-only view for status queries.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            approved: self.decision.approved,
            reviewer_id: self.decision.reviewer_id.clone(),
            note: self.decision.note.clone(),
            awaiting_decision: self.state == ApprovalState::AwaitingDecision,
        }
    }

    /// Rebuild an instance by replaying recorded inputs in order. Commands
    /// produced during replay are discarded; whether they already ran is
    /// for the hosting runtime to track.
    pub fn replay(
        workflow_id: WorkflowId,
        suggestion_id: SuggestionId,
        inputs: impl IntoIterator<Item = WorkflowInput>,
    ) -> Result<Self, WorkflowTransitionError> {
        let (mut machine, _commands) = Self::new(workflow_id, suggestion_id);
        for input in inputs {
            machine.apply(input)?;
        }
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalWorkflow, AUTO_REJECT_NOTE, SYSTEM_REVIEWER};
    use crate::domain::suggestion::SuggestionId;
    use crate::workflow::states::{
        ApprovalSignal, ApprovalState, WorkflowCommand, WorkflowId, WorkflowInput,
        WorkflowTransitionError,
    };

    fn machine() -> ApprovalWorkflow {
        let (machine, commands) = ApprovalWorkflow::new(
            WorkflowId("wf-1".to_string()),
            SuggestionId("sug-1".to_string()),
        );
        assert!(matches!(commands.as_slice(), [WorkflowCommand::NotifyPendingReview { .. }]));
        machine
    }

    fn approve(reviewer: &str) -> WorkflowInput {
        WorkflowInput::Signal(ApprovalSignal::Approve {
            reviewer_id: reviewer.to_string(),
            note: Some("ok".to_string()),
        })
    }

    fn reject(reviewer: &str) -> WorkflowInput {
        WorkflowInput::Signal(ApprovalSignal::Reject {
            reviewer_id: reviewer.to_string(),
            note: None,
        })
    }

    #[test]
    fn approve_then_reject_keeps_first_decision() {
        let mut machine = machine();

        let outcome = machine.apply(approve("u1")).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.state, ApprovalState::Approved);
        assert!(matches!(
            outcome.commands.as_slice(),
            [WorkflowCommand::ApplyApproved { reviewer_id, .. }] if reviewer_id == "u1"
        ));

        let second = machine.apply(reject("u2")).unwrap();
        assert!(!second.changed);
        assert!(second.commands.is_empty());

        let status = machine.status();
        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert!(!status.awaiting_decision);
    }

    #[test]
    fn reject_then_approve_keeps_first_decision() {
        let mut machine = machine();

        let outcome = machine.apply(reject("u1")).unwrap();
        assert_eq!(outcome.state, ApprovalState::Rejected);

        let second = machine.apply(approve("u2")).unwrap();
        assert!(!second.changed);

        let status = machine.status();
        assert_eq!(status.approved, Some(false));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
    }

    #[test]
    fn timer_resolves_to_rejected_with_auto_note() {
        let mut machine = machine();

        let outcome = machine.apply(WorkflowInput::TimerFired).unwrap();
        assert_eq!(outcome.state, ApprovalState::Rejected);
        assert!(matches!(
            outcome.commands.as_slice(),
            [WorkflowCommand::ApplyRejected { reviewer_id, note, .. }]
                if reviewer_id == SYSTEM_REVIEWER && note.as_deref() == Some(AUTO_REJECT_NOTE)
        ));

        // A late signal after the timeout is silently ignored.
        let late = machine.apply(approve("u1")).unwrap();
        assert!(!late.changed);
        assert_eq!(machine.status().approved, Some(false));
    }

    #[test]
    fn empty_reviewer_is_rejected_without_state_change() {
        let mut machine = machine();

        let error = machine.apply(approve("  ")).unwrap_err();
        assert!(matches!(error, WorkflowTransitionError::EmptyReviewer { .. }));
        assert_eq!(machine.state(), ApprovalState::AwaitingDecision);
    }

    #[test]
    fn status_query_never_mutates() {
        let machine = machine();
        let before = machine.clone();

        let status = machine.status();
        assert!(status.awaiting_decision);
        assert_eq!(status.approved, None);
        assert_eq!(machine, before);
    }

    #[test]
    fn replay_reproduces_the_live_state() {
        let inputs = vec![approve("u1"), reject("u2"), WorkflowInput::TimerFired];

        let mut live = machine();
        for input in inputs.clone() {
            live.apply(input).unwrap();
        }

        let replayed = ApprovalWorkflow::replay(
            WorkflowId("wf-1".to_string()),
            SuggestionId("sug-1".to_string()),
            inputs,
        )
        .unwrap();

        assert_eq!(live, replayed);
        assert_eq!(replayed.status().reviewer_id.as_deref(), Some("u1"));
    }
}
