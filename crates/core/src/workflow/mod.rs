//! The durable approval workflow: a pure signal/timeout state machine
//! ([`machine`]) hosted by an event-sourced runtime ([`runtime`]) that
//! appends every input to a per-workflow log and replays it on rehydrate.

pub mod machine;
pub mod runtime;
pub mod states;

pub use machine::{ApprovalWorkflow, AUTO_REJECT_NOTE, SYSTEM_REVIEWER};
pub use runtime::{
    AwaitingWorkflow, InMemoryWorkflowStore, WorkflowLogEntry, WorkflowLogEvent, WorkflowService,
    WorkflowStore,
};
pub use states::{
    ApprovalDecision, ApprovalSignal, ApprovalState, StatusSnapshot, TransitionOutcome,
    WorkflowCommand, WorkflowId, WorkflowInput, WorkflowTransitionError,
};
