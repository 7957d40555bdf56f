pub mod activities;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod intake;
pub mod suggestions;
pub mod workflow;

pub use activities::{
    ActivityError, ActivityReport, ActivityRetryConfig, CasOutcome, EntityCommitter,
    InMemorySuggestionStore, Notifier, SuggestionStore, TerminalActivities,
};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::event::{CanonicalEvent, ChannelType, EventId, EventStatus};
pub use domain::suggestion::{
    clamp_confidence, Provenance, Suggestion, SuggestionId, SuggestionKind, SuggestionStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, StoreError};
pub use intake::{EventStore, InMemoryEventStore, IntakeService, RawMessage};
pub use suggestions::{
    AgentDraft, DedupIndex, ExistingMatch, InMemoryDedupIndex, SuggestionBuilder,
};
pub use workflow::{
    ApprovalSignal, ApprovalState, ApprovalWorkflow, StatusSnapshot, WorkflowCommand, WorkflowId,
    WorkflowInput, WorkflowService, WorkflowStore,
};
