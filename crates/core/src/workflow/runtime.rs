use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::activities::TerminalActivities;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::suggestion::SuggestionId;
use crate::errors::{ApplicationError, DomainError, StoreError};
use crate::workflow::machine::ApprovalWorkflow;
use crate::workflow::states::{
    ApprovalSignal, ApprovalState, StatusSnapshot, TransitionOutcome, WorkflowCommand, WorkflowId,
    WorkflowInput, WorkflowTransitionError,
};

/// Kinds of entries in the append-only per-workflow log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowLogEvent {
    Started,
    Signaled,
    TimedOut,
    Completed,
}

impl WorkflowLogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Signaled => "signaled",
            Self::TimedOut => "timed_out",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(Self::Started),
            "signaled" => Some(Self::Signaled),
            "timed_out" => Some(Self::TimedOut),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One durable log entry. `seq` is contiguous per workflow starting at 1;
/// the (workflow_id, seq) pair is unique in storage, so a crashed writer
/// retrying an append cannot fork the history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowLogEntry {
    pub workflow_id: WorkflowId,
    pub seq: i64,
    pub event: WorkflowLogEvent,
    pub payload_json: String,
    pub occurred_at: DateTime<Utc>,
}

/// A workflow whose log holds a `Started` entry but no `Completed` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwaitingWorkflow {
    pub workflow_id: WorkflowId,
    pub started_at: DateTime<Utc>,
}

/// Storage port for the workflow log.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn append(&self, entry: &WorkflowLogEntry) -> Result<(), StoreError>;
    async fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowLogEntry>, StoreError>;
    async fn list_awaiting(&self) -> Result<Vec<AwaitingWorkflow>, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct StartedPayload {
    suggestion_id: SuggestionId,
}

#[derive(Serialize, Deserialize)]
struct CompletedPayload {
    state: ApprovalState,
}

/// Replayed workflow state. `unfinished` carries the commands of a
/// terminal transition whose `Completed` entry never made it into the
/// log: the writer crashed or exhausted its activity retries between the
/// decision append and the terminal effects. The caller must re-run them
/// before handling any new input.
struct Rehydrated {
    machine: ApprovalWorkflow,
    next_seq: i64,
    unfinished: Vec<WorkflowCommand>,
}

/// Event-sourced host for [`ApprovalWorkflow`] instances. Every input is
/// appended to the log before its effects run, and an instance is always
/// rehydrated by replaying its log, so state survives process restarts.
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    activities: Arc<TerminalActivities>,
    audit: Arc<dyn AuditSink>,
    decision_timeout: Duration,
    notify_on_start: bool,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        activities: Arc<TerminalActivities>,
        audit: Arc<dyn AuditSink>,
        decision_timeout: Duration,
        notify_on_start: bool,
    ) -> Self {
        Self { store, activities, audit, decision_timeout, notify_on_start }
    }

    /// Open an approval workflow for a pending suggestion and link the
    /// suggestion row to it.
    pub async fn start_approval(
        &self,
        suggestion_id: &SuggestionId,
    ) -> Result<WorkflowId, ApplicationError> {
        let workflow_id = WorkflowId(Uuid::new_v4().to_string());
        let (_machine, commands) =
            ApprovalWorkflow::new(workflow_id.clone(), suggestion_id.clone());

        let payload = serde_json::to_string(&StartedPayload { suggestion_id: suggestion_id.clone() })
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        self.store
            .append(&WorkflowLogEntry {
                workflow_id: workflow_id.clone(),
                seq: 1,
                event: WorkflowLogEvent::Started,
                payload_json: payload,
                occurred_at: Utc::now(),
            })
            .await?;

        self.activities.suggestions().attach_workflow(suggestion_id, &workflow_id.0).await?;

        if self.notify_on_start {
            self.run_commands(&workflow_id, &commands).await?;
        }

        self.audit.emit(AuditEvent::new(
            None,
            Some(workflow_id.0.clone()),
            suggestion_id.0.clone(),
            "workflow.started",
            AuditCategory::Workflow,
            "approval-runtime",
            AuditOutcome::Success,
        ));
        info!(
            event_name = "workflow.started",
            workflow_id = %workflow_id.0,
            suggestion_id = %suggestion_id.0,
            "approval workflow opened"
        );

        Ok(workflow_id)
    }

    /// Deliver a reviewer signal. Signals arriving after the workflow is
    /// terminal are acknowledged and ignored, never errors. A second
    /// writer losing the append race gets the standing decision back,
    /// same as a late signal.
    pub async fn signal(
        &self,
        workflow_id: &WorkflowId,
        signal: ApprovalSignal,
    ) -> Result<StatusSnapshot, ApplicationError> {
        let Rehydrated { mut machine, mut next_seq, unfinished } =
            self.rehydrate(workflow_id).await?;
        if !unfinished.is_empty() {
            self.recover(&machine, next_seq, unfinished).await?;
            next_seq += 1;
        }

        let input = WorkflowInput::Signal(signal);
        let outcome = machine.apply(input.clone()).map_err(DomainError::from)?;

        if !outcome.changed {
            warn!(
                event_name = "workflow.signal_ignored",
                workflow_id = %workflow_id.0,
                reviewer = input_reviewer(&input),
                "signal arrived after terminal state; first decision stands"
            );
            self.audit.emit(AuditEvent::new(
                None,
                Some(workflow_id.0.clone()),
                machine.suggestion_id().0.clone(),
                "workflow.signal_ignored",
                AuditCategory::Workflow,
                "approval-runtime",
                AuditOutcome::Ignored,
            ));
            return Ok(machine.status());
        }

        let payload = serde_json::to_string(&input)
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        let entry = WorkflowLogEntry {
            workflow_id: workflow_id.clone(),
            seq: next_seq,
            event: WorkflowLogEvent::Signaled,
            payload_json: payload,
            occurred_at: Utc::now(),
        };
        match self.store.append(&entry).await {
            Ok(()) => {}
            // A concurrent signal or timer claimed this seq first; that
            // decision stands and this one is a late no-op.
            Err(StoreError::DuplicateKey(_)) => {
                warn!(
                    event_name = "workflow.signal_ignored",
                    workflow_id = %workflow_id.0,
                    reviewer = input_reviewer(&input),
                    "a concurrent decision was recorded first; this signal is ignored"
                );
                self.audit.emit(AuditEvent::new(
                    None,
                    Some(workflow_id.0.clone()),
                    machine.suggestion_id().0.clone(),
                    "workflow.signal_ignored",
                    AuditCategory::Workflow,
                    "approval-runtime",
                    AuditOutcome::Ignored,
                ));
                let standing = self.rehydrate(workflow_id).await?;
                return Ok(standing.machine.status());
            }
            Err(error) => return Err(error.into()),
        }

        self.finish(&machine, next_seq + 1, &outcome, "workflow.signaled").await?;
        Ok(machine.status())
    }

    /// Read-only status query; never mutates the workflow.
    pub async fn query_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<StatusSnapshot, ApplicationError> {
        let rehydrated = self.rehydrate(workflow_id).await?;
        Ok(rehydrated.machine.status())
    }

    /// Resolve every awaiting workflow whose decision window has elapsed,
    /// and re-run the terminal effects of any decided workflow that never
    /// completed them. Called periodically by the host; returns the
    /// workflows it resolved.
    pub async fn fire_due_timers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowId>, ApplicationError> {
        let mut resolved = Vec::new();

        for awaiting in self.store.list_awaiting().await? {
            let Rehydrated { mut machine, next_seq, unfinished } =
                self.rehydrate(&awaiting.workflow_id).await?;
            if !unfinished.is_empty() {
                self.recover(&machine, next_seq, unfinished).await?;
                resolved.push(awaiting.workflow_id);
                continue;
            }

            if awaiting.started_at + self.decision_timeout > now {
                continue;
            }

            let outcome = machine.apply(WorkflowInput::TimerFired).map_err(DomainError::from)?;
            if !outcome.changed {
                continue;
            }

            let payload = serde_json::to_string(&WorkflowInput::TimerFired)
                .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
            let entry = WorkflowLogEntry {
                workflow_id: awaiting.workflow_id.clone(),
                seq: next_seq,
                event: WorkflowLogEvent::TimedOut,
                payload_json: payload,
                occurred_at: now,
            };
            match self.store.append(&entry).await {
                Ok(()) => {}
                // A reviewer decided while the timer was firing; the
                // signal path owns the resolution.
                Err(StoreError::DuplicateKey(_)) => {
                    warn!(
                        event_name = "workflow.timer_ignored",
                        workflow_id = %awaiting.workflow_id.0,
                        "a decision landed while the timer was firing"
                    );
                    continue;
                }
                Err(error) => return Err(error.into()),
            }

            self.finish(&machine, next_seq + 1, &outcome, "workflow.timed_out").await?;
            resolved.push(awaiting.workflow_id);
        }

        Ok(resolved)
    }

    /// Re-run the terminal effects of a decided workflow whose log lacks
    /// a `Completed` entry. The activities are conditional updates, so
    /// anything a partial earlier run already applied is absorbed.
    async fn recover(
        &self,
        machine: &ApprovalWorkflow,
        completed_seq: i64,
        commands: Vec<WorkflowCommand>,
    ) -> Result<(), ApplicationError> {
        warn!(
            event_name = "workflow.recovering",
            workflow_id = %machine.workflow_id().0,
            "decided workflow has unfinished terminal effects; re-running them"
        );
        let outcome =
            TransitionOutcome { state: machine.state(), changed: true, commands };
        self.finish(machine, completed_seq, &outcome, "workflow.recovered").await
    }

    async fn finish(
        &self,
        machine: &ApprovalWorkflow,
        completed_seq: i64,
        outcome: &TransitionOutcome,
        event_type: &str,
    ) -> Result<(), ApplicationError> {
        self.run_commands(machine.workflow_id(), &outcome.commands).await?;

        let payload = serde_json::to_string(&CompletedPayload { state: outcome.state })
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        self.store
            .append(&WorkflowLogEntry {
                workflow_id: machine.workflow_id().clone(),
                seq: completed_seq,
                event: WorkflowLogEvent::Completed,
                payload_json: payload,
                occurred_at: Utc::now(),
            })
            .await?;

        self.audit.emit(
            AuditEvent::new(
                None,
                Some(machine.workflow_id().0.clone()),
                machine.suggestion_id().0.clone(),
                event_type,
                AuditCategory::Workflow,
                "approval-runtime",
                AuditOutcome::Success,
            )
            .with_metadata("state", outcome.state.as_str()),
        );
        info!(
            event_name = event_type,
            workflow_id = %machine.workflow_id().0,
            state = outcome.state.as_str(),
            "approval workflow resolved"
        );
        Ok(())
    }

    async fn run_commands(
        &self,
        workflow_id: &WorkflowId,
        commands: &[WorkflowCommand],
    ) -> Result<(), ApplicationError> {
        for command in commands {
            match command {
                WorkflowCommand::NotifyPendingReview { suggestion_id } => {
                    self.activities.notify_pending_review(suggestion_id, &workflow_id.0).await;
                }
                WorkflowCommand::ApplyApproved { suggestion_id, reviewer_id, note } => {
                    self.activities
                        .apply_approved(suggestion_id, &workflow_id.0, reviewer_id, note.as_deref())
                        .await
                        .map_err(|error| ApplicationError::Integration(error.to_string()))?;
                }
                WorkflowCommand::ApplyRejected { suggestion_id, reviewer_id, note } => {
                    self.activities
                        .apply_rejected(suggestion_id, &workflow_id.0, reviewer_id, note.as_deref())
                        .await
                        .map_err(|error| ApplicationError::Integration(error.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn rehydrate(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Rehydrated, ApplicationError> {
        let entries = self.store.load(workflow_id).await?;
        let first = entries.first().ok_or_else(|| {
            ApplicationError::Domain(DomainError::InvariantViolation(format!(
                "unknown workflow {}",
                workflow_id.0
            )))
        })?;

        if first.event != WorkflowLogEvent::Started {
            return Err(inconsistent(workflow_id, first.seq, "log does not begin with started"));
        }
        let started: StartedPayload = serde_json::from_str(&first.payload_json)
            .map_err(|error| StoreError::Decode(error.to_string()))?;

        let (mut machine, _commands) =
            ApprovalWorkflow::new(workflow_id.clone(), started.suggestion_id);

        let mut next_seq = first.seq + 1;
        let mut unfinished = Vec::new();
        for entry in &entries[1..] {
            match entry.event {
                WorkflowLogEvent::Signaled | WorkflowLogEvent::TimedOut => {
                    let input: WorkflowInput = serde_json::from_str(&entry.payload_json)
                        .map_err(|error| StoreError::Decode(error.to_string()))?;
                    let outcome = machine.apply(input).map_err(DomainError::from)?;
                    if outcome.changed {
                        unfinished = outcome.commands;
                    }
                }
                // Completed marks the commands of the preceding decision
                // as executed; without it they are still owed.
                WorkflowLogEvent::Completed => unfinished.clear(),
                WorkflowLogEvent::Started => {
                    return Err(inconsistent(workflow_id, entry.seq, "duplicate started entry"));
                }
            }
            next_seq = entry.seq + 1;
        }

        Ok(Rehydrated { machine, next_seq, unfinished })
    }
}

fn inconsistent(workflow_id: &WorkflowId, seq: i64, detail: &str) -> ApplicationError {
    ApplicationError::Domain(DomainError::WorkflowTransition(
        WorkflowTransitionError::InconsistentLog {
            workflow_id: workflow_id.0.clone(),
            seq,
            detail: detail.to_string(),
        },
    ))
}

fn input_reviewer(input: &WorkflowInput) -> &str {
    match input {
        WorkflowInput::Signal(signal) => signal.reviewer_id(),
        WorkflowInput::TimerFired => "system",
    }
}

/// Map-backed log used by tests and un-wired deployments.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    logs: Arc<Mutex<BTreeMap<String, Vec<WorkflowLogEntry>>>>,
}

impl InMemoryWorkflowStore {
    fn guard(&self) -> MutexGuard<'_, BTreeMap<String, Vec<WorkflowLogEntry>>> {
        match self.logs.lock() {
            Ok(logs) => logs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn append(&self, entry: &WorkflowLogEntry) -> Result<(), StoreError> {
        let mut logs = self.guard();
        let log = logs.entry(entry.workflow_id.0.clone()).or_default();
        if log.iter().any(|existing| existing.seq == entry.seq) {
            return Err(StoreError::DuplicateKey(format!(
                "workflow {} seq {}",
                entry.workflow_id.0, entry.seq
            )));
        }
        log.push(entry.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowLogEntry>, StoreError> {
        let mut entries = self.guard().get(&workflow_id.0).cloned().unwrap_or_default();
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    async fn list_awaiting(&self) -> Result<Vec<AwaitingWorkflow>, StoreError> {
        let logs = self.guard();
        let mut awaiting = Vec::new();
        for entries in logs.values() {
            let started = entries.iter().find(|entry| entry.event == WorkflowLogEvent::Started);
            let completed = entries.iter().any(|entry| entry.event == WorkflowLogEvent::Completed);
            if let (Some(started), false) = (started, completed) {
                awaiting.push(AwaitingWorkflow {
                    workflow_id: started.workflow_id.clone(),
                    started_at: started.occurred_at,
                });
            }
        }
        Ok(awaiting)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Duration;

    use super::{
        AwaitingWorkflow, InMemoryWorkflowStore, WorkflowId, WorkflowLogEntry, WorkflowLogEvent,
        WorkflowService, WorkflowStore,
    };
    use crate::activities::{
        ActivityError, ActivityRetryConfig, EntityCommitter, InMemorySuggestionStore, Notifier,
        SuggestionStore, TerminalActivities,
    };
    use crate::audit::InMemoryAuditSink;
    use crate::domain::event::{ChannelType, EventId};
    use crate::domain::suggestion::{
        Provenance, Suggestion, SuggestionId, SuggestionKind, SuggestionStatus,
    };
    use crate::errors::{ApplicationError, StoreError};
    use crate::workflow::machine::AUTO_REJECT_NOTE;
    use crate::workflow::states::{ApprovalSignal, WorkflowInput};

    struct StubCommitter {
        commits: AtomicU32,
    }

    #[async_trait]
    impl EntityCommitter for StubCommitter {
        async fn commit(&self, _suggestion: &Suggestion) -> Result<Vec<String>, ActivityError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["entity-1".to_string()])
        }
    }

    /// Errors until `fail_first` attempts have been burned, then commits.
    struct FlakyCommitter {
        fail_first: AtomicU32,
        commits: AtomicU32,
    }

    #[async_trait]
    impl EntityCommitter for FlakyCommitter {
        async fn commit(&self, _suggestion: &Suggestion) -> Result<Vec<String>, ActivityError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(ActivityError::Commit("storage briefly offline".to_string()));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["entity-1".to_string()])
        }
    }

    /// Lands a prepared competing entry right before the next append,
    /// reproducing a second writer winning the same sequence number.
    struct RacingStore {
        inner: InMemoryWorkflowStore,
        competitor: Mutex<Option<WorkflowLogEntry>>,
    }

    #[async_trait]
    impl WorkflowStore for RacingStore {
        async fn append(&self, entry: &WorkflowLogEntry) -> Result<(), StoreError> {
            let competing = match self.competitor.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(competing) = competing {
                self.inner.append(&competing).await?;
            }
            self.inner.append(entry).await
        }

        async fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowLogEntry>, StoreError> {
            self.inner.load(workflow_id).await
        }

        async fn list_awaiting(&self) -> Result<Vec<AwaitingWorkflow>, StoreError> {
            self.inner.list_awaiting().await
        }
    }

    struct StubNotifier {
        notifications: AtomicU32,
    }

    #[async_trait]
    impl Notifier for StubNotifier {
        async fn pending_review(&self, _suggestion: &Suggestion) -> Result<(), ActivityError> {
            self.notifications.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        service: WorkflowService,
        suggestions: InMemorySuggestionStore,
        store: InMemoryWorkflowStore,
        committer: Arc<StubCommitter>,
        notifier: Arc<StubNotifier>,
        audit: InMemoryAuditSink,
    }

    fn suggestion() -> Suggestion {
        Suggestion::new(
            SuggestionKind::NewEntity,
            BTreeMap::from([(
                "name".to_string(),
                serde_json::Value::String("Acme GmbH".to_string()),
            )]),
            0.8,
            Provenance {
                trigger_event_id: EventId("evt-1".to_string()),
                trigger_excerpt: "add Acme".to_string(),
                source_channel: ChannelType::Mail,
            },
            None,
            None,
        )
    }

    async fn harness(timeout: Duration) -> (Harness, SuggestionId) {
        let suggestions = InMemorySuggestionStore::default();
        let suggestion = suggestion();
        let id = suggestion.id.clone();
        suggestions.insert(&suggestion).await.unwrap();

        let committer = Arc::new(StubCommitter { commits: AtomicU32::new(0) });
        let notifier = Arc::new(StubNotifier { notifications: AtomicU32::new(0) });
        let audit = InMemoryAuditSink::default();
        let store = InMemoryWorkflowStore::default();

        let activities = Arc::new(TerminalActivities::new(
            Arc::new(suggestions.clone()),
            Arc::clone(&committer) as Arc<dyn EntityCommitter>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::new(audit.clone()),
            ActivityRetryConfig { max_attempts: 3, base_delay_secs: 0, multiplier: 2 },
        ));
        let service = WorkflowService::new(
            Arc::new(store.clone()),
            activities,
            Arc::new(audit.clone()),
            timeout,
            true,
        );

        (Harness { service, suggestions, store, committer, notifier, audit }, id)
    }

    fn approve(reviewer: &str) -> ApprovalSignal {
        ApprovalSignal::Approve { reviewer_id: reviewer.to_string(), note: Some("ok".to_string()) }
    }

    fn reject(reviewer: &str) -> ApprovalSignal {
        ApprovalSignal::Reject { reviewer_id: reviewer.to_string(), note: None }
    }

    #[tokio::test]
    async fn approval_flow_commits_and_records_reviewer() {
        let (harness, suggestion_id) = harness(Duration::days(7)).await;

        let workflow_id = harness.service.start_approval(&suggestion_id).await.unwrap();
        assert_eq!(harness.notifier.notifications.load(Ordering::SeqCst), 1);

        let linked = harness.suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(linked.workflow_id.as_deref(), Some(workflow_id.0.as_str()));

        let status = harness.service.signal(&workflow_id, approve("u1")).await.unwrap();
        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert!(!status.awaiting_decision);
        assert_eq!(harness.committer.commits.load(Ordering::SeqCst), 1);

        let stored = harness.suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Approved);
        assert_eq!(stored.result_entity_ids, vec!["entity-1".to_string()]);
    }

    #[tokio::test]
    async fn second_decision_is_ignored_and_first_stands() {
        let (harness, suggestion_id) = harness(Duration::days(7)).await;
        let workflow_id = harness.service.start_approval(&suggestion_id).await.unwrap();

        harness.service.signal(&workflow_id, approve("u1")).await.unwrap();
        let status = harness.service.signal(&workflow_id, reject("u2")).await.unwrap();

        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert_eq!(harness.committer.commits.load(Ordering::SeqCst), 1);
        assert!(harness
            .audit
            .events()
            .iter()
            .any(|event| event.event_type == "workflow.signal_ignored"));
    }

    #[tokio::test]
    async fn reject_first_wins_in_reverse_order() {
        let (harness, suggestion_id) = harness(Duration::days(7)).await;
        let workflow_id = harness.service.start_approval(&suggestion_id).await.unwrap();

        harness.service.signal(&workflow_id, reject("u1")).await.unwrap();
        let status = harness.service.signal(&workflow_id, approve("u2")).await.unwrap();

        assert_eq!(status.approved, Some(false));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert_eq!(harness.committer.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn due_timer_auto_rejects_exactly_once() {
        let (harness, suggestion_id) = harness(Duration::seconds(0)).await;
        let workflow_id = harness.service.start_approval(&suggestion_id).await.unwrap();

        let resolved = harness.service.fire_due_timers(chrono::Utc::now()).await.unwrap();
        assert_eq!(resolved, vec![workflow_id.clone()]);

        let status = harness.service.query_status(&workflow_id).await.unwrap();
        assert_eq!(status.approved, Some(false));
        assert_eq!(status.note.as_deref(), Some(AUTO_REJECT_NOTE));

        let stored = harness.suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Rejected);

        // A second sweep finds nothing left to resolve.
        let again = harness.service.fire_due_timers(chrono::Utc::now()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(harness.committer.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timer_does_not_fire_before_the_window_elapses() {
        let (harness, suggestion_id) = harness(Duration::days(7)).await;
        harness.service.start_approval(&suggestion_id).await.unwrap();

        let resolved = harness.service.fire_due_timers(chrono::Utc::now()).await.unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn status_survives_a_restart_of_the_service() {
        let (harness, suggestion_id) = harness(Duration::days(7)).await;
        let workflow_id = harness.service.start_approval(&suggestion_id).await.unwrap();
        harness.service.signal(&workflow_id, approve("u1")).await.unwrap();

        // A fresh service over the same log sees the same resolved state.
        let activities = Arc::new(TerminalActivities::new(
            Arc::new(harness.suggestions.clone()),
            Arc::new(StubCommitter { commits: AtomicU32::new(0) }),
            Arc::new(StubNotifier { notifications: AtomicU32::new(0) }),
            Arc::new(InMemoryAuditSink::default()),
            ActivityRetryConfig::default(),
        ));
        let rebooted = WorkflowService::new(
            Arc::new(harness.store.clone()),
            activities,
            Arc::new(InMemoryAuditSink::default()),
            Duration::days(7),
            true,
        );

        let status = rebooted.query_status(&workflow_id).await.unwrap();
        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn query_on_unknown_workflow_is_an_error() {
        let (harness, _suggestion_id) = harness(Duration::days(7)).await;
        let missing = super::WorkflowId("wf-missing".to_string());

        let error = harness.service.query_status(&missing).await.unwrap_err();
        assert!(matches!(error, crate::errors::ApplicationError::Domain(_)));
    }

    async fn flaky_harness(
        fail_first: u32,
    ) -> (WorkflowService, InMemorySuggestionStore, Arc<FlakyCommitter>, SuggestionId) {
        let suggestions = InMemorySuggestionStore::default();
        let pending = suggestion();
        let id = pending.id.clone();
        suggestions.insert(&pending).await.unwrap();

        let committer = Arc::new(FlakyCommitter {
            fail_first: AtomicU32::new(fail_first),
            commits: AtomicU32::new(0),
        });
        let audit = InMemoryAuditSink::default();
        let activities = Arc::new(TerminalActivities::new(
            Arc::new(suggestions.clone()),
            Arc::clone(&committer) as Arc<dyn EntityCommitter>,
            Arc::new(StubNotifier { notifications: AtomicU32::new(0) }),
            Arc::new(audit.clone()),
            ActivityRetryConfig { max_attempts: 3, base_delay_secs: 0, multiplier: 2 },
        ));
        let service = WorkflowService::new(
            Arc::new(InMemoryWorkflowStore::default()),
            activities,
            Arc::new(audit),
            Duration::days(7),
            true,
        );

        (service, suggestions, committer, id)
    }

    #[tokio::test]
    async fn interrupted_terminal_effects_are_rerun_by_the_sweep() {
        // The commit fails for the whole retry budget, then heals.
        let (service, suggestions, committer, suggestion_id) = flaky_harness(3).await;
        let workflow_id = service.start_approval(&suggestion_id).await.unwrap();

        let error = service.signal(&workflow_id, approve("u1")).await.unwrap_err();
        assert!(matches!(error, ApplicationError::Integration(_)));

        // The decision is durable even though its effects never ran.
        let status = service.query_status(&workflow_id).await.unwrap();
        assert_eq!(status.approved, Some(true));
        let stored = suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Pending);

        // The sweep re-runs the commit regardless of the decision window.
        let resolved = service.fire_due_timers(chrono::Utc::now()).await.unwrap();
        assert_eq!(resolved, vec![workflow_id.clone()]);
        assert_eq!(committer.commits.load(Ordering::SeqCst), 1);
        let stored = suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Approved);
        assert_eq!(stored.result_entity_ids, vec!["entity-1".to_string()]);

        // Nothing left for a second sweep; later signals see the decision.
        assert!(service.fire_due_timers(chrono::Utc::now()).await.unwrap().is_empty());
        let standing = service.signal(&workflow_id, reject("u2")).await.unwrap();
        assert_eq!(standing.approved, Some(true));
        assert_eq!(standing.reviewer_id.as_deref(), Some("u1"));
        assert_eq!(committer.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_signal_repairs_an_interrupted_resolution() {
        let (service, suggestions, committer, suggestion_id) = flaky_harness(3).await;
        let workflow_id = service.start_approval(&suggestion_id).await.unwrap();
        service.signal(&workflow_id, approve("u1")).await.unwrap_err();

        // The next signal finishes the first decision before being
        // ignored as a late no-op.
        let status = service.signal(&workflow_id, reject("u2")).await.unwrap();

        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert_eq!(committer.commits.load(Ordering::SeqCst), 1);
        let stored = suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Approved);
    }

    #[tokio::test]
    async fn losing_a_signal_race_returns_the_standing_decision() {
        let suggestions = InMemorySuggestionStore::default();
        let pending = suggestion();
        let suggestion_id = pending.id.clone();
        suggestions.insert(&pending).await.unwrap();

        let committer = Arc::new(StubCommitter { commits: AtomicU32::new(0) });
        let audit = InMemoryAuditSink::default();
        let store = Arc::new(RacingStore {
            inner: InMemoryWorkflowStore::default(),
            competitor: Mutex::new(None),
        });
        let activities = Arc::new(TerminalActivities::new(
            Arc::new(suggestions.clone()),
            Arc::clone(&committer) as Arc<dyn EntityCommitter>,
            Arc::new(StubNotifier { notifications: AtomicU32::new(0) }),
            Arc::new(audit.clone()),
            ActivityRetryConfig { max_attempts: 3, base_delay_secs: 0, multiplier: 2 },
        ));
        let service = WorkflowService::new(
            Arc::clone(&store) as Arc<dyn WorkflowStore>,
            activities,
            Arc::new(audit.clone()),
            Duration::days(7),
            true,
        );

        let workflow_id = service.start_approval(&suggestion_id).await.unwrap();

        // An approval from another writer claims seq 2 first.
        let competing = WorkflowLogEntry {
            workflow_id: workflow_id.clone(),
            seq: 2,
            event: WorkflowLogEvent::Signaled,
            payload_json: serde_json::to_string(&WorkflowInput::Signal(approve("u1"))).unwrap(),
            occurred_at: chrono::Utc::now(),
        };
        *store.competitor.lock().unwrap() = Some(competing);

        let status = service.signal(&workflow_id, reject("u2")).await.unwrap();
        assert_eq!(status.approved, Some(true));
        assert_eq!(status.reviewer_id.as_deref(), Some("u1"));
        assert!(audit
            .events()
            .iter()
            .any(|event| event.event_type == "workflow.signal_ignored"));

        // The winner's effects were never run; the sweep finishes them.
        let resolved = service.fire_due_timers(chrono::Utc::now()).await.unwrap();
        assert_eq!(resolved, vec![workflow_id]);
        assert_eq!(committer.commits.load(Ordering::SeqCst), 1);
        let stored = suggestions.find_by_id(&suggestion_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Approved);
    }

    #[tokio::test]
    async fn log_appends_enforce_unique_sequence() {
        let store = InMemoryWorkflowStore::default();
        let entry = super::WorkflowLogEntry {
            workflow_id: super::WorkflowId("wf-1".to_string()),
            seq: 1,
            event: super::WorkflowLogEvent::Started,
            payload_json: "{}".to_string(),
            occurred_at: chrono::Utc::now(),
        };

        store.append(&entry).await.unwrap();
        let error = store.append(&entry).await.unwrap_err();
        assert!(matches!(error, crate::errors::StoreError::DuplicateKey(_)));
    }
}
