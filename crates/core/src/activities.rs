use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::suggestion::{Suggestion, SuggestionId, SuggestionStatus};
use crate::errors::StoreError;

/// Outcome of the conditional review update. `NotPending` means another
/// writer already resolved the suggestion; the caller re-reads and treats
/// the prior outcome as authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    NotPending,
}

/// Storage port for suggestions. `complete_review` is a conditional
/// update, applied only while the row is still pending, which closes the
/// race between two activity attempts resolving the same suggestion.
#[async_trait]
pub trait SuggestionStore: Send + Sync {
    async fn insert(&self, suggestion: &Suggestion) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: &SuggestionId) -> Result<Option<Suggestion>, StoreError>;
    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Suggestion>, StoreError>;
    async fn attach_workflow(
        &self,
        id: &SuggestionId,
        workflow_id: &str,
    ) -> Result<(), StoreError>;
    async fn complete_review(
        &self,
        id: &SuggestionId,
        outcome: SuggestionStatus,
        reviewer: &str,
        note: Option<&str>,
        result_entity_ids: &[String],
    ) -> Result<CasOutcome, StoreError>;
}

/// Boundary to business-entity storage. Called only from terminal
/// activities, never from the workflow machine itself.
#[async_trait]
pub trait EntityCommitter: Send + Sync {
    async fn commit(&self, suggestion: &Suggestion) -> Result<Vec<String>, ActivityError>;
}

/// Best-effort outbound notification boundary.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn pending_review(&self, suggestion: &Suggestion) -> Result<(), ActivityError>;
}

#[derive(Clone, Debug, Error)]
pub enum ActivityError {
    #[error("suggestion {0} not found")]
    SuggestionNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity commit failed: {0}")]
    Commit(String),
    #[error("notification failed: {0}")]
    Notify(String),
    #[error("activity failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ActivityError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store(StoreError::Unavailable(_)) => true,
            Self::Commit(_) | Self::Notify(_) => true,
            _ => false,
        }
    }
}

/// Result of one terminal activity. `already_terminal` marks the no-op
/// path where a prior attempt (or a racing one) had resolved the
/// suggestion first; `created_entity_ids` then carries that prior result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityReport {
    pub success: bool,
    pub created_entity_ids: Vec<String>,
    pub already_terminal: bool,
}

/// Bounded exponential backoff: `base * multiplier^(attempt - 1)`.
#[derive(Clone, Copy, Debug)]
pub struct ActivityRetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub multiplier: u64,
}

impl Default for ActivityRetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_secs: 1, multiplier: 2 }
    }
}

impl ActivityRetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        Duration::from_secs(self.base_delay_secs.saturating_mul(factor))
    }
}

/// The retried, idempotency-checked side effects executed when a workflow
/// reaches a terminal state.
pub struct TerminalActivities {
    suggestions: Arc<dyn SuggestionStore>,
    committer: Arc<dyn EntityCommitter>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    retry: ActivityRetryConfig,
}

impl TerminalActivities {
    pub fn new(
        suggestions: Arc<dyn SuggestionStore>,
        committer: Arc<dyn EntityCommitter>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        retry: ActivityRetryConfig,
    ) -> Self {
        Self { suggestions, committer, notifier, audit, retry }
    }

    pub fn suggestions(&self) -> Arc<dyn SuggestionStore> {
        Arc::clone(&self.suggestions)
    }

    /// Commit the approved suggestion to business storage, then mark it
    /// approved. Idempotent: an already-terminal suggestion returns the
    /// prior result without touching storage again.
    pub async fn apply_approved(
        &self,
        suggestion_id: &SuggestionId,
        workflow_id: &str,
        reviewer_id: &str,
        note: Option<&str>,
    ) -> Result<ActivityReport, ActivityError> {
        let report = self
            .with_retries("apply_approved", || {
                self.try_apply_approved(suggestion_id, reviewer_id, note)
            })
            .await;
        self.audit_terminal("activity.apply_approved", suggestion_id, workflow_id, &report);
        report
    }

    /// Mark the suggestion rejected without touching business storage.
    pub async fn apply_rejected(
        &self,
        suggestion_id: &SuggestionId,
        workflow_id: &str,
        reviewer_id: &str,
        note: Option<&str>,
    ) -> Result<ActivityReport, ActivityError> {
        let report = self
            .with_retries("apply_rejected", || {
                self.try_apply_rejected(suggestion_id, reviewer_id, note)
            })
            .await;
        self.audit_terminal("activity.apply_rejected", suggestion_id, workflow_id, &report);
        report
    }

    /// One-shot notification at workflow start. Failure is logged and
    /// audited but never blocks the workflow.
    pub async fn notify_pending_review(&self, suggestion_id: &SuggestionId, workflow_id: &str) {
        let result = match self.suggestions.find_by_id(suggestion_id).await {
            Ok(Some(suggestion)) => self.notifier.pending_review(&suggestion).await,
            Ok(None) => Err(ActivityError::SuggestionNotFound(suggestion_id.0.clone())),
            Err(error) => Err(ActivityError::Store(error)),
        };

        let outcome = match result {
            Ok(()) => AuditOutcome::Success,
            Err(error) => {
                warn!(
                    event_name = "activity.notify_failed",
                    suggestion_id = %suggestion_id.0,
                    workflow_id,
                    error = %error,
                    "pending-review notification failed; continuing"
                );
                AuditOutcome::Failed
            }
        };

        self.audit.emit(AuditEvent::new(
            None,
            Some(workflow_id.to_string()),
            suggestion_id.0.clone(),
            "activity.notify_pending_review",
            AuditCategory::Activity,
            "terminal-activities",
            outcome,
        ));
    }

    async fn try_apply_approved(
        &self,
        suggestion_id: &SuggestionId,
        reviewer_id: &str,
        note: Option<&str>,
    ) -> Result<ActivityReport, ActivityError> {
        let suggestion = self
            .suggestions
            .find_by_id(suggestion_id)
            .await?
            .ok_or_else(|| ActivityError::SuggestionNotFound(suggestion_id.0.clone()))?;

        if suggestion.is_terminal() {
            return Ok(ActivityReport {
                success: true,
                created_entity_ids: suggestion.result_entity_ids,
                already_terminal: true,
            });
        }

        let created = self.committer.commit(&suggestion).await?;
        let cas = self
            .suggestions
            .complete_review(suggestion_id, SuggestionStatus::Approved, reviewer_id, note, &created)
            .await?;

        match cas {
            CasOutcome::Applied => Ok(ActivityReport {
                success: true,
                created_entity_ids: created,
                already_terminal: false,
            }),
            // Lost the race: another attempt resolved it first. Its result
            // is authoritative.
            CasOutcome::NotPending => {
                let current = self
                    .suggestions
                    .find_by_id(suggestion_id)
                    .await?
                    .ok_or_else(|| ActivityError::SuggestionNotFound(suggestion_id.0.clone()))?;
                Ok(ActivityReport {
                    success: true,
                    created_entity_ids: current.result_entity_ids,
                    already_terminal: true,
                })
            }
        }
    }

    async fn try_apply_rejected(
        &self,
        suggestion_id: &SuggestionId,
        reviewer_id: &str,
        note: Option<&str>,
    ) -> Result<ActivityReport, ActivityError> {
        let suggestion = self
            .suggestions
            .find_by_id(suggestion_id)
            .await?
            .ok_or_else(|| ActivityError::SuggestionNotFound(suggestion_id.0.clone()))?;

        if suggestion.is_terminal() {
            return Ok(ActivityReport {
                success: true,
                created_entity_ids: suggestion.result_entity_ids,
                already_terminal: true,
            });
        }

        self.suggestions
            .complete_review(suggestion_id, SuggestionStatus::Rejected, reviewer_id, note, &[])
            .await?;

        Ok(ActivityReport { success: true, created_entity_ids: Vec::new(), already_terminal: false })
    }

    async fn with_retries<F, Fut>(
        &self,
        activity: &str,
        mut operation: F,
    ) -> Result<ActivityReport, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<ActivityReport, ActivityError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(report) => return Ok(report),
                Err(error) if error.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        event_name = "activity.retrying",
                        activity,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "transient activity failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) if error.is_transient() => {
                    return Err(ActivityError::RetriesExhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn audit_terminal(
        &self,
        event_type: &str,
        suggestion_id: &SuggestionId,
        workflow_id: &str,
        report: &Result<ActivityReport, ActivityError>,
    ) {
        let outcome = match report {
            Ok(report) if report.already_terminal => AuditOutcome::Ignored,
            Ok(_) => AuditOutcome::Success,
            Err(_) => AuditOutcome::Failed,
        };

        let mut event = AuditEvent::new(
            None,
            Some(workflow_id.to_string()),
            suggestion_id.0.clone(),
            event_type,
            AuditCategory::Activity,
            "terminal-activities",
            outcome,
        );
        if let Ok(report) = report {
            event = event.with_metadata("created_entities", report.created_entity_ids.len().to_string());
        }
        self.audit.emit(event);
    }
}

/// Map-backed store used by tests and by deployments that have not wired
/// a database yet.
#[derive(Clone, Default)]
pub struct InMemorySuggestionStore {
    rows: Arc<Mutex<BTreeMap<String, Suggestion>>>,
}

impl InMemorySuggestionStore {
    fn guard(&self) -> MutexGuard<'_, BTreeMap<String, Suggestion>> {
        match self.rows.lock() {
            Ok(rows) => rows,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> Vec<Suggestion> {
        self.guard().values().cloned().collect()
    }
}

#[async_trait]
impl SuggestionStore for InMemorySuggestionStore {
    async fn insert(&self, suggestion: &Suggestion) -> Result<(), StoreError> {
        let mut rows = self.guard();
        if rows.contains_key(&suggestion.id.0) {
            return Err(StoreError::DuplicateKey(suggestion.id.0.clone()));
        }
        rows.insert(suggestion.id.0.clone(), suggestion.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &SuggestionId) -> Result<Option<Suggestion>, StoreError> {
        Ok(self.guard().get(&id.0).cloned())
    }

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Suggestion>, StoreError> {
        Ok(self
            .guard()
            .values()
            .find(|suggestion| suggestion.dedup_key.as_deref() == Some(dedup_key))
            .cloned())
    }

    async fn attach_workflow(
        &self,
        id: &SuggestionId,
        workflow_id: &str,
    ) -> Result<(), StoreError> {
        let mut rows = self.guard();
        let suggestion =
            rows.get_mut(&id.0).ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        suggestion.workflow_id = Some(workflow_id.to_string());
        Ok(())
    }

    async fn complete_review(
        &self,
        id: &SuggestionId,
        outcome: SuggestionStatus,
        reviewer: &str,
        note: Option<&str>,
        result_entity_ids: &[String],
    ) -> Result<CasOutcome, StoreError> {
        let mut rows = self.guard();
        let suggestion =
            rows.get_mut(&id.0).ok_or_else(|| StoreError::NotFound(id.0.clone()))?;

        if suggestion.status != SuggestionStatus::Pending {
            return Ok(CasOutcome::NotPending);
        }

        suggestion.apply_review(outcome, reviewer, note.map(str::to_string));
        suggestion.result_entity_ids = result_entity_ids.to_vec();
        Ok(CasOutcome::Applied)
    }
}
