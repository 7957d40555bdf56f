use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::event::{CanonicalEvent, ChannelType, EventStatus};
use crate::errors::{ApplicationError, StoreError};

/// Storage port for canonical events. `idempotency_key` is unique in every
/// backend; `insert` reports a duplicate as [`StoreError::DuplicateKey`].
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &CanonicalEvent) -> Result<(), StoreError>;
    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError>;
    async fn save(&self, event: &CanonicalEvent) -> Result<(), StoreError>;
}

/// Raw inbound message as handed over by a channel adapter.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub raw_content: String,
    pub idempotency_key: Option<String>,
    pub channel_type: ChannelType,
    pub content_type: String,
    pub sender_ref: Option<String>,
    pub session_ref: Option<String>,
}

/// At-most-once intake boundary. Re-ingesting a known idempotency key
/// returns the existing event unchanged, never a duplicate-key error.
pub struct IntakeService {
    store: Arc<dyn EventStore>,
    audit: Arc<dyn AuditSink>,
}

impl IntakeService {
    pub fn new(store: Arc<dyn EventStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub async fn ingest(&self, message: RawMessage) -> Result<CanonicalEvent, ApplicationError> {
        let idempotency_key = message.idempotency_key.clone().unwrap_or_else(|| {
            CanonicalEvent::derived_idempotency_key(&message.raw_content, message.channel_type)
        });

        if let Some(existing) = self.store.find_by_idempotency_key(&idempotency_key).await? {
            self.audit_ingest(&existing, AuditOutcome::Ignored);
            info!(
                event_name = "intake.duplicate",
                event_id = %existing.id.0,
                idempotency_key,
                "duplicate delivery; returning existing event"
            );
            return Ok(existing);
        }

        let event = CanonicalEvent::new(
            message.raw_content,
            idempotency_key.clone(),
            message.channel_type,
            message.content_type,
            message.sender_ref,
            message.session_ref,
        );

        match self.store.insert(&event).await {
            Ok(()) => {
                self.audit_ingest(&event, AuditOutcome::Success);
                info!(
                    event_name = "intake.accepted",
                    event_id = %event.id.0,
                    channel = event.channel_type.as_str(),
                    "event ingested"
                );
                Ok(event)
            }
            // Two deliveries raced past the lookup; the first insert won.
            Err(StoreError::DuplicateKey(_)) => {
                let existing = self
                    .store
                    .find_by_idempotency_key(&idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        ApplicationError::Persistence(format!(
                            "event with key {idempotency_key} vanished after duplicate insert"
                        ))
                    })?;
                self.audit_ingest(&existing, AuditOutcome::Ignored);
                Ok(existing)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Advance an event through its status machine and persist the result.
    pub async fn advance(
        &self,
        event: &mut CanonicalEvent,
        to: EventStatus,
    ) -> Result<(), ApplicationError> {
        event.transition(to)?;
        self.store.save(event).await?;
        Ok(())
    }

    fn audit_ingest(&self, event: &CanonicalEvent, outcome: AuditOutcome) {
        self.audit.emit(
            AuditEvent::new(
                Some(event.id.clone()),
                None,
                event.idempotency_key.clone(),
                "intake.ingest",
                AuditCategory::Intake,
                "intake-service",
                outcome,
            )
            .with_metadata("channel", event.channel_type.as_str()),
        );
    }
}

/// Map-backed store used by tests and un-wired deployments.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    rows: Arc<Mutex<BTreeMap<String, CanonicalEvent>>>,
}

impl InMemoryEventStore {
    fn guard(&self) -> MutexGuard<'_, BTreeMap<String, CanonicalEvent>> {
        match self.rows.lock() {
            Ok(rows) => rows,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        let mut rows = self.guard();
        if rows.values().any(|existing| existing.idempotency_key == event.idempotency_key) {
            return Err(StoreError::DuplicateKey(event.idempotency_key.clone()));
        }
        rows.insert(event.id.0.clone(), event.clone());
        Ok(())
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError> {
        Ok(self
            .guard()
            .values()
            .find(|event| event.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn save(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        let mut rows = self.guard();
        if !rows.contains_key(&event.id.0) {
            return Err(StoreError::NotFound(event.id.0.clone()));
        }
        rows.insert(event.id.0.clone(), event.clone());
        Ok(())
    }
}
