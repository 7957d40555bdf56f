use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Mail,
    Chat,
    Webhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Chat => "chat",
            Self::Webhook => "webhook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mail" => Some(Self::Mail),
            "chat" => Some(Self::Chat),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

/// Processing status of an inbound event. Forward-only:
/// `Pending -> Processing -> {Completed, Failed, Skipped}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    fn allows(self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending, Self::Processing) => true,
            (Self::Pending, Self::Skipped) => true,
            (Self::Processing, Self::Completed | Self::Failed | Self::Skipped) => true,
            // Re-applying the current status is an idempotent no-op.
            (from, to) if from == to => true,
            _ => false,
        }
    }
}

/// The normalized representation of an inbound message after idempotent
/// intake, independent of originating channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: EventId,
    pub idempotency_key: String,
    pub channel_type: ChannelType,
    pub raw_content: String,
    pub content_type: String,
    pub sender_ref: Option<String>,
    pub session_ref: Option<String>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CanonicalEvent {
    pub fn new(
        raw_content: impl Into<String>,
        idempotency_key: impl Into<String>,
        channel_type: ChannelType,
        content_type: impl Into<String>,
        sender_ref: Option<String>,
        session_ref: Option<String>,
    ) -> Self {
        Self {
            id: EventId(Uuid::new_v4().to_string()),
            idempotency_key: idempotency_key.into(),
            channel_type,
            raw_content: raw_content.into(),
            content_type: content_type.into(),
            sender_ref,
            session_ref,
            status: EventStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
        }
    }

    /// Fallback idempotency key for channels that do not supply one:
    /// content hash scoped by channel, so the same payload re-delivered
    /// on the same channel maps to the same event.
    pub fn derived_idempotency_key(raw_content: &str, channel_type: ChannelType) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(channel_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(raw_content.as_bytes());
        format!("{}:{:x}", channel_type.as_str(), hasher.finalize())
    }

    /// Move the event forward through its status machine, stamping the
    /// processing/completion timestamps as it goes.
    pub fn transition(&mut self, to: EventStatus) -> Result<(), DomainError> {
        if !self.status.allows(to) {
            return Err(DomainError::InvalidEventTransition { from: self.status, to });
        }
        if self.status == to {
            return Ok(());
        }

        let now = Utc::now();
        if to == EventStatus::Processing {
            self.processed_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }
}
