use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::event::{ChannelType, EventId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuggestionId(pub String);

/// How the proposed mutation relates to existing business records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Create a brand-new top-level record.
    NewEntity,
    /// Create a child record under an existing parent.
    NewSubEntity,
    /// Amend fields on an existing record.
    Amendment,
}

impl SuggestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewEntity => "new_entity",
            Self::NewSubEntity => "new_sub_entity",
            Self::Amendment => "amendment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new_entity" => Some(Self::NewEntity),
            "new_sub_entity" => Some(Self::NewSubEntity),
            "amendment" => Some(Self::Amendment),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Where a suggestion came from, kept for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub trigger_event_id: EventId,
    pub trigger_excerpt: String,
    pub source_channel: ChannelType,
}

/// An AI-proposed business mutation awaiting human approval.
///
/// `status` moves exactly once from `Pending` to a terminal state;
/// re-applying a terminal review is a no-op, never an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub kind: SuggestionKind,
    pub proposed_fields: BTreeMap<String, serde_json::Value>,
    pub confidence: f64,
    pub provenance: Provenance,
    pub dedup_key: Option<String>,
    pub matched_existing_id: Option<String>,
    pub status: SuggestionStatus,
    pub workflow_id: Option<String>,
    pub reviewer: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_note: Option<String>,
    pub result_entity_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Clamp a raw model-reported confidence into `[0, 1]`.
/// Non-finite values default to zero rather than propagating.
pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl Suggestion {
    pub fn new(
        kind: SuggestionKind,
        proposed_fields: BTreeMap<String, serde_json::Value>,
        confidence: f64,
        provenance: Provenance,
        dedup_key: Option<String>,
        matched_existing_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SuggestionId(Uuid::new_v4().to_string()),
            kind,
            proposed_fields,
            confidence: clamp_confidence(confidence),
            provenance,
            dedup_key,
            matched_existing_id,
            status: SuggestionStatus::Pending,
            workflow_id: None,
            reviewer: None,
            reviewed_at: None,
            review_note: None,
            result_entity_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a review outcome. Returns `true` if the state changed, `false`
    /// if the suggestion was already terminal (the first decision stands).
    pub fn apply_review(
        &mut self,
        outcome: SuggestionStatus,
        reviewer: impl Into<String>,
        note: Option<String>,
    ) -> bool {
        debug_assert!(outcome.is_terminal());
        if self.is_terminal() {
            return false;
        }

        let now = Utc::now();
        self.status = outcome;
        self.reviewer = Some(reviewer.into());
        self.reviewed_at = Some(now);
        self.review_note = note;
        self.updated_at = now;
        true
    }
}
