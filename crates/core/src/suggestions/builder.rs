use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::activities::SuggestionStore;
use crate::domain::event::CanonicalEvent;
use crate::domain::suggestion::{
    clamp_confidence, Provenance, Suggestion, SuggestionKind,
};
use crate::errors::ApplicationError;
use crate::suggestions::dedup::{dedup_key_for_sender, DedupIndex};

/// Max length of the provenance excerpt kept from the trigger content.
const EXCERPT_LEN: usize = 160;

/// Entity types that hang off an existing parent record rather than
/// amending it. A dedup hit plus one of these yields `NewSubEntity`.
const SUB_ENTITY_TYPES: &[&str] = &["contact", "contact_person", "order"];

/// Structured agent output as handed over by the execution engine.
/// `parse_error` marks output the resilient parser could not decode; the
/// builder then falls back to defaults instead of failing.
#[derive(Clone, Debug)]
pub struct AgentDraft {
    pub structured_data: Value,
    pub parse_error: bool,
}

/// Turns an agent draft into a persisted, classified [`Suggestion`].
/// Performs no side effects on business storage; the dedup index is a
/// read-only lookup.
pub struct SuggestionBuilder {
    dedup: Arc<dyn DedupIndex>,
    store: Arc<dyn SuggestionStore>,
}

impl SuggestionBuilder {
    pub fn new(dedup: Arc<dyn DedupIndex>, store: Arc<dyn SuggestionStore>) -> Self {
        Self { dedup, store }
    }

    pub async fn build(
        &self,
        draft: &AgentDraft,
        trigger: &CanonicalEvent,
    ) -> Result<Suggestion, ApplicationError> {
        let confidence = if draft.parse_error {
            0.0
        } else {
            clamp_confidence(
                draft.structured_data.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            )
        };

        let entity_type = draft
            .structured_data
            .get("entity_type")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .to_string();

        let proposed_fields = match draft.structured_data.get("proposed_fields") {
            Some(Value::Object(fields)) => {
                fields.iter().map(|(key, value)| (key.clone(), value.clone())).collect()
            }
            _ => BTreeMap::new(),
        };

        let dedup_key =
            trigger.sender_ref.as_deref().and_then(dedup_key_for_sender);
        let matched = match dedup_key.as_deref() {
            Some(key) => self.dedup.find_duplicate(key).await?,
            None => None,
        };

        let kind = match &matched {
            None => SuggestionKind::NewEntity,
            Some(_) if SUB_ENTITY_TYPES.contains(&entity_type.as_str()) => {
                SuggestionKind::NewSubEntity
            }
            Some(_) => SuggestionKind::Amendment,
        };

        let suggestion = Suggestion::new(
            kind,
            proposed_fields,
            confidence,
            Provenance {
                trigger_event_id: trigger.id.clone(),
                trigger_excerpt: excerpt(&trigger.raw_content),
                source_channel: trigger.channel_type,
            },
            dedup_key,
            matched.map(|existing| existing.entity_id),
        );

        self.store.insert(&suggestion).await?;
        info!(
            event_name = "suggestion.created",
            suggestion_id = %suggestion.id.0,
            kind = suggestion.kind.as_str(),
            confidence = suggestion.confidence,
            parse_error = draft.parse_error,
            trigger_event_id = %trigger.id.0,
            "suggestion persisted"
        );

        Ok(suggestion)
    }
}

fn excerpt(raw_content: &str) -> String {
    if raw_content.chars().count() <= EXCERPT_LEN {
        return raw_content.to_string();
    }
    raw_content.chars().take(EXCERPT_LEN).collect()
}
