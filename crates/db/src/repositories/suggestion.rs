use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use mailroom_core::activities::{CasOutcome, SuggestionStore};
use mailroom_core::domain::event::{ChannelType, EventId};
use mailroom_core::domain::suggestion::{
    Provenance, Suggestion, SuggestionId, SuggestionKind, SuggestionStatus,
};
use mailroom_core::errors::StoreError;

use super::{decode, map_sqlx};
use crate::DbPool;

pub struct SqlSuggestionStore {
    pool: DbPool,
}

impl SqlSuggestionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| StoreError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

fn row_to_suggestion(row: &sqlx::sqlite::SqliteRow) -> Result<Suggestion, StoreError> {
    let id: String = decode(row.try_get("id"))?;
    let kind: String = decode(row.try_get("kind"))?;
    let proposed_fields: String = decode(row.try_get("proposed_fields"))?;
    let confidence: f64 = decode(row.try_get("confidence"))?;
    let trigger_event_id: String = decode(row.try_get("trigger_event_id"))?;
    let trigger_excerpt: String = decode(row.try_get("trigger_excerpt"))?;
    let source_channel: String = decode(row.try_get("source_channel"))?;
    let dedup_key: Option<String> = decode(row.try_get("dedup_key"))?;
    let matched_existing_id: Option<String> = decode(row.try_get("matched_existing_id"))?;
    let status: String = decode(row.try_get("status"))?;
    let workflow_id: Option<String> = decode(row.try_get("workflow_id"))?;
    let reviewer: Option<String> = decode(row.try_get("reviewer"))?;
    let reviewed_at: Option<String> = decode(row.try_get("reviewed_at"))?;
    let review_note: Option<String> = decode(row.try_get("review_note"))?;
    let result_entity_ids: Option<String> = decode(row.try_get("result_entity_ids"))?;
    let created_at: String = decode(row.try_get("created_at"))?;
    let updated_at: String = decode(row.try_get("updated_at"))?;

    let proposed_fields: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&proposed_fields)
            .map_err(|error| StoreError::Decode(format!("bad proposed_fields: {error}")))?;
    let result_entity_ids: Vec<String> = match result_entity_ids {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|error| StoreError::Decode(format!("bad result_entity_ids: {error}")))?,
        None => Vec::new(),
    };

    Ok(Suggestion {
        id: SuggestionId(id),
        kind: SuggestionKind::parse(&kind)
            .ok_or_else(|| StoreError::Decode(format!("unknown suggestion kind `{kind}`")))?,
        proposed_fields,
        confidence,
        provenance: Provenance {
            trigger_event_id: EventId(trigger_event_id),
            trigger_excerpt,
            source_channel: ChannelType::parse(&source_channel)
                .ok_or_else(|| StoreError::Decode(format!("unknown channel `{source_channel}`")))?,
        },
        dedup_key,
        matched_existing_id,
        status: SuggestionStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown suggestion status `{status}`")))?,
        workflow_id,
        reviewer,
        reviewed_at: reviewed_at.as_deref().map(parse_datetime).transpose()?,
        review_note,
        result_entity_ids,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

const SELECT_COLUMNS: &str = "id, kind, proposed_fields, confidence, trigger_event_id,
        trigger_excerpt, source_channel, dedup_key, matched_existing_id, status, workflow_id,
        reviewer, reviewed_at, review_note, result_entity_ids, created_at, updated_at";

#[async_trait]
impl SuggestionStore for SqlSuggestionStore {
    async fn insert(&self, suggestion: &Suggestion) -> Result<(), StoreError> {
        let proposed_fields = serde_json::to_string(&suggestion.proposed_fields)
            .map_err(|error| StoreError::Decode(error.to_string()))?;
        let result_entity_ids = serde_json::to_string(&suggestion.result_entity_ids)
            .map_err(|error| StoreError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO suggestion (id, kind, proposed_fields, confidence, trigger_event_id,
                                     trigger_excerpt, source_channel, dedup_key,
                                     matched_existing_id, status, workflow_id, reviewer,
                                     reviewed_at, review_note, result_entity_ids, created_at,
                                     updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&suggestion.id.0)
        .bind(suggestion.kind.as_str())
        .bind(proposed_fields)
        .bind(suggestion.confidence)
        .bind(&suggestion.provenance.trigger_event_id.0)
        .bind(&suggestion.provenance.trigger_excerpt)
        .bind(suggestion.provenance.source_channel.as_str())
        .bind(&suggestion.dedup_key)
        .bind(&suggestion.matched_existing_id)
        .bind(suggestion.status.as_str())
        .bind(&suggestion.workflow_id)
        .bind(&suggestion.reviewer)
        .bind(suggestion.reviewed_at.map(|dt| dt.to_rfc3339()))
        .bind(&suggestion.review_note)
        .bind(result_entity_ids)
        .bind(suggestion.created_at.to_rfc3339())
        .bind(suggestion.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &SuggestionId) -> Result<Option<Suggestion>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM suggestion WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        match row {
            Some(ref row) => Ok(Some(row_to_suggestion(row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Suggestion>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM suggestion
             WHERE dedup_key = ? ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(ref row) => Ok(Some(row_to_suggestion(row)?)),
            None => Ok(None),
        }
    }

    async fn attach_workflow(
        &self,
        id: &SuggestionId,
        workflow_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE suggestion SET workflow_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(workflow_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.0.clone()));
        }
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
        let result_entity_ids = serde_json::to_string(result_entity_ids)
            .map_err(|error| StoreError::Decode(error.to_string()))?;
        let now = Utc::now().to_rfc3339();

        // Conditional update: only a still-pending row is resolved, so two
        // racing activity attempts cannot both win.
        let result = sqlx::query(
            "UPDATE suggestion
             SET status = ?, reviewer = ?, reviewed_at = ?, review_note = ?,
                 result_entity_ids = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(reviewer)
        .bind(&now)
        .bind(note)
        .bind(result_entity_ids)
        .bind(&now)
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(CasOutcome::Applied);
        }

        let exists = sqlx::query("SELECT 1 AS present FROM suggestion WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match exists {
            Some(_) => Ok(CasOutcome::NotPending),
            None => Err(StoreError::NotFound(id.0.clone())),
        }
    }
}
