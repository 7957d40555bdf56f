use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use mailroom_core::domain::event::{CanonicalEvent, ChannelType, EventId, EventStatus};
use mailroom_core::errors::StoreError;
use mailroom_core::intake::EventStore;

use super::{decode, map_sqlx};
use crate::DbPool;

pub struct SqlEventStore {
    pool: DbPool,
}

impl SqlEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| StoreError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<CanonicalEvent, StoreError> {
    let id: String = decode(row.try_get("id"))?;
    let idempotency_key: String = decode(row.try_get("idempotency_key"))?;
    let channel_type: String = decode(row.try_get("channel_type"))?;
    let raw_content: String = decode(row.try_get("raw_content"))?;
    let content_type: String = decode(row.try_get("content_type"))?;
    let sender_ref: Option<String> = decode(row.try_get("sender_ref"))?;
    let session_ref: Option<String> = decode(row.try_get("session_ref"))?;
    let status: String = decode(row.try_get("status"))?;
    let created_at: String = decode(row.try_get("created_at"))?;
    let processed_at: Option<String> = decode(row.try_get("processed_at"))?;
    let completed_at: Option<String> = decode(row.try_get("completed_at"))?;

    Ok(CanonicalEvent {
        id: EventId(id),
        idempotency_key,
        channel_type: ChannelType::parse(&channel_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown channel `{channel_type}`")))?,
        raw_content,
        content_type,
        sender_ref,
        session_ref,
        status: EventStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown event status `{status}`")))?,
        created_at: parse_datetime(&created_at)?,
        processed_at: processed_at.as_deref().map(parse_datetime).transpose()?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

const SELECT_COLUMNS: &str = "id, idempotency_key, channel_type, raw_content, content_type,
        sender_ref, session_ref, status, created_at, processed_at, completed_at";

#[async_trait]
impl EventStore for SqlEventStore {
    async fn insert(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO canonical_event (id, idempotency_key, channel_type, raw_content,
                                          content_type, sender_ref, session_ref, status,
                                          created_at, processed_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.idempotency_key)
        .bind(event.channel_type.as_str())
        .bind(&event.raw_content)
        .bind(&event.content_type)
        .bind(&event.sender_ref)
        .bind(&event.session_ref)
        .bind(event.status.as_str())
        .bind(event.created_at.to_rfc3339())
        .bind(event.processed_at.map(|dt| dt.to_rfc3339()))
        .bind(event.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM canonical_event WHERE idempotency_key = ?"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(ref row) => Ok(Some(row_to_event(row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE canonical_event
             SET status = ?, processed_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(event.status.as_str())
        .bind(event.processed_at.map(|dt| dt.to_rfc3339()))
        .bind(event.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(&event.id.0)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(event.id.0.clone()));
        }
        Ok(())
    }
}
