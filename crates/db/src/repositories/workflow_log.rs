use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use mailroom_core::errors::StoreError;
use mailroom_core::workflow::{
    AwaitingWorkflow, WorkflowId, WorkflowLogEntry, WorkflowLogEvent, WorkflowStore,
};

use super::{decode, map_sqlx};
use crate::DbPool;

pub struct SqlWorkflowStore {
    pool: DbPool,
}

impl SqlWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| StoreError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowLogEntry, StoreError> {
    let workflow_id: String = decode(row.try_get("workflow_id"))?;
    let seq: i64 = decode(row.try_get("seq"))?;
    let event_type: String = decode(row.try_get("event_type"))?;
    let payload_json: String = decode(row.try_get("payload_json"))?;
    let occurred_at: String = decode(row.try_get("occurred_at"))?;

    Ok(WorkflowLogEntry {
        workflow_id: WorkflowId(workflow_id),
        seq,
        event: WorkflowLogEvent::parse(&event_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown log event `{event_type}`")))?,
        payload_json,
        occurred_at: parse_datetime(&occurred_at)?,
    })
}

#[async_trait]
impl WorkflowStore for SqlWorkflowStore {
    async fn append(&self, entry: &WorkflowLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_event (id, workflow_id, seq, event_type, payload_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.workflow_id.0)
        .bind(entry.seq)
        .bind(entry.event.as_str())
        .bind(&entry.payload_json)
        .bind(entry.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT workflow_id, seq, event_type, payload_json, occurred_at
             FROM workflow_event WHERE workflow_id = ? ORDER BY seq ASC",
        )
        .bind(&workflow_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn list_awaiting(&self) -> Result<Vec<AwaitingWorkflow>, StoreError> {
        let rows = sqlx::query(
            "SELECT started.workflow_id, started.occurred_at
             FROM workflow_event started
             WHERE started.event_type = 'started'
               AND NOT EXISTS (
                   SELECT 1 FROM workflow_event completed
                   WHERE completed.workflow_id = started.workflow_id
                     AND completed.event_type = 'completed'
               )
             ORDER BY started.occurred_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let workflow_id: String = decode(row.try_get("workflow_id"))?;
                let occurred_at: String = decode(row.try_get("occurred_at"))?;
                Ok(AwaitingWorkflow {
                    workflow_id: WorkflowId(workflow_id),
                    started_at: parse_datetime(&occurred_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use mailroom_core::errors::StoreError;
    use mailroom_core::workflow::{WorkflowId, WorkflowLogEntry, WorkflowLogEvent, WorkflowStore};

    use super::SqlWorkflowStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlWorkflowStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlWorkflowStore::new(pool)
    }

    fn entry(workflow: &str, seq: i64, event: WorkflowLogEvent) -> WorkflowLogEntry {
        WorkflowLogEntry {
            workflow_id: WorkflowId(workflow.to_string()),
            seq,
            event,
            payload_json: "{}".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_and_load_preserves_order() {
        let store = setup().await;

        store.append(&entry("wf-1", 2, WorkflowLogEvent::Signaled)).await.expect("append");
        store.append(&entry("wf-1", 1, WorkflowLogEvent::Started)).await.expect("append");
        store.append(&entry("wf-1", 3, WorkflowLogEvent::Completed)).await.expect("append");

        let entries = store.load(&WorkflowId("wf-1".to_string())).await.expect("load");
        let sequence: Vec<i64> = entries.iter().map(|entry| entry.seq).collect();
        assert_eq!(sequence, vec![1, 2, 3]);
        assert_eq!(entries[0].event, WorkflowLogEvent::Started);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_rejected() {
        let store = setup().await;

        store.append(&entry("wf-1", 1, WorkflowLogEvent::Started)).await.expect("append");
        let error = store
            .append(&entry("wf-1", 1, WorkflowLogEvent::Signaled))
            .await
            .expect_err("must collide");
        assert!(matches!(error, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn list_awaiting_excludes_completed_workflows() {
        let store = setup().await;

        store.append(&entry("wf-open", 1, WorkflowLogEvent::Started)).await.expect("append");
        store.append(&entry("wf-done", 1, WorkflowLogEvent::Started)).await.expect("append");
        store.append(&entry("wf-done", 2, WorkflowLogEvent::Signaled)).await.expect("append");
        store.append(&entry("wf-done", 3, WorkflowLogEvent::Completed)).await.expect("append");

        let awaiting = store.list_awaiting().await.expect("list");
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].workflow_id.0, "wf-open");
    }

    #[tokio::test]
    async fn load_unknown_workflow_is_empty() {
        let store = setup().await;
        let entries = store.load(&WorkflowId("wf-missing".to_string())).await.expect("load");
        assert!(entries.is_empty());
    }
}
