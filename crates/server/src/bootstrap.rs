use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use mailroom_agent::{
    AgentEngine, AgentProfile, LlmError, OpenAiCompatClient, ParamKind, SchemaFormat,
    ToolDescriptor, ToolError, ToolHandler, ToolParameter, ToolRegistry,
};
use mailroom_core::activities::{
    ActivityError, ActivityRetryConfig, EntityCommitter, Notifier, TerminalActivities,
};
use mailroom_core::audit::TracingAuditSink;
use mailroom_core::config::{AppConfig, ConfigError, LoadOptions};
use mailroom_core::suggestions::{
    dedup_key_for_sender, DedupIndex, InMemoryDedupIndex, SuggestionBuilder,
};
use mailroom_core::workflow::WorkflowService;
use mailroom_core::{IntakeService, Suggestion};
use mailroom_db::{connect_with_settings, migrations, DbPool, SqlEventStore, SqlSuggestionStore, SqlWorkflowStore};

use crate::pipeline::MessagePipeline;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub pipeline: Arc<MessagePipeline>,
    pub workflows: Arc<WorkflowService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client construction failed: {0}")]
    LlmClient(#[source] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let audit = Arc::new(TracingAuditSink);
    let event_store = Arc::new(SqlEventStore::new(db_pool.clone()));
    let suggestion_store = Arc::new(SqlSuggestionStore::new(db_pool.clone()));
    let workflow_store = Arc::new(SqlWorkflowStore::new(db_pool.clone()));

    // Business-record lookup is an external collaborator; until a real
    // adapter is wired in, dedup runs against a process-local index.
    let dedup: Arc<dyn DedupIndex> = Arc::new(InMemoryDedupIndex::default());

    // Every supported provider is reached through its OpenAI-compatible
    // chat endpoint, so one client and one tool schema shape suffice.
    let llm = Arc::new(OpenAiCompatClient::from_config(&config.llm).map_err(BootstrapError::LlmClient)?);
    let tools = Arc::new(build_tool_registry(Arc::clone(&dedup)));
    let engine = Arc::new(AgentEngine::new(
        llm,
        tools,
        AgentProfile::default(),
        Some(config.llm.model.clone()),
        SchemaFormat::OpenAi,
    ));

    let activities = Arc::new(TerminalActivities::new(
        Arc::clone(&suggestion_store) as Arc<dyn mailroom_core::activities::SuggestionStore>,
        Arc::new(LocalEntityCommitter),
        Arc::new(LogNotifier),
        Arc::clone(&audit) as Arc<dyn mailroom_core::audit::AuditSink>,
        ActivityRetryConfig {
            max_attempts: config.workflow.activity_max_retries,
            base_delay_secs: config.workflow.activity_retry_base_secs,
            multiplier: 2,
        },
    ));
    let workflows = Arc::new(WorkflowService::new(
        workflow_store,
        activities,
        Arc::clone(&audit) as Arc<dyn mailroom_core::audit::AuditSink>,
        Duration::hours(config.workflow.decision_timeout_hours),
        config.workflow.notify_on_start,
    ));

    let pipeline = Arc::new(MessagePipeline::new(
        IntakeService::new(event_store, Arc::clone(&audit) as Arc<dyn mailroom_core::audit::AuditSink>),
        engine,
        SuggestionBuilder::new(dedup, suggestion_store),
        Arc::clone(&workflows),
        config.llm.max_retries,
        1,
    ));

    Ok(Application { config, db_pool, pipeline, workflows })
}

/// Read-only record lookup exposed to the model. Queries are reduced to
/// the same key the dedup pass uses, so the model and the classifier see
/// one view of what already exists.
struct SearchRecordsTool {
    dedup: Arc<dyn DedupIndex>,
}

#[async_trait]
impl ToolHandler for SearchRecordsTool {
    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        let key = dedup_key_for_sender(query)
            .unwrap_or_else(|| query.trim().to_ascii_lowercase());

        match self.dedup.find_duplicate(&key).await {
            Ok(Some(existing)) => Ok(json!({
                "matches": [{"entity_id": existing.entity_id, "key": key}]
            })),
            Ok(None) => Ok(json!({"matches": []})),
            Err(error) => Err(ToolError::Handler {
                tool: "search_records".to_string(),
                message: error.to_string(),
            }),
        }
    }
}

fn build_tool_registry(dedup: Arc<dyn DedupIndex>) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(
        ToolDescriptor {
            name: "search_records".to_string(),
            description: "Look up an existing business record by sender address or name"
                .to_string(),
            parameters: vec![ToolParameter::required(
                "query",
                "Sender address or record name to search for",
                ParamKind::String,
            )],
        },
        Arc::new(SearchRecordsTool { dedup }),
    );
    registry
}

/// Mints entity ids locally and logs the commit; stands in for the
/// business-storage adapter.
struct LocalEntityCommitter;

#[async_trait]
impl EntityCommitter for LocalEntityCommitter {
    async fn commit(&self, suggestion: &Suggestion) -> Result<Vec<String>, ActivityError> {
        let entity_id = Uuid::new_v4().to_string();
        info!(
            event_name = "committer.entity_created",
            suggestion_id = %suggestion.id.0,
            entity_id = %entity_id,
            kind = suggestion.kind.as_str(),
            "approved suggestion committed"
        );
        Ok(vec![entity_id])
    }
}

/// Log-only reviewer notification; stands in for the outbound channel
/// adapter.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn pending_review(&self, suggestion: &Suggestion) -> Result<(), ActivityError> {
        info!(
            event_name = "notifier.pending_review",
            suggestion_id = %suggestion.id.0,
            kind = suggestion.kind.as_str(),
            confidence = suggestion.confidence,
            "suggestion awaits a reviewer decision"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mailroom_core::activities::SuggestionStore;
    use mailroom_core::config::{ConfigOverrides, LlmProvider, LoadOptions};
    use mailroom_core::intake::EventStore;
    use mailroom_core::workflow::ApprovalSignal;
    use mailroom_core::{
        CanonicalEvent, ChannelType, Provenance, Suggestion, SuggestionKind, SuggestionStatus,
    };
    use mailroom_db::{SqlEventStore, SqlSuggestionStore};

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_when_openai_has_no_api_key() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                llm_provider: Some(LlmProvider::OpenAi),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("llm.api_key"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_startup_and_the_approval_path() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('canonical_event', 'suggestion', 'workflow_event')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected foundation tables to be available after bootstrap");
        assert_eq!(table_count, 3, "bootstrap should expose the baseline tables");

        // Run the approval path over the bootstrapped stores. The
        // suggestion row references its trigger event, so that event is
        // persisted first.
        let events = SqlEventStore::new(app.db_pool.clone());
        let event = CanonicalEvent::new(
            "please add Acme GmbH as a customer",
            "mail-msg-smoke",
            ChannelType::Mail,
            "text/plain",
            Some("jo@acme.example".to_string()),
            None,
        );
        events.insert(&event).await.expect("insert trigger event");

        let suggestions = SqlSuggestionStore::new(app.db_pool.clone());
        let suggestion = suggestion_fixture(&event);
        suggestions.insert(&suggestion).await.expect("insert suggestion");

        let workflow_id =
            app.workflows.start_approval(&suggestion.id).await.expect("start approval");
        let status = app
            .workflows
            .signal(
                &workflow_id,
                ApprovalSignal::Approve { reviewer_id: "u1".to_string(), note: None },
            )
            .await
            .expect("approve");
        assert_eq!(status.approved, Some(true));

        let stored = suggestions
            .find_by_id(&suggestion.id)
            .await
            .expect("find")
            .expect("suggestion should exist");
        assert_eq!(stored.status, SuggestionStatus::Approved);
        assert!(!stored.result_entity_ids.is_empty());

        app.db_pool.close().await;
    }

    fn suggestion_fixture(event: &CanonicalEvent) -> Suggestion {
        Suggestion::new(
            SuggestionKind::NewEntity,
            BTreeMap::from([(
                "name".to_string(),
                serde_json::Value::String("Acme GmbH".to_string()),
            )]),
            0.9,
            Provenance {
                trigger_event_id: event.id.clone(),
                trigger_excerpt: "add Acme".to_string(),
                source_channel: ChannelType::Mail,
            },
            None,
            None,
        )
    }
}
