use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use mailroom_agent::{AgentEngine, AgentError, AgentResult, AgentRunContext};
use mailroom_core::errors::ApplicationError;
use mailroom_core::suggestions::{AgentDraft, SuggestionBuilder};
use mailroom_core::workflow::{WorkflowId, WorkflowService};
use mailroom_core::{CanonicalEvent, EventStatus, IntakeService, RawMessage, Suggestion};

/// Result of pushing one inbound message through the full path.
#[derive(Clone, Debug)]
pub enum PipelineOutcome {
    /// The message was new: a suggestion now sits in review.
    Processed { event: CanonicalEvent, suggestion: Suggestion, workflow_id: WorkflowId },
    /// A redelivery of a message that already left the pending state.
    AlreadyIngested { event: CanonicalEvent },
}

/// End-to-end path for one inbound message: intake, agent run, suggestion
/// classification, approval workflow start. Channel adapters hand their
/// raw payloads to [`MessagePipeline::handle`] and nothing else.
pub struct MessagePipeline {
    intake: IntakeService,
    engine: Arc<AgentEngine>,
    builder: SuggestionBuilder,
    workflows: Arc<WorkflowService>,
    llm_max_retries: u32,
    llm_retry_base_secs: u64,
}

impl MessagePipeline {
    pub fn new(
        intake: IntakeService,
        engine: Arc<AgentEngine>,
        builder: SuggestionBuilder,
        workflows: Arc<WorkflowService>,
        llm_max_retries: u32,
        llm_retry_base_secs: u64,
    ) -> Self {
        Self { intake, engine, builder, workflows, llm_max_retries, llm_retry_base_secs }
    }

    pub async fn handle(&self, message: RawMessage) -> Result<PipelineOutcome, ApplicationError> {
        let mut event = self.intake.ingest(message).await?;
        if event.status != EventStatus::Pending {
            info!(
                event_name = "pipeline.redelivery",
                event_id = %event.id.0,
                status = event.status.as_str(),
                "event already left pending; nothing to do"
            );
            return Ok(PipelineOutcome::AlreadyIngested { event });
        }

        self.intake.advance(&mut event, EventStatus::Processing).await?;

        let mut ctx = AgentRunContext::new(&event.raw_content);
        ctx.auxiliary_data
            .insert("channel".to_string(), json!(event.channel_type.as_str()));
        if let Some(sender) = &event.sender_ref {
            ctx.auxiliary_data.insert("sender".to_string(), json!(sender));
        }

        let result = match self.run_agent(&ctx).await {
            Ok(result) => result,
            Err(error) => {
                self.mark_failed(&mut event).await;
                return Err(ApplicationError::Integration(error.to_string()));
            }
        };

        // An aborted run (a tool blew up mid-loop) is a failure, unlike a
        // parse fallback, which still produces a reviewable suggestion.
        if !result.success {
            let detail =
                result.error.unwrap_or_else(|| "agent run aborted".to_string());
            warn!(
                event_name = "pipeline.agent_aborted",
                event_id = %event.id.0,
                error = %detail,
                "agent run aborted; no suggestion filed"
            );
            self.mark_failed(&mut event).await;
            return Err(ApplicationError::Integration(detail));
        }

        let draft = AgentDraft {
            structured_data: result.structured_data,
            parse_error: result.parse_error,
        };
        let suggestion = match self.builder.build(&draft, &event).await {
            Ok(suggestion) => suggestion,
            Err(error) => {
                self.mark_failed(&mut event).await;
                return Err(error);
            }
        };
        let workflow_id = match self.workflows.start_approval(&suggestion.id).await {
            Ok(workflow_id) => workflow_id,
            Err(error) => {
                self.mark_failed(&mut event).await;
                return Err(error);
            }
        };

        self.intake.advance(&mut event, EventStatus::Completed).await?;
        info!(
            event_name = "pipeline.completed",
            event_id = %event.id.0,
            suggestion_id = %suggestion.id.0,
            workflow_id = %workflow_id.0,
            parse_error = draft.parse_error,
            "inbound message routed into review"
        );

        Ok(PipelineOutcome::Processed { event, suggestion, workflow_id })
    }

    /// Best-effort move to `Failed` so the event is not left stuck in
    /// `Processing`. A secondary store failure is logged; the caller's
    /// original error stays the one surfaced.
    async fn mark_failed(&self, event: &mut CanonicalEvent) {
        if let Err(error) = self.intake.advance(event, EventStatus::Failed).await {
            warn!(
                event_name = "pipeline.mark_failed",
                event_id = %event.id.0,
                error = %error,
                "could not record the event failure"
            );
        }
    }

    /// Model transport failures are retried here; everything else the
    /// engine already absorbs into the result.
    async fn run_agent(&self, ctx: &AgentRunContext) -> Result<AgentResult, AgentError> {
        let mut attempt: u32 = 0;
        loop {
            match self.engine.run(ctx).await {
                Ok(result) => return Ok(result),
                Err(AgentError::Llm(error)) if attempt < self.llm_max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "pipeline.llm_retry",
                        attempt,
                        error = %error,
                        "model call failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.llm_retry_base_secs * u64::from(attempt),
                    ))
                    .await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
