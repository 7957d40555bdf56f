use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use mailroom_core::errors::{ApplicationError, InterfaceError};
use mailroom_core::workflow::{ApprovalSignal, StatusSnapshot, WorkflowId, WorkflowService};
use mailroom_core::{ChannelType, RawMessage};

use crate::pipeline::{MessagePipeline, PipelineOutcome};

/// HTTP surface for the review UI and channel adapters: message intake,
/// reviewer signals, and the read-only status query.
#[derive(Clone)]
pub struct ApiState {
    pipeline: Arc<MessagePipeline>,
    workflows: Arc<WorkflowService>,
}

pub fn router(pipeline: Arc<MessagePipeline>, workflows: Arc<WorkflowService>) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/workflows/{id}/signal", post(signal))
        .route("/workflows/{id}/status", get(status))
        .with_state(ApiState { pipeline, workflows })
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestRequest {
    pub raw_content: String,
    pub idempotency_key: Option<String>,
    pub channel_type: String,
    pub content_type: Option<String>,
    pub sender_ref: Option<String>,
    pub session_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub event_status: String,
    pub suggestion_id: Option<String>,
    pub workflow_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SignalRequest {
    pub decision: String,
    pub reviewer_id: String,
    pub note: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub approved: Option<bool>,
    pub reviewer_id: Option<String>,
    pub note: Option<String>,
    pub awaiting_decision: bool,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            approved: snapshot.approved,
            reviewer_id: snapshot.reviewer_id,
            note: snapshot.note,
            awaiting_decision: snapshot.awaiting_decision,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

pub async fn ingest(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let correlation_id =
        request.idempotency_key.clone().unwrap_or_else(|| "ingest".to_string());

    let Some(channel_type) = ChannelType::parse(&request.channel_type) else {
        return Err(bad_request(
            format!("unknown channel type `{}`", request.channel_type),
            &correlation_id,
        ));
    };

    let message = RawMessage {
        raw_content: request.raw_content,
        idempotency_key: request.idempotency_key,
        channel_type,
        content_type: request.content_type.unwrap_or_else(|| "text/plain".to_string()),
        sender_ref: request.sender_ref,
        session_ref: request.session_ref,
    };

    match state.pipeline.handle(message).await {
        Ok(PipelineOutcome::Processed { event, suggestion, workflow_id }) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                event_id: event.id.0,
                event_status: event.status.as_str().to_string(),
                suggestion_id: Some(suggestion.id.0),
                workflow_id: Some(workflow_id.0),
            }),
        )),
        Ok(PipelineOutcome::AlreadyIngested { event }) => Ok((
            StatusCode::OK,
            Json(IngestResponse {
                event_id: event.id.0,
                event_status: event.status.as_str().to_string(),
                suggestion_id: None,
                workflow_id: None,
            }),
        )),
        Err(error) => Err(interface_error(error, &correlation_id)),
    }
}

pub async fn signal(
    State(state): State<ApiState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let signal = match request.decision.as_str() {
        "approve" => ApprovalSignal::Approve {
            reviewer_id: request.reviewer_id,
            note: request.note,
        },
        "reject" => ApprovalSignal::Reject {
            reviewer_id: request.reviewer_id,
            note: request.note,
        },
        other => {
            return Err(bad_request(
                format!("unknown decision `{other}` (expected approve|reject)"),
                &workflow_id,
            ));
        }
    };

    state
        .workflows
        .signal(&WorkflowId(workflow_id.clone()), signal)
        .await
        .map(|snapshot| Json(StatusResponse::from(snapshot)))
        .map_err(|error| interface_error(error, &workflow_id))
}

pub async fn status(
    State(state): State<ApiState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .workflows
        .query_status(&WorkflowId(workflow_id.clone()))
        .await
        .map(|snapshot| Json(StatusResponse::from(snapshot)))
        .map_err(|error| interface_error(error, &workflow_id))
}

fn interface_error(error: ApplicationError, correlation_id: &str) -> ApiError {
    let interface = error.into_interface(correlation_id);
    let status_code = match &interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status_code,
        Json(ErrorBody {
            error: interface.user_message().to_string(),
            correlation_id: correlation_id.to_string(),
        }),
    )
}

fn bad_request(message: String, correlation_id: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody { error: message, correlation_id: correlation_id.to_string() }),
    )
}
