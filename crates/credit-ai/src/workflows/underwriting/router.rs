use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::domain::ApplicationId;
use super::fusion::DecisionStatus;
use super::orchestrator::OrchestratorError;
use super::policy::{PolicyDocument, PolicyError, PolicyMetadata};
use super::run::{ReviewInput, RunId, WorkflowRun};
use super::service::{OverrideRequest, UnderwritingService, UnderwritingServiceError};
use super::store::StoreError;

/// Router exposing the underwriting workflow endpoints.
pub fn underwriting_router(service: Arc<UnderwritingService>) -> Router {
    Router::new()
        .route("/api/v1/underwriting/start", post(start_handler))
        .route(
            "/api/v1/underwriting/workflow-status/:run_id",
            get(status_handler),
        )
        .route(
            "/api/v1/underwriting/workflow/:run_id/resume",
            post(resume_handler),
        )
        .route(
            "/api/v1/underwriting/workflow/:run_id/cancel",
            post(cancel_handler),
        )
        .route(
            "/api/v1/underwriting/workflow/:run_id/review",
            post(review_handler),
        )
        .route(
            "/api/v1/underwriting/decision/:application_id",
            get(decision_handler),
        )
        .route(
            "/api/v1/underwriting/decisions/:application_id",
            get(history_handler),
        )
        .route(
            "/api/v1/underwriting/override/:application_id",
            post(override_handler),
        )
        .with_state(service)
}

/// Router exposing policy corpus maintenance and search.
pub fn policy_router(service: Arc<UnderwritingService>) -> Router {
    Router::new()
        .route("/api/v1/policies/index", post(index_policy_handler))
        .route("/api/v1/policies/query", post(query_policy_handler))
        .route(
            "/api/v1/policies/:document_id/prune",
            post(prune_policy_handler),
        )
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub(crate) struct StartRequest {
    application_id: String,
    #[serde(default)]
    auto_approve_threshold: Option<f64>,
    #[serde(default)]
    auto_reject_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CancelRequest {
    #[serde(default)]
    actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewRequest {
    status: DecisionStatus,
    reviewer_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IndexRequest {
    document_id: String,
    title: String,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    regulation: Option<String>,
    text: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryRequest {
    question: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// Progress snapshot returned by the status endpoints.
#[derive(Debug, Serialize)]
pub struct WorkflowStatusView {
    pub run_id: String,
    pub application_id: String,
    pub current_step: String,
    pub current_stage: usize,
    pub total_steps: usize,
    pub step_status: String,
    pub status: String,
    pub progress_percentage: f64,
    pub resume_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&WorkflowRun> for WorkflowStatusView {
    fn from(run: &WorkflowRun) -> Self {
        let step = run.current_step();
        let step_status = serde_json::to_value(run.step(step).status)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            run_id: run.run_id.0.clone(),
            application_id: run.application_id.0.clone(),
            current_step: step.label().to_string(),
            current_stage: (run.current_stage + 1).min(run.total_stages()),
            total_steps: run.total_stages(),
            step_status,
            status: run.status.label().to_string(),
            progress_percentage: (run.progress() * 1000.0).round() / 10.0,
            resume_count: run.resume_count,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error_message: run.error_message.clone(),
        }
    }
}

pub(crate) fn status_for(error: &UnderwritingServiceError) -> StatusCode {
    match error {
        UnderwritingServiceError::Orchestrator(err) => match err {
            OrchestratorError::ApplicationNotFound(_) | OrchestratorError::RunNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::ActiveRunExists { .. }
            | OrchestratorError::InvalidState { .. }
            | OrchestratorError::Store(StoreError::RunCancelled(_))
            | OrchestratorError::Store(StoreError::RevisionConflict { .. }) => StatusCode::CONFLICT,
            OrchestratorError::InvalidReview(_) | OrchestratorError::Threshold(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        UnderwritingServiceError::DecisionNotFound(_) => StatusCode::NOT_FOUND,
        UnderwritingServiceError::InvalidOverride(_) | UnderwritingServiceError::Threshold(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        UnderwritingServiceError::Policy(err) => match err {
            PolicyError::UnknownDocument(_) => StatusCode::NOT_FOUND,
            PolicyError::EmptyDocument(_)
            | PolicyError::InvalidChunking { .. }
            | PolicyError::Import(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        UnderwritingServiceError::Store(_) | UnderwritingServiceError::Collaborator(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn failure(error: UnderwritingServiceError) -> Response {
    let payload = json!({
        "error": error.to_string(),
    });
    (status_for(&error), axum::Json(payload)).into_response()
}

fn status_response(code: StatusCode, run: &WorkflowRun) -> Response {
    (code, axum::Json(WorkflowStatusView::from(run))).into_response()
}

pub(crate) async fn start_handler(
    State(service): State<Arc<UnderwritingService>>,
    axum::Json(request): axum::Json<StartRequest>,
) -> Response {
    let application_id = ApplicationId(request.application_id);
    match service
        .start(
            &application_id,
            request.auto_approve_threshold,
            request.auto_reject_threshold,
        )
        .await
    {
        Ok(run_id) => {
            let payload = json!({
                "run_id": run_id.0,
                "application_id": application_id.0,
                "status": "STARTED",
            });
            (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
        }
        Err(err) => failure(err),
    }
}

pub(crate) async fn status_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(run_id): Path<String>,
) -> Response {
    match service.status(&RunId(run_id)).await {
        Ok(run) => status_response(StatusCode::OK, &run),
        Err(err) => failure(err),
    }
}

pub(crate) async fn resume_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(run_id): Path<String>,
) -> Response {
    match service.resume(&RunId(run_id)).await {
        Ok(run) => status_response(StatusCode::ACCEPTED, &run),
        Err(err) => failure(err),
    }
}

pub(crate) async fn cancel_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(run_id): Path<String>,
    request: Option<axum::Json<CancelRequest>>,
) -> Response {
    let actor = request
        .and_then(|axum::Json(body)| body.actor_id)
        .unwrap_or_default();
    match service.cancel(&RunId(run_id), &actor).await {
        Ok(run) => status_response(StatusCode::OK, &run),
        Err(err) => failure(err),
    }
}

pub(crate) async fn review_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(run_id): Path<String>,
    axum::Json(request): axum::Json<ReviewRequest>,
) -> Response {
    let review = ReviewInput {
        status: request.status,
        reviewer_id: request.reviewer_id,
        reason: request.reason,
    };
    match service.review(&RunId(run_id), review).await {
        Ok(run) => status_response(StatusCode::ACCEPTED, &run),
        Err(err) => failure(err),
    }
}

pub(crate) async fn decision_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(application_id): Path<String>,
) -> Response {
    match service.latest_decision(&ApplicationId(application_id)) {
        Ok(record) => (StatusCode::OK, axum::Json(record)).into_response(),
        Err(err) => failure(err),
    }
}

pub(crate) async fn history_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(application_id): Path<String>,
) -> Response {
    let id = ApplicationId(application_id);
    match service.decision_history(&id) {
        Ok(decisions) => {
            let payload = json!({
                "application_id": id.0,
                "decisions": decisions,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => failure(err),
    }
}

pub(crate) async fn override_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(application_id): Path<String>,
    axum::Json(request): axum::Json<OverrideRequest>,
) -> Response {
    match service
        .override_decision(&ApplicationId(application_id), request)
        .await
    {
        Ok(record) => (StatusCode::CREATED, axum::Json(record)).into_response(),
        Err(err) => failure(err),
    }
}

pub(crate) async fn index_policy_handler(
    State(service): State<Arc<UnderwritingService>>,
    axum::Json(request): axum::Json<IndexRequest>,
) -> Response {
    let document = PolicyDocument {
        document_id: request.document_id,
        text: request.text,
        metadata: PolicyMetadata {
            title: request.title,
            section: request.section,
            page: request.page,
            regulation: request.regulation,
        },
    };
    match service.index_policy(&document) {
        Ok(receipt) => (StatusCode::CREATED, axum::Json(receipt)).into_response(),
        Err(err) => failure(err),
    }
}

pub(crate) async fn query_policy_handler(
    State(service): State<Arc<UnderwritingService>>,
    axum::Json(request): axum::Json<QueryRequest>,
) -> Response {
    match service.query_policies(&request.question, request.top_k) {
        Ok(hits) => {
            let results: Vec<serde_json::Value> = hits
                .into_iter()
                .map(|hit| {
                    json!({
                        "chunk_id": hit.chunk.chunk_id,
                        "document_id": hit.chunk.document_id,
                        "document_version": hit.chunk.document_version,
                        "sequence": hit.chunk.sequence,
                        "text": hit.chunk.text,
                        "similarity": hit.similarity,
                        "metadata": hit.chunk.metadata,
                    })
                })
                .collect();
            let payload = json!({
                "question": request.question,
                "results": results,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => failure(err),
    }
}

pub(crate) async fn prune_policy_handler(
    State(service): State<Arc<UnderwritingService>>,
    Path(document_id): Path<String>,
) -> Response {
    match service.prune_policy(&document_id) {
        Ok(removed) => {
            let payload = json!({
                "document_id": document_id,
                "removed": removed,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => failure(err),
    }
}
