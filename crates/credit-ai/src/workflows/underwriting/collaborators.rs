//! Narrow interfaces to the services the underwriting core depends on.
//!
//! Remote collaborators return boxed futures so implementations can be swapped behind
//! `Arc<dyn _>` without touching the orchestrator. In-process stores stay synchronous,
//! mirroring the repository traits used elsewhere in the crate.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationId, ApplicationStatus, BlacklistResult, BureauRecord,
    DocumentSummary, ExtractedFinancials,
};
use super::run::{RunId, StepName, StepStatus};
use super::fusion::DecisionStatus;

/// Failure reported by an external dependency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("network failure: {0}")]
    Network(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    /// Timeouts, rate limits, and network blips are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout(_) | ServiceError::RateLimited | ServiceError::Network(_)
        )
    }
}

/// Document storage and extraction service.
pub trait DocumentService: Send + Sync {
    fn list_documents<'a>(
        &'a self,
        application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<Vec<DocumentSummary>, ServiceError>>;

    fn extracted_financials<'a>(
        &'a self,
        application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<ExtractedFinancials, ServiceError>>;
}

/// Credit bureau client keyed by national identifier.
pub trait CreditBureauClient: Send + Sync {
    fn fetch<'a>(&'a self, national_id: &'a str) -> BoxFuture<'a, Result<BureauRecord, ServiceError>>;
}

pub trait BlacklistClient: Send + Sync {
    fn check<'a>(&'a self, identifier: &'a str)
        -> BoxFuture<'a, Result<BlacklistResult, ServiceError>>;
}

/// Application intake storage; the core reads applications and writes terminal status.
pub trait ApplicationRepository: Send + Sync {
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, ServiceError>;
    fn update_status(&self, id: &ApplicationId, status: ApplicationStatus)
        -> Result<(), ServiceError>;
}

/// Notification payloads for the WebSocket/notification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepCompleted {
        run_id: RunId,
        step: StepName,
        status: StepStatus,
        progress: f64,
    },
    DecisionFinalized {
        application_id: ApplicationId,
        status: DecisionStatus,
    },
}

/// Outbound event hook.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

/// Fan events out to in-process subscribers; lagging subscribers lose old events.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
