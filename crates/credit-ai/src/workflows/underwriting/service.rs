use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::collaborators::ServiceError;
use super::domain::{ApplicationId, ApplicationStatus};
use super::fusion::{DecisionOrigin, DecisionRecord, DecisionStatus, DecisionThresholds, ThresholdError};
use super::orchestrator::{OrchestratorError, UnderwritingOrchestrator};
use super::policy::{IndexReceipt, PolicyDocument, PolicyError, RetrievedChunk};
use super::run::{ReviewInput, RunId, RunStatus, WorkflowRun};
use super::store::{AuditAction, AuditEntry, StoreCommit, StoreError};

/// Human override of the latest decision for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub new_status: DecisionStatus,
    pub reason: String,
    pub actor_id: String,
}

/// Facade over the orchestrator, decision history, and policy corpus used by the HTTP layer.
#[derive(Clone)]
pub struct UnderwritingService {
    orchestrator: UnderwritingOrchestrator,
}

impl UnderwritingService {
    pub fn new(orchestrator: UnderwritingOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &UnderwritingOrchestrator {
        &self.orchestrator
    }

    /// Start a run; thresholds arrive as fractions of the composite scale.
    pub async fn start(
        &self,
        application_id: &ApplicationId,
        approve_fraction: Option<f64>,
        reject_fraction: Option<f64>,
    ) -> Result<RunId, UnderwritingServiceError> {
        let thresholds = match (approve_fraction, reject_fraction) {
            (None, None) => None,
            (approve, reject) => {
                let defaults = self.orchestrator.default_thresholds();
                let scale = DecisionThresholds::MAX_COMPOSITE as f64;
                Some(DecisionThresholds::from_fractions(
                    approve.unwrap_or(defaults.approve as f64 / scale),
                    reject.unwrap_or(defaults.reject as f64 / scale),
                )?)
            }
        };
        Ok(self.orchestrator.start(application_id, thresholds).await?)
    }

    pub async fn status(&self, run_id: &RunId) -> Result<WorkflowRun, UnderwritingServiceError> {
        Ok(self.orchestrator.status(run_id).await?)
    }

    pub async fn resume(&self, run_id: &RunId) -> Result<WorkflowRun, UnderwritingServiceError> {
        Ok(self.orchestrator.resume(run_id).await?)
    }

    pub async fn cancel(
        &self,
        run_id: &RunId,
        actor: &str,
    ) -> Result<WorkflowRun, UnderwritingServiceError> {
        Ok(self.orchestrator.cancel(run_id, actor).await?)
    }

    pub async fn review(
        &self,
        run_id: &RunId,
        review: ReviewInput,
    ) -> Result<WorkflowRun, UnderwritingServiceError> {
        Ok(self.orchestrator.submit_review(run_id, review).await?)
    }

    pub fn latest_decision(
        &self,
        application_id: &ApplicationId,
    ) -> Result<DecisionRecord, UnderwritingServiceError> {
        self.orchestrator
            .store()
            .latest_decision(application_id)?
            .ok_or_else(|| UnderwritingServiceError::DecisionNotFound(application_id.clone()))
    }

    pub fn decision_history(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<DecisionRecord>, UnderwritingServiceError> {
        Ok(self.orchestrator.store().decisions_for(application_id)?)
    }

    /// Record a human override as a new decision superseding the latest one.
    ///
    /// An application parked at the review gate has no decision yet. The override is delivered to
    /// that run as its review, and the decision the run finalizes is returned.
    pub async fn override_decision(
        &self,
        application_id: &ApplicationId,
        request: OverrideRequest,
    ) -> Result<DecisionRecord, UnderwritingServiceError> {
        let actor_id = request.actor_id.trim();
        let reason = request.reason.trim();
        if actor_id.is_empty() || reason.is_empty() {
            return Err(UnderwritingServiceError::InvalidOverride(
                "actor_id and reason are required".to_string(),
            ));
        }

        let parked = self
            .orchestrator
            .store()
            .active_run_for(application_id)?
            .filter(|run| run.status == RunStatus::AwaitingReview && run.review_input.is_none());
        if let Some(run) = parked {
            let review = ReviewInput {
                status: request.new_status,
                reviewer_id: actor_id.to_string(),
                reason: reason.to_string(),
            };
            return self.decide_parked(run, review).await;
        }

        let latest = self.latest_decision(application_id)?;
        let decision = latest.decision.with_status(
            request.new_status,
            format!(
                "Override to {} by {actor_id}: {reason}",
                request.new_status.label()
            ),
        );
        let record = DecisionRecord::new(
            application_id.clone(),
            latest.run_id.clone(),
            decision,
            latest.lineage.clone(),
            DecisionOrigin::Override {
                actor_id: actor_id.to_string(),
                reason: reason.to_string(),
                supersedes: latest.decision_id.clone(),
            },
        )
        .with_memo(latest.memo_ref.clone());

        match request.new_status {
            DecisionStatus::Approve => self
                .orchestrator
                .applications()
                .update_status(application_id, ApplicationStatus::Approved)?,
            DecisionStatus::Reject => self
                .orchestrator
                .applications()
                .update_status(application_id, ApplicationStatus::Rejected)?,
            DecisionStatus::ManualReview => {}
        }

        let entry = AuditEntry {
            sequence: 0,
            run_id: latest.run_id.clone(),
            application_id: application_id.clone(),
            action: AuditAction::DecisionOverridden,
            step: None,
            actor: actor_id.to_string(),
            detail: format!(
                "{} -> {}: {reason} (supersedes {})",
                latest.decision.status.label(),
                request.new_status.label(),
                latest.decision_id
            ),
            at: Utc::now(),
        };
        self.orchestrator.store().apply(StoreCommit {
            run: None,
            audit: vec![entry],
            decision: Some(record.clone()),
        })?;

        info!(
            application_id = %application_id,
            actor_id,
            status = request.new_status.label(),
            supersedes = %latest.decision_id,
            "decision overridden"
        );
        Ok(record)
    }

    async fn decide_parked(
        &self,
        run: WorkflowRun,
        review: ReviewInput,
    ) -> Result<DecisionRecord, UnderwritingServiceError> {
        if review.status == DecisionStatus::ManualReview {
            return Err(UnderwritingServiceError::InvalidOverride(format!(
                "application {} is already awaiting manual review",
                run.application_id
            )));
        }
        let actor_id = review.reviewer_id.clone();
        self.orchestrator.submit_review(&run.run_id, review).await?;
        let settled = self.orchestrator.wait(&run.run_id).await?;
        if settled.status != RunStatus::Completed {
            return Err(OrchestratorError::InvalidState {
                run_id: settled.run_id,
                status: settled.status.label(),
                action: "override",
            }
            .into());
        }

        let record = self
            .orchestrator
            .store()
            .decisions_for(&settled.application_id)?
            .into_iter()
            .rev()
            .find(|record| record.run_id.as_ref() == Some(&settled.run_id))
            .ok_or_else(|| UnderwritingServiceError::DecisionNotFound(settled.application_id.clone()))?;
        info!(
            application_id = %settled.application_id,
            run_id = %settled.run_id,
            actor_id = %actor_id,
            status = record.decision.status.label(),
            "override settled run awaiting review"
        );
        Ok(record)
    }

    pub fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, UnderwritingServiceError> {
        Ok(self.orchestrator.audit_trail(run_id)?)
    }

    pub fn index_policy(
        &self,
        document: &PolicyDocument,
    ) -> Result<IndexReceipt, UnderwritingServiceError> {
        Ok(self.orchestrator.policy().index(document)?)
    }

    pub fn query_policies(
        &self,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, UnderwritingServiceError> {
        Ok(self.orchestrator.policy().query(question, top_k)?)
    }

    pub fn prune_policy(&self, document_id: &str) -> Result<usize, UnderwritingServiceError> {
        Ok(self.orchestrator.policy().prune_stale(document_id)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnderwritingServiceError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Collaborator(#[from] ServiceError),
    #[error("no decision recorded for application {0}")]
    DecisionNotFound(ApplicationId),
    #[error("invalid override: {0}")]
    InvalidOverride(String),
}
