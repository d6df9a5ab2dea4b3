//! Durable, resumable driver for underwriting runs.
//!
//! Each run is an independent task walking the stage list. Every step transition is committed
//! to the [`RunStore`] before the next one starts, so a run can be resumed from the store alone
//! after a failure or restart. Completed steps are never executed again.

mod cancel;
mod journal;
mod retry;
mod steps;

pub use cancel::CancellationToken;
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use super::collaborators::{
    ApplicationRepository, BlacklistClient, CreditBureauClient, DocumentService, EventSink,
    ServiceError,
};
use super::domain::{ApplicationId, DocumentKind, DocumentSummary};
use super::fusion::{DecisionFusion, DecisionStatus, DecisionThresholds, FusionPolicy, ThresholdError};
use super::policy::PolicyEngine;
use super::reasoning::{LanguageModel, ReasoningAdapter};
use super::rules::{RuleEngine, RuleLimits};
use super::run::{
    ReviewInput, RunError, RunId, RunSettings, RunStatus, StepName, StepStatus, WorkflowRun,
};
use super::scoring::{RiskModel, RiskScoreAdapter};
use super::store::{AuditAction, AuditEntry, RunStore, StoreCommit, StoreError};
use journal::{Journal, Mutation};

/// Document kinds a run needs before anything else happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRequirements {
    pub all_of: Vec<DocumentKind>,
    pub any_of: Vec<DocumentKind>,
}

impl DocumentRequirements {
    /// Describe what is missing, or `None` when the set is complete.
    pub fn missing(&self, documents: &[DocumentSummary]) -> Option<String> {
        let present = |kind: &DocumentKind| documents.iter().any(|doc| &doc.kind == kind);
        let mut problems: Vec<String> = self
            .all_of
            .iter()
            .filter(|kind| !present(*kind))
            .map(|kind| kind.label().to_string())
            .collect();
        if !self.any_of.is_empty() && !self.any_of.iter().any(present) {
            let options: Vec<&str> = self.any_of.iter().map(|kind| kind.label()).collect();
            problems.push(format!("one of {}", options.join(" | ")));
        }
        (!problems.is_empty()).then(|| format!("missing required documents: {}", problems.join(", ")))
    }
}

impl Default for DocumentRequirements {
    fn default() -> Self {
        Self {
            all_of: vec![DocumentKind::IdCard],
            any_of: vec![
                DocumentKind::IncomeStatement,
                DocumentKind::BalanceSheet,
                DocumentKind::BankStatement,
            ],
        }
    }
}

/// Tunables shared by every run the orchestrator drives.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub branch_timeout: Duration,
    pub retry: RetryPolicy,
    pub thresholds: DecisionThresholds,
    pub fusion: FusionPolicy,
    pub rule_limits: RuleLimits,
    /// Non-advisory reasoning score that counts as a mitigant for memo generation.
    pub mitigant_floor: f64,
    pub documents: DocumentRequirements,
    /// Pins the run reference date; today's date when unset.
    pub reference_date: Option<NaiveDate>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            branch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            thresholds: DecisionThresholds::default(),
            fusion: FusionPolicy::default(),
            rule_limits: RuleLimits::default(),
            mitigant_floor: 0.6,
            documents: DocumentRequirements::default(),
            reference_date: None,
        }
    }
}

/// External services and stores the orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RunStore>,
    pub applications: Arc<dyn ApplicationRepository>,
    pub documents: Arc<dyn DocumentService>,
    pub bureau: Arc<dyn CreditBureauClient>,
    pub blacklist: Arc<dyn BlacklistClient>,
    pub risk_model: Arc<dyn RiskModel>,
    pub language_model: Arc<dyn LanguageModel>,
    pub policy: Arc<PolicyEngine>,
    pub events: Arc<dyn EventSink>,
}

/// Failure of a single step, classified for retry handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        if err.is_transient() {
            return StepError::Transient(err.to_string());
        }
        match err {
            ServiceError::Unavailable(_) => StepError::Unavailable(err.to_string()),
            other => StepError::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("application {0} not found")]
    ApplicationNotFound(ApplicationId),
    #[error("application {application_id} already has active run {run_id}")]
    ActiveRunExists {
        application_id: ApplicationId,
        run_id: RunId,
    },
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("cannot {action} run {run_id} while it is {status}")]
    InvalidState {
        run_id: RunId,
        status: &'static str,
        action: &'static str,
    },
    #[error("invalid review: {0}")]
    InvalidReview(String),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Collaborator(#[from] ServiceError),
    #[error("run registry lock poisoned")]
    Registry,
}

#[derive(Clone)]
struct LiveRun {
    journal: Arc<Journal>,
    cancel: CancellationToken,
    settled: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<dyn RunStore>,
    applications: Arc<dyn ApplicationRepository>,
    documents: Arc<dyn DocumentService>,
    bureau: Arc<dyn CreditBureauClient>,
    blacklist: Arc<dyn BlacklistClient>,
    risk: RiskScoreAdapter,
    reasoning: ReasoningAdapter,
    rules: RuleEngine,
    policy: Arc<PolicyEngine>,
    fusion: DecisionFusion,
    events: Arc<dyn EventSink>,
    settings: OrchestratorSettings,
    live: Mutex<HashMap<RunId, LiveRun>>,
    start_lock: Mutex<()>,
}

/// Entry point for starting, inspecting, and steering underwriting runs.
#[derive(Clone)]
pub struct UnderwritingOrchestrator {
    inner: Arc<Inner>,
}

impl UnderwritingOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        let timeout = settings.branch_timeout;
        let inner = Inner {
            store: collaborators.store,
            applications: collaborators.applications,
            documents: collaborators.documents,
            bureau: collaborators.bureau,
            blacklist: collaborators.blacklist,
            risk: RiskScoreAdapter::new(collaborators.risk_model, timeout),
            reasoning: ReasoningAdapter::new(collaborators.language_model, timeout),
            rules: RuleEngine::new(settings.rule_limits.clone()),
            policy: collaborators.policy,
            fusion: DecisionFusion::new(settings.fusion.clone()),
            events: collaborators.events,
            settings,
            live: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.inner.store.clone()
    }

    pub fn applications(&self) -> Arc<dyn ApplicationRepository> {
        self.inner.applications.clone()
    }

    pub fn policy(&self) -> Arc<PolicyEngine> {
        self.inner.policy.clone()
    }

    pub fn reasoning(&self) -> &ReasoningAdapter {
        &self.inner.reasoning
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.inner.rules
    }

    pub fn default_thresholds(&self) -> DecisionThresholds {
        self.inner.settings.thresholds
    }

    /// Create a run for `application_id` and drive it in the background.
    pub async fn start(
        &self,
        application_id: &ApplicationId,
        thresholds: Option<DecisionThresholds>,
    ) -> Result<RunId, OrchestratorError> {
        let run = self.create_run(application_id, thresholds)?;
        let run_id = run.run_id.clone();
        self.spawn_driver(run)?;
        Ok(run_id)
    }

    fn create_run(
        &self,
        application_id: &ApplicationId,
        thresholds: Option<DecisionThresholds>,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let application = self
            .inner
            .applications
            .fetch(application_id)?
            .ok_or_else(|| OrchestratorError::ApplicationNotFound(application_id.clone()))?;

        let _guard = self
            .inner
            .start_lock
            .lock()
            .map_err(|_| OrchestratorError::Registry)?;
        if let Some(active) = self.inner.store.active_run_for(application_id)? {
            return Err(OrchestratorError::ActiveRunExists {
                application_id: application_id.clone(),
                run_id: active.run_id,
            });
        }

        let settings = RunSettings {
            thresholds: thresholds.unwrap_or(self.inner.settings.thresholds),
            reference_date: self
                .inner
                .settings
                .reference_date
                .unwrap_or_else(|| Utc::now().date_naive()),
        };
        let mut run = WorkflowRun::new(application, settings);
        let entry = AuditEntry::system(
            &run,
            AuditAction::RunStarted,
            format!(
                "approve >= {}, reject < {}",
                settings.thresholds.approve, settings.thresholds.reject
            ),
        );
        if let Some(revision) = self
            .inner
            .store
            .apply(StoreCommit::run(run.clone()).with_audit(entry))?
        {
            run.revision = revision;
        }
        info!(run_id = %run.run_id, application_id = %application_id, "underwriting run created");
        Ok(run)
    }

    fn spawn_driver(&self, run: WorkflowRun) -> Result<(), OrchestratorError> {
        let run_id = run.run_id.clone();
        let journal = Arc::new(Journal::new(run, self.inner.store.clone()));
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = watch::channel(false);
        {
            let mut live = self
                .inner
                .live
                .lock()
                .map_err(|_| OrchestratorError::Registry)?;
            if live.contains_key(&run_id) {
                return Ok(());
            }
            live.insert(
                run_id.clone(),
                LiveRun {
                    journal: journal.clone(),
                    cancel: cancel.clone(),
                    settled: settled_rx,
                },
            );
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.drive(&journal, &cancel).await {
                Ok(status) => info!(run_id = %run_id, status = status.label(), "run driver exited"),
                Err(err) => error!(run_id = %run_id, error = %err, "run driver aborted"),
            }
            if let Ok(mut live) = inner.live.lock() {
                live.remove(&run_id);
            }
            let _ = settled_tx.send(true);
        });
        Ok(())
    }

    fn live_run(&self, run_id: &RunId) -> Result<Option<LiveRun>, OrchestratorError> {
        let live = self
            .inner
            .live
            .lock()
            .map_err(|_| OrchestratorError::Registry)?;
        Ok(live.get(run_id).cloned())
    }

    pub async fn status(&self, run_id: &RunId) -> Result<WorkflowRun, OrchestratorError> {
        if let Some(live) = self.live_run(run_id)? {
            return Ok(live.journal.snapshot().await);
        }
        self.inner
            .store
            .fetch_run(run_id)?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))
    }

    /// Wait until no driver is executing `run_id`, then return its state.
    pub async fn wait(&self, run_id: &RunId) -> Result<WorkflowRun, OrchestratorError> {
        if let Some(live) = self.live_run(run_id)? {
            let mut settled = live.settled;
            // A dropped sender also means the driver is gone.
            let _ = settled.wait_for(|done| *done).await;
        }
        self.status(run_id).await
    }

    /// Continue a failed or interrupted run. Running, waiting, and terminal runs are returned as-is,
    /// though a completed run first re-applies its outcome to the application if that write was lost.
    pub async fn resume(&self, run_id: &RunId) -> Result<WorkflowRun, OrchestratorError> {
        if let Some(live) = self.live_run(run_id)? {
            return Ok(live.journal.snapshot().await);
        }
        let run = self
            .inner
            .store
            .fetch_run(run_id)?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))?;
        match run.status {
            RunStatus::Completed => {
                self.inner.reconcile_application(&run)?;
                return Ok(run);
            }
            RunStatus::Cancelled => return Ok(run),
            RunStatus::AwaitingReview if run.review_input.is_none() => return Ok(run),
            _ => {}
        }

        let journal = Journal::new(run, self.inner.store.clone());
        let prepared = journal
            .commit(|run| {
                for state in run.steps.values_mut() {
                    if matches!(
                        state.status,
                        StepStatus::Failed | StepStatus::Running | StepStatus::Retrying
                    ) {
                        state.status = StepStatus::Pending;
                    }
                }
                run.status = RunStatus::Running;
                run.error_message = None;
                run.resume_count += 1;
                let detail = format!("resume #{} at stage {}", run.resume_count, run.current_stage + 1);
                Ok(Mutation::audit(AuditEntry::system(
                    run,
                    AuditAction::RunResumed,
                    detail,
                )))
            })
            .await?;
        info!(run_id = %run_id, resume_count = prepared.resume_count, "run resumed");
        self.spawn_driver(prepared.clone())?;
        Ok(prepared)
    }

    /// Cancel a run; cancelling an already cancelled run is a no-op.
    pub async fn cancel(&self, run_id: &RunId, actor: &str) -> Result<WorkflowRun, OrchestratorError> {
        let live = self.live_run(run_id)?;
        let current = match &live {
            Some(live) => live.journal.snapshot().await,
            None => self
                .inner
                .store
                .fetch_run(run_id)?
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))?,
        };
        match current.status {
            RunStatus::Cancelled => return Ok(current),
            RunStatus::Completed => {
                return Err(OrchestratorError::InvalidState {
                    run_id: run_id.clone(),
                    status: RunStatus::Completed.label(),
                    action: "cancel",
                })
            }
            _ => {}
        }

        let journal = match &live {
            Some(live) => live.journal.clone(),
            None => Arc::new(Journal::new(current, self.inner.store.clone())),
        };
        let actor = if actor.trim().is_empty() {
            AuditEntry::SYSTEM_ACTOR
        } else {
            actor
        };
        let result = journal
            .commit(|run| {
                if run.status == RunStatus::Completed {
                    return Err(OrchestratorError::InvalidState {
                        run_id: run.run_id.clone(),
                        status: RunStatus::Completed.label(),
                        action: "cancel",
                    });
                }
                for state in run.steps.values_mut() {
                    if matches!(
                        state.status,
                        StepStatus::Running | StepStatus::Retrying | StepStatus::Waiting
                    ) {
                        state.status = StepStatus::Failed;
                        state.last_error = Some("cancelled".to_string());
                    }
                }
                run.touch_terminal(RunStatus::Cancelled);
                Ok(Mutation::audit(
                    AuditEntry::system(run, AuditAction::RunCancelled, "run cancelled")
                        .by_actor(actor),
                ))
            })
            .await;

        if let Some(live) = &live {
            live.cancel.cancel();
        }
        match result {
            Ok(run) => {
                info!(run_id = %run_id, actor, "run cancelled");
                Ok(run)
            }
            // Lost a race with another cancel.
            Err(OrchestratorError::Store(StoreError::RunCancelled(_))) => self.status(run_id).await,
            Err(err) => Err(err),
        }
    }

    /// Deliver the human decision for a run parked at the review gate and continue it.
    pub async fn submit_review(
        &self,
        run_id: &RunId,
        review: ReviewInput,
    ) -> Result<WorkflowRun, OrchestratorError> {
        if review.status == DecisionStatus::ManualReview {
            return Err(OrchestratorError::InvalidReview(
                "review must approve or reject".to_string(),
            ));
        }
        if review.reviewer_id.trim().is_empty() || review.reason.trim().is_empty() {
            return Err(OrchestratorError::InvalidReview(
                "reviewer and reason are required".to_string(),
            ));
        }

        let run = self.status(run_id).await?;
        if run.status != RunStatus::AwaitingReview || self.live_run(run_id)?.is_some() {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.clone(),
                status: run.status.label(),
                action: "review",
            });
        }

        let journal = Journal::new(run, self.inner.store.clone());
        let prepared = journal
            .commit(|run| {
                let detail = format!("{}: {}", review.status.label(), review.reason);
                let reviewer = review.reviewer_id.clone();
                run.review_input = Some(review);
                run.step_mut(StepName::HumanReview).status = StepStatus::Pending;
                run.status = RunStatus::Running;
                Ok(Mutation::audit(
                    AuditEntry::for_step(
                        run,
                        StepName::HumanReview,
                        AuditAction::ReviewSubmitted,
                        detail,
                    )
                    .by_actor(reviewer),
                ))
            })
            .await?;
        info!(run_id = %run_id, "review submitted");
        self.spawn_driver(prepared.clone())?;
        Ok(prepared)
    }

    /// Resume every pending or running run left behind by a previous process.
    ///
    /// Steps caught mid-flight are marked failed as interrupted and re-executed.
    pub async fn recover(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let mut recovered = Vec::new();
        for run in self.inner.store.active_runs()? {
            if !matches!(run.status, RunStatus::Pending | RunStatus::Running)
                || self.live_run(&run.run_id)?.is_some()
            {
                continue;
            }
            let run_id = run.run_id.clone();
            let journal = Journal::new(run, self.inner.store.clone());
            journal
                .commit(|run| {
                    let mut interrupted = Vec::new();
                    for (step, state) in run.steps.iter_mut() {
                        if matches!(state.status, StepStatus::Running | StepStatus::Retrying) {
                            state.status = StepStatus::Failed;
                            state.last_error = Some("interrupted".to_string());
                            interrupted.push(step.label());
                        }
                    }
                    let detail = if interrupted.is_empty() {
                        "no step in flight".to_string()
                    } else {
                        format!("interrupted: {}", interrupted.join(", "))
                    };
                    Ok(Mutation::audit(AuditEntry::system(
                        run,
                        AuditAction::RunInterrupted,
                        detail,
                    )))
                })
                .await?;
            self.resume(&run_id).await?;
            recovered.push(run_id);
        }
        info!(count = recovered.len(), "recovered interrupted runs");
        Ok(recovered)
    }

    pub fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, OrchestratorError> {
        Ok(self.inner.store.audit_trail(run_id)?)
    }
}
