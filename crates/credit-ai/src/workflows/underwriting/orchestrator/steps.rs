use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info, warn};

use super::super::collaborators::WorkflowEvent;
use super::super::domain::{ApplicationFacts, ApplicationStatus};
use super::super::features::{self, FeatureSet};
use super::super::fusion::{
    DecisionOrigin, DecisionRecord, DecisionStatus, FusedDecision, FusionInputs, ModelLineage,
};
use super::super::policy::{ComplianceReport, PolicyError};
use super::super::reasoning::{
    AnalysisContext, MemoContext, ReasoningAssessment, ReasoningError,
};
use super::super::rules::RuleEvaluation;
use super::super::run::{RunStatus, StepName, StepOutput, StepStatus, WorkflowRun, STAGES};
use super::super::scoring::{RiskAssessment, ScoringError};
use super::super::store::{AuditAction, AuditEntry, StoreError};
use super::cancel::CancellationToken;
use super::journal::{Journal, Mutation};
use super::{Inner, OrchestratorError, StepError};

impl From<ScoringError> for StepError {
    fn from(err: ScoringError) -> Self {
        match err {
            err if err.is_transient() => StepError::Transient(err.to_string()),
            ScoringError::Service(inner) => StepError::Unavailable(inner.to_string()),
            other => StepError::Validation(other.to_string()),
        }
    }
}

impl From<ReasoningError> for StepError {
    fn from(err: ReasoningError) -> Self {
        match err {
            err if err.is_transient() => StepError::Transient(err.to_string()),
            ReasoningError::Service(inner) => StepError::Unavailable(inner.to_string()),
            other => StepError::Validation(other.to_string()),
        }
    }
}

impl From<PolicyError> for StepError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Reasoning(inner) => inner.into(),
            PolicyError::StorePoisoned => StepError::Unavailable(err.to_string()),
            other => StepError::Validation(other.to_string()),
        }
    }
}

/// What a step produced.
enum StepOutcome {
    Output(StepOutput),
    Skipped(String),
    /// Parked until external input arrives.
    Waiting,
    /// Finalization already committed the run's completion.
    Finalized,
}

enum Progress {
    Done,
    Suspended,
}

fn commit_failure(err: OrchestratorError) -> StepError {
    match err {
        OrchestratorError::Store(StoreError::RunCancelled(_)) => StepError::Cancelled,
        other => StepError::Unavailable(format!("state store: {other}")),
    }
}

fn required<'a, T>(
    run: &'a WorkflowRun,
    step: StepName,
    pick: impl Fn(&'a StepOutput) -> Option<&'a T>,
) -> Result<&'a T, StepError> {
    run.output(step)
        .and_then(pick)
        .ok_or_else(|| StepError::Validation(format!("missing output from {step}")))
}

fn feature_set(run: &WorkflowRun) -> Result<&FeatureSet, StepError> {
    required(run, StepName::FeatureAggregation, |output| match output {
        StepOutput::Features(set) => Some(set),
        _ => None,
    })
}

fn fused_decision(run: &WorkflowRun) -> Result<&FusedDecision, StepError> {
    required(run, StepName::DecisionFusion, |output| match output {
        StepOutput::Fusion(decision) => Some(decision),
        _ => None,
    })
}

fn reasoning_output(run: &WorkflowRun) -> Option<&ReasoningAssessment> {
    match run.output(StepName::Reasoning) {
        Some(StepOutput::Reasoning(assessment)) => Some(assessment),
        _ => None,
    }
}

fn risk_output(run: &WorkflowRun) -> Option<&RiskAssessment> {
    match run.output(StepName::RiskScoring) {
        Some(StepOutput::Risk(assessment)) => Some(assessment),
        _ => None,
    }
}

/// Decision in force after the review gate, with the origin it will be recorded under.
fn effective_decision(run: &WorkflowRun, fused: &FusedDecision) -> (FusedDecision, DecisionOrigin) {
    match run.output(StepName::HumanReview) {
        Some(StepOutput::Review(review)) => (
            fused.with_status(
                review.status,
                format!(
                    "{} by reviewer {}: {} (automated: {})",
                    review.status.label(),
                    review.reviewer_id,
                    review.reason,
                    fused.reason
                ),
            ),
            DecisionOrigin::Reviewed {
                reviewer_id: review.reviewer_id.clone(),
                reason: review.reason.clone(),
            },
        ),
        _ => (fused.clone(), DecisionOrigin::Automated),
    }
}

impl Inner {
    /// Walk the remaining stages of a run until it completes, fails, suspends, or is cancelled.
    pub(super) async fn drive(
        &self,
        journal: &Journal,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, OrchestratorError> {
        let run = journal.snapshot().await;
        if run.status == RunStatus::Pending {
            journal
                .commit(|run| {
                    run.status = RunStatus::Running;
                    Ok(Mutation::quiet())
                })
                .await?;
        }

        loop {
            let run = journal.snapshot().await;
            if cancel.is_cancelled() || run.status == RunStatus::Cancelled {
                return Ok(RunStatus::Cancelled);
            }
            if run.status != RunStatus::Running {
                return Ok(run.status);
            }
            let stage_index = run.current_stage;
            let Some(stage) = STAGES.get(stage_index) else {
                return Ok(run.status);
            };

            let pending: Vec<StepName> = stage
                .iter()
                .copied()
                .filter(|step| !run.step(*step).status.is_done())
                .collect();
            let results = join_all(
                pending
                    .iter()
                    .map(|step| self.run_step(journal, cancel, *step)),
            )
            .await;

            let mut failure: Option<StepError> = None;
            let mut suspended = false;
            for result in results {
                match result {
                    Ok(Progress::Done) => {}
                    Ok(Progress::Suspended) => suspended = true,
                    Err(StepError::Cancelled) => failure = Some(StepError::Cancelled),
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }

            match failure {
                Some(StepError::Cancelled) => return Ok(RunStatus::Cancelled),
                Some(err) => {
                    self.fail_run(journal, &err).await;
                    return Ok(RunStatus::Failed);
                }
                None if suspended => return Ok(RunStatus::AwaitingReview),
                None => {}
            }

            let run = journal.snapshot().await;
            if run.status != RunStatus::Running {
                return Ok(run.status);
            }
            journal
                .commit(|run| {
                    run.current_stage = stage_index + 1;
                    Ok(Mutation::quiet())
                })
                .await?;
        }
    }

    async fn run_step(
        &self,
        journal: &Journal,
        cancel: &CancellationToken,
        step: StepName,
    ) -> Result<Progress, StepError> {
        let mut retries = 0u32;
        loop {
            let started = journal
                .commit(|run| {
                    let state = run.step_mut(step);
                    state.status = StepStatus::Running;
                    state.attempts += 1;
                    state.started_at = Some(Utc::now());
                    let attempt = state.attempts;
                    Ok(Mutation::audit(AuditEntry::for_step(
                        run,
                        step,
                        AuditAction::StepStarted,
                        format!("attempt {attempt}"),
                    )))
                })
                .await
                .map_err(commit_failure)?;
            let attempt = started.step(step).attempts;
            info!(run_id = %started.run_id, step = %step, attempt, "step started");

            let timeout = self.settings.branch_timeout;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(StepError::Cancelled),
                result = tokio::time::timeout(timeout, self.execute_step(journal, step, &started)) => {
                    result.unwrap_or_else(|_| {
                        Err(StepError::Transient(format!(
                            "{step} timed out after {} ms",
                            timeout.as_millis()
                        )))
                    })
                }
            };

            match outcome {
                Ok(StepOutcome::Finalized) => return Ok(Progress::Done),
                Ok(StepOutcome::Output(output)) => {
                    let run = journal
                        .commit(|run| {
                            run.record_output(step, output)?;
                            let state = run.step_mut(step);
                            state.status = StepStatus::Completed;
                            state.completed_at = Some(Utc::now());
                            state.last_error = None;
                            Ok(Mutation::audit(AuditEntry::for_step(
                                run,
                                step,
                                AuditAction::StepCompleted,
                                format!("attempt {attempt}"),
                            )))
                        })
                        .await
                        .map_err(commit_failure)?;
                    info!(run_id = %run.run_id, step = %step, attempt, "step completed");
                    self.emit_step(&run, step);
                    return Ok(Progress::Done);
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    let run = journal
                        .commit(|run| {
                            let state = run.step_mut(step);
                            state.status = StepStatus::Skipped;
                            state.completed_at = Some(Utc::now());
                            Ok(Mutation::audit(AuditEntry::for_step(
                                run,
                                step,
                                AuditAction::StepSkipped,
                                reason,
                            )))
                        })
                        .await
                        .map_err(commit_failure)?;
                    self.emit_step(&run, step);
                    return Ok(Progress::Done);
                }
                Ok(StepOutcome::Waiting) => {
                    let run = journal
                        .commit(|run| {
                            run.step_mut(step).status = StepStatus::Waiting;
                            run.status = RunStatus::AwaitingReview;
                            Ok(Mutation::audit(AuditEntry::for_step(
                                run,
                                step,
                                AuditAction::AwaitingReview,
                                "awaiting manual review decision",
                            )))
                        })
                        .await
                        .map_err(commit_failure)?;
                    info!(run_id = %run.run_id, "run awaiting manual review");
                    self.emit_step(&run, step);
                    return Ok(Progress::Suspended);
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(StepError::Transient(message)) if retries < self.settings.retry.max_retries => {
                    retries += 1;
                    let delay = self.settings.retry.delay_for(retries);
                    let run = journal
                        .commit(|run| {
                            let state = run.step_mut(step);
                            state.status = StepStatus::Retrying;
                            state.last_error = Some(message.clone());
                            Ok(Mutation::audit(AuditEntry::for_step(
                                run,
                                step,
                                AuditAction::StepRetrying,
                                format!(
                                    "retry {retries} in {} ms: {message}",
                                    delay.as_millis()
                                ),
                            )))
                        })
                        .await
                        .map_err(commit_failure)?;
                    warn!(
                        run_id = %run.run_id,
                        step = %step,
                        attempt,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient step failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StepError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    let err = match err {
                        StepError::Transient(message) => StepError::Unavailable(format!(
                            "{step} failed after {retries} retries: {message}"
                        )),
                        other => other,
                    };
                    let detail = err.to_string();
                    let run = journal
                        .commit(|run| {
                            let state = run.step_mut(step);
                            state.status = StepStatus::Failed;
                            state.last_error = Some(detail.clone());
                            Ok(Mutation::audit(AuditEntry::for_step(
                                run,
                                step,
                                AuditAction::StepFailed,
                                detail,
                            )))
                        })
                        .await
                        .map_err(commit_failure)?;
                    warn!(run_id = %run.run_id, step = %step, attempt, error = %err, "step failed");
                    self.emit_step(&run, step);
                    return Err(err);
                }
            }
        }
    }

    async fn execute_step(
        &self,
        journal: &Journal,
        step: StepName,
        run: &WorkflowRun,
    ) -> Result<StepOutcome, StepError> {
        let application = &run.application;
        let output = match step {
            StepName::DocumentValidation => {
                let documents = self.documents.list_documents(&run.application_id).await?;
                if let Some(problem) = self.settings.documents.missing(&documents) {
                    return Err(StepError::Validation(problem));
                }
                StepOutput::Documents(documents)
            }
            StepName::DataExtraction => StepOutput::Financials(
                self.documents
                    .extracted_financials(&run.application_id)
                    .await?,
            ),
            StepName::CreditBureau => StepOutput::Bureau(
                self.bureau
                    .fetch(&application.applicant.national_id)
                    .await?,
            ),
            StepName::BlacklistCheck => StepOutput::Blacklist(
                self.blacklist
                    .check(&application.applicant.national_id)
                    .await?,
            ),
            StepName::FeatureAggregation => {
                let financials = required(run, StepName::DataExtraction, |output| match output {
                    StepOutput::Financials(financials) => Some(financials),
                    _ => None,
                })?;
                let bureau = required(run, StepName::CreditBureau, |output| match output {
                    StepOutput::Bureau(record) => Some(record),
                    _ => None,
                })?;
                let blacklist = required(run, StepName::BlacklistCheck, |output| match output {
                    StepOutput::Blacklist(result) => Some(result),
                    _ => None,
                })?;
                StepOutput::Features(features::aggregate(
                    application,
                    financials,
                    bureau,
                    blacklist,
                    run.settings.reference_date,
                ))
            }
            StepName::RiskScoring => {
                let set = feature_set(run)?;
                StepOutput::Risk(self.risk.score(&set.features).await?)
            }
            StepName::Reasoning => {
                let set = feature_set(run)?;
                let context = AnalysisContext {
                    application,
                    facts: &set.facts,
                    features: &set.features,
                };
                StepOutput::Reasoning(self.reasoning.analyze(context).await?)
            }
            StepName::RuleEvaluation => {
                let set = feature_set(run)?;
                StepOutput::Rules(self.rules.evaluate(&set.facts))
            }
            StepName::PolicyCompliance => {
                let set = feature_set(run)?;
                StepOutput::Compliance(
                    self.policy
                        .check_compliance(&set.facts, &self.reasoning)
                        .await?,
                )
            }
            StepName::DecisionFusion => {
                let risk = risk_output(run).ok_or_else(|| missing(StepName::RiskScoring))?;
                let reasoning =
                    reasoning_output(run).ok_or_else(|| missing(StepName::Reasoning))?;
                let rules: &RuleEvaluation =
                    required(run, StepName::RuleEvaluation, |output| match output {
                        StepOutput::Rules(evaluation) => Some(evaluation),
                        _ => None,
                    })?;
                let compliance: &ComplianceReport =
                    required(run, StepName::PolicyCompliance, |output| match output {
                        StepOutput::Compliance(report) => Some(report),
                        _ => None,
                    })?;
                let inputs = FusionInputs {
                    rules,
                    compliance,
                    risk,
                    reasoning,
                };
                StepOutput::Fusion(self.fusion.fuse(&inputs, run.settings.thresholds))
            }
            StepName::HumanReview => {
                let fused = fused_decision(run)?;
                if fused.status != DecisionStatus::ManualReview {
                    return Ok(StepOutcome::Skipped(format!(
                        "automated decision {}",
                        fused.status.label()
                    )));
                }
                match &run.review_input {
                    Some(review) => StepOutput::Review(review.clone()),
                    None => return Ok(StepOutcome::Waiting),
                }
            }
            StepName::MemoGeneration => {
                let fused = fused_decision(run)?;
                let set = feature_set(run)?;
                let (decision, _) = effective_decision(run, fused);
                if decision.status == DecisionStatus::Reject
                    && !self.has_mitigants(&decision, &set.facts)
                {
                    return Ok(StepOutcome::Skipped(
                        "rejected without mitigating factors".to_string(),
                    ));
                }
                let context = MemoContext {
                    application,
                    facts: &set.facts,
                    decision: &decision,
                    reasoning: reasoning_output(run),
                };
                StepOutput::Memo(self.reasoning.draft_memo(context).await?)
            }
            StepName::Finalization => return self.finalize(journal, run).await,
        };
        Ok(StepOutcome::Output(output))
    }

    /// Secured loans or a confident, strong reasoning score can justify a memo for a rejection.
    fn has_mitigants(&self, decision: &FusedDecision, facts: &ApplicationFacts) -> bool {
        if decision.has_hard_violation() {
            return false;
        }
        facts.loan_to_value.is_some()
            || (!decision.reasoning_advisory
                && decision.reasoning_score >= self.settings.mitigant_floor)
    }

    /// Commit the decision together with run completion, then mirror it onto the application.
    ///
    /// Nothing between the commit and the status write awaits, so a cancel or timeout either lands
    /// before the commit or finds the run already completed.
    async fn finalize(
        &self,
        journal: &Journal,
        run: &WorkflowRun,
    ) -> Result<StepOutcome, StepError> {
        let fused = fused_decision(run)?;
        let (decision, origin) = effective_decision(run, fused);
        let Some(application_status) = settled_status(decision.status) else {
            return Err(StepError::Validation(
                "manual review decision has not been delivered".to_string(),
            ));
        };

        let lineage = ModelLineage {
            risk_model_version: risk_output(run).map(|risk| risk.model_version.clone()),
            reasoning_model_version: reasoning_output(run)
                .map(|reasoning| reasoning.model_version.clone()),
        };
        let status = decision.status;
        let record = DecisionRecord::new(
            run.application_id.clone(),
            Some(run.run_id.clone()),
            decision,
            lineage,
            origin,
        )
        .with_memo(run.memo().map(|memo| memo.memo_id.clone()));
        let decision_id = record.decision_id.clone();

        let completed = journal
            .commit(|run| {
                run.record_output(
                    StepName::Finalization,
                    StepOutput::Finalized {
                        decision_id: decision_id.clone(),
                    },
                )?;
                let state = run.step_mut(StepName::Finalization);
                state.status = StepStatus::Completed;
                state.completed_at = Some(Utc::now());
                run.current_stage = STAGES.len();
                run.error_message = None;
                run.touch_terminal(RunStatus::Completed);
                Ok(Mutation {
                    audit: vec![
                        AuditEntry::for_step(
                            run,
                            StepName::Finalization,
                            AuditAction::StepCompleted,
                            format!("decision {decision_id}"),
                        ),
                        AuditEntry::system(
                            run,
                            AuditAction::RunCompleted,
                            format!("{} ({})", status.label(), application_status.label()),
                        ),
                    ],
                    decision: Some(record),
                })
            })
            .await
            .map_err(commit_failure)?;

        if let Err(err) = self
            .applications
            .update_status(&completed.application_id, application_status)
        {
            warn!(
                run_id = %completed.run_id,
                application_id = %completed.application_id,
                error = %err,
                "application status not updated; resuming the run re-applies it"
            );
        }

        self.emit_step(&completed, StepName::Finalization);
        self.events.emit(WorkflowEvent::DecisionFinalized {
            application_id: completed.application_id.clone(),
            status,
        });
        info!(
            run_id = %completed.run_id,
            application_id = %completed.application_id,
            decision = status.label(),
            "decision finalized"
        );
        Ok(StepOutcome::Finalized)
    }

    /// Re-apply the terminal status of a completed run to an application still left open.
    ///
    /// Applications already approved, rejected, or cancelled keep their status so later
    /// overrides are not undone.
    pub(super) fn reconcile_application(&self, run: &WorkflowRun) -> Result<(), OrchestratorError> {
        if run.status != RunStatus::Completed {
            return Ok(());
        }
        let Ok(fused) = fused_decision(run) else {
            return Ok(());
        };
        let (decision, _) = effective_decision(run, fused);
        let Some(target) = settled_status(decision.status) else {
            return Ok(());
        };
        let Some(application) = self.applications.fetch(&run.application_id)? else {
            return Ok(());
        };
        if !application.status.is_terminal() {
            self.applications
                .update_status(&run.application_id, target)?;
            info!(
                run_id = %run.run_id,
                application_id = %run.application_id,
                status = target.label(),
                "application status re-applied"
            );
        }
        Ok(())
    }

    async fn fail_run(&self, journal: &Journal, err: &StepError) {
        let message = err.to_string();
        let result = journal
            .commit(|run| {
                run.status = RunStatus::Failed;
                run.error_message = Some(message.clone());
                Ok(Mutation::audit(AuditEntry::system(
                    run,
                    AuditAction::RunFailed,
                    message,
                )))
            })
            .await;
        if let Err(commit_err) = result {
            warn!(error = %commit_err, "could not record run failure");
        }
    }

    fn emit_step(&self, run: &WorkflowRun, step: StepName) {
        self.events.emit(WorkflowEvent::StepCompleted {
            run_id: run.run_id.clone(),
            step,
            status: run.step(step).status,
            progress: run.progress(),
        });
    }
}

fn settled_status(status: DecisionStatus) -> Option<ApplicationStatus> {
    match status {
        DecisionStatus::Approve => Some(ApplicationStatus::Approved),
        DecisionStatus::Reject => Some(ApplicationStatus::Rejected),
        DecisionStatus::ManualReview => None,
    }
}

fn missing(step: StepName) -> StepError {
    StepError::Validation(format!("missing output from {step}"))
}
