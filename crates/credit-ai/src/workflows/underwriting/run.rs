use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationId, BlacklistResult, BureauRecord, DocumentSummary,
    ExtractedFinancials,
};
use super::features::FeatureSet;
use super::fusion::{DecisionStatus, DecisionThresholds, FusedDecision};
use super::policy::ComplianceReport;
use super::reasoning::{CreditMemo, ReasoningAssessment};
use super::rules::RuleEvaluation;
use super::scoring::RiskAssessment;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    DocumentValidation,
    DataExtraction,
    CreditBureau,
    BlacklistCheck,
    FeatureAggregation,
    RiskScoring,
    Reasoning,
    RuleEvaluation,
    PolicyCompliance,
    DecisionFusion,
    HumanReview,
    MemoGeneration,
    Finalization,
}

impl StepName {
    pub const fn label(self) -> &'static str {
        match self {
            StepName::DocumentValidation => "document_validation",
            StepName::DataExtraction => "data_extraction",
            StepName::CreditBureau => "credit_bureau",
            StepName::BlacklistCheck => "blacklist_check",
            StepName::FeatureAggregation => "feature_aggregation",
            StepName::RiskScoring => "risk_scoring",
            StepName::Reasoning => "reasoning",
            StepName::RuleEvaluation => "rule_evaluation",
            StepName::PolicyCompliance => "policy_compliance",
            StepName::DecisionFusion => "decision_fusion",
            StepName::HumanReview => "human_review",
            StepName::MemoGeneration => "memo_generation",
            StepName::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered stages; stages 2 and 4 fan out across their steps.
pub const STAGES: [&[StepName]; 8] = [
    &[StepName::DocumentValidation],
    &[
        StepName::DataExtraction,
        StepName::CreditBureau,
        StepName::BlacklistCheck,
    ],
    &[StepName::FeatureAggregation],
    &[
        StepName::RiskScoring,
        StepName::Reasoning,
        StepName::RuleEvaluation,
        StepName::PolicyCompliance,
    ],
    &[StepName::DecisionFusion],
    &[StepName::HumanReview],
    &[StepName::MemoGeneration],
    &[StepName::Finalization],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
    Waiting,
}

impl StepStatus {
    pub const fn is_done(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingReview,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn label(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled runs never move again; failed runs stay resumable.
    pub const fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

/// Per-run settings captured at start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub thresholds: DecisionThresholds,
    /// Date that age and other time-relative facts are computed against.
    pub reference_date: NaiveDate,
}

/// External decision delivered to the human-review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewInput {
    pub status: DecisionStatus,
    pub reviewer_id: String,
    pub reason: String,
}

/// Typed payload recorded for a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    Documents(Vec<DocumentSummary>),
    Financials(ExtractedFinancials),
    Bureau(BureauRecord),
    Blacklist(BlacklistResult),
    Features(FeatureSet),
    Risk(RiskAssessment),
    Reasoning(ReasoningAssessment),
    Rules(RuleEvaluation),
    Compliance(ComplianceReport),
    Fusion(FusedDecision),
    Review(ReviewInput),
    Memo(CreditMemo),
    Finalized { decision_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("step {0} already has a recorded output")]
    DuplicateOutput(StepName),
}

/// Durable state of one underwriting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub application_id: ApplicationId,
    pub application: Application,
    pub settings: RunSettings,
    pub status: RunStatus,
    /// Index into [`STAGES`]; equals the stage count once every stage is done.
    pub current_stage: usize,
    pub steps: BTreeMap<StepName, StepState>,
    pub outputs: BTreeMap<StepName, StepOutput>,
    pub review_input: Option<ReviewInput>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resume_count: u32,
    pub archived: bool,
    pub revision: u64,
}

impl WorkflowRun {
    pub fn new(application: Application, settings: RunSettings) -> Self {
        let steps = STAGES
            .iter()
            .flat_map(|stage| stage.iter())
            .map(|step| (*step, StepState::default()))
            .collect();
        Self {
            run_id: RunId::generate(),
            application_id: application.application_id.clone(),
            application,
            settings,
            status: RunStatus::Pending,
            current_stage: 0,
            steps,
            outputs: BTreeMap::new(),
            review_input: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            resume_count: 0,
            archived: false,
            revision: 0,
        }
    }

    pub fn step(&self, step: StepName) -> StepState {
        self.steps.get(&step).cloned().unwrap_or_default()
    }

    pub fn step_mut(&mut self, step: StepName) -> &mut StepState {
        self.steps.entry(step).or_default()
    }

    pub fn output(&self, step: StepName) -> Option<&StepOutput> {
        self.outputs.get(&step)
    }

    /// Outputs are append-only; a second write for the same step is refused.
    pub fn record_output(&mut self, step: StepName, output: StepOutput) -> Result<(), RunError> {
        if self.outputs.contains_key(&step) {
            return Err(RunError::DuplicateOutput(step));
        }
        self.outputs.insert(step, output);
        Ok(())
    }

    pub fn total_stages(&self) -> usize {
        STAGES.len()
    }

    pub fn stage_done(&self, index: usize) -> bool {
        STAGES
            .get(index)
            .map(|stage| stage.iter().all(|step| self.step(*step).status.is_done()))
            .unwrap_or(true)
    }

    pub fn progress(&self) -> f64 {
        let done = (0..STAGES.len())
            .filter(|index| self.stage_done(*index))
            .count();
        done as f64 / STAGES.len() as f64
    }

    /// Step the run is positioned at: the first unfinished step of the current stage.
    pub fn current_step(&self) -> StepName {
        let stage = STAGES
            .get(self.current_stage)
            .copied()
            .unwrap_or(STAGES[STAGES.len() - 1]);
        stage
            .iter()
            .copied()
            .find(|step| !self.step(*step).status.is_done())
            .unwrap_or(stage[stage.len() - 1])
    }

    pub fn touch_terminal(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.archived = status.is_terminal();
    }

    pub fn fused_decision(&self) -> Option<&FusedDecision> {
        match self.output(StepName::DecisionFusion) {
            Some(StepOutput::Fusion(decision)) => Some(decision),
            _ => None,
        }
    }

    pub fn memo(&self) -> Option<&CreditMemo> {
        match self.output(StepName::MemoGeneration) {
            Some(StepOutput::Memo(memo)) => Some(memo),
            _ => None,
        }
    }
}
