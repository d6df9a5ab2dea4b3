mod policy;
mod record;

pub use policy::{
    DecisionThresholds, FusionPolicy, FusionWeights, RatingBands, SoftEscalation, ThresholdError,
};
pub use record::{DecisionOrigin, DecisionRecord, ModelLineage};

use serde::{Deserialize, Serialize};

use super::policy::ComplianceReport;
use super::reasoning::ReasoningAssessment;
use super::rules::{RuleEvaluation, RuleViolation, Severity};
use super::scoring::RiskAssessment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Approve,
    Reject,
    ManualReview,
}

impl DecisionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            DecisionStatus::Approve => "APPROVE",
            DecisionStatus::Reject => "REJECT",
            DecisionStatus::ManualReview => "MANUAL_REVIEW",
        }
    }
}

/// Discrete rating scale, best first.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskRating {
    AAA,
    AA,
    A,
    BBB,
    BB,
    B,
    C,
    D,
}

impl RiskRating {
    pub const fn label(self) -> &'static str {
        match self {
            RiskRating::AAA => "AAA",
            RiskRating::AA => "AA",
            RiskRating::A => "A",
            RiskRating::BBB => "BBB",
            RiskRating::BB => "BB",
            RiskRating::B => "B",
            RiskRating::C => "C",
            RiskRating::D => "D",
        }
    }
}

/// Stage-4 outputs handed to fusion.
#[derive(Debug, Clone, Copy)]
pub struct FusionInputs<'a> {
    pub rules: &'a RuleEvaluation,
    pub compliance: &'a ComplianceReport,
    pub risk: &'a RiskAssessment,
    pub reasoning: &'a ReasoningAssessment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedDecision {
    pub rule_pass: bool,
    /// Rule and compliance violations, hard first.
    pub violations: Vec<RuleViolation>,
    pub risk_score: f64,
    pub reasoning_score: f64,
    pub reasoning_advisory: bool,
    pub composite_score: u32,
    pub rating: RiskRating,
    pub status: DecisionStatus,
    pub reason: String,
    #[serde(default)]
    pub escalated: bool,
}

impl FusedDecision {
    pub fn has_hard_violation(&self) -> bool {
        self.violations
            .iter()
            .any(|violation| violation.severity == Severity::Hard)
    }

    /// Copy of this decision carrying a different effective status and reason.
    pub fn with_status(&self, status: DecisionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            ..self.clone()
        }
    }
}

/// Pure combination of rule, compliance, risk, and reasoning signals.
#[derive(Debug, Clone, Default)]
pub struct DecisionFusion {
    policy: FusionPolicy,
}

impl DecisionFusion {
    pub fn new(policy: FusionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FusionPolicy {
        &self.policy
    }

    pub fn fuse(&self, inputs: &FusionInputs<'_>, thresholds: DecisionThresholds) -> FusedDecision {
        let mut hard: Vec<RuleViolation> = inputs.rules.hard_violations.clone();
        let mut soft: Vec<RuleViolation> = inputs.rules.soft_violations.clone();
        for violation in &inputs.compliance.violations {
            let entry = violation.as_rule_violation();
            match entry.severity {
                Severity::Hard => hard.push(entry),
                Severity::Soft => soft.push(entry),
            }
        }

        let reasoning_advisory = inputs.reasoning.is_advisory(self.policy.confidence_floor);
        let risk_score = inputs.risk.normalized_score;
        let reasoning_score = inputs.reasoning.qualitative_score;

        if !hard.is_empty() {
            let reason = format!(
                "Rejected due to hard violations: {}",
                join_summaries(&hard)
            );
            let mut violations = hard;
            violations.extend(soft);
            return FusedDecision {
                rule_pass: inputs.rules.pass,
                violations,
                risk_score,
                reasoning_score,
                reasoning_advisory,
                composite_score: 0,
                rating: RiskRating::D,
                status: DecisionStatus::Reject,
                reason,
                escalated: false,
            };
        }

        let weights = self.policy.weights;
        let effective_reasoning = if reasoning_advisory { 0.0 } else { reasoning_score };
        let rule_component = if inputs.rules.pass { 1.0 } else { 0.0 };
        let blended = weights.risk * risk_score
            + weights.reasoning * effective_reasoning
            + weights.rules * rule_component;
        let composite_score = (blended * DecisionThresholds::MAX_COMPOSITE as f64)
            .round()
            .clamp(0.0, DecisionThresholds::MAX_COMPOSITE as f64) as u32;
        let rating = self.policy.bands.rate(composite_score);

        let mut status = if composite_score >= thresholds.approve {
            DecisionStatus::Approve
        } else if composite_score < thresholds.reject {
            DecisionStatus::Reject
        } else {
            DecisionStatus::ManualReview
        };

        let escalation = self.policy.escalation;
        let escalated = escalation.enabled
            && status == DecisionStatus::Approve
            && !soft.is_empty()
            && composite_score < thresholds.approve.saturating_add(escalation.margin);
        if escalated {
            status = DecisionStatus::ManualReview;
        }

        let mut reason = match status {
            DecisionStatus::Approve => format!(
                "Composite score {composite_score} ({}) meets approve threshold {}",
                rating.label(),
                thresholds.approve
            ),
            DecisionStatus::Reject => format!(
                "Composite score {composite_score} ({}) below reject threshold {}",
                rating.label(),
                thresholds.reject
            ),
            DecisionStatus::ManualReview if escalated => format!(
                "Composite score {composite_score} ({}) within {} of approve threshold {} with soft violations",
                rating.label(),
                escalation.margin,
                thresholds.approve
            ),
            DecisionStatus::ManualReview => format!(
                "Composite score {composite_score} ({}) between reject threshold {} and approve threshold {}",
                rating.label(),
                thresholds.reject,
                thresholds.approve
            ),
        };
        if reasoning_advisory {
            reason.push_str(&format!(
                "; reasoning score advisory (confidence {:.2} below {:.2})",
                inputs.reasoning.confidence, self.policy.confidence_floor
            ));
        }
        if !soft.is_empty() {
            reason.push_str("; soft violations: ");
            reason.push_str(&join_summaries(&soft));
        }

        FusedDecision {
            rule_pass: inputs.rules.pass,
            violations: soft,
            risk_score,
            reasoning_score,
            reasoning_advisory,
            composite_score,
            rating,
            status,
            reason,
            escalated,
        }
    }
}

fn join_summaries(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(RuleViolation::summary)
        .collect::<Vec<_>>()
        .join("; ")
}
