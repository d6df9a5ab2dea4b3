//! Language-model reasoning: qualitative credit analysis, compliance interpretation,
//! and credit memo drafting.
//!
//! Every call runs with deterministic generation settings and its own timeout. Structured
//! answers are expected as a JSON object; anything else is a validation failure.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::collaborators::ServiceError;
use super::domain::{Application, ApplicationFacts, ApplicationId, FeatureVector};
use super::fusion::{DecisionStatus, FusedDecision};
use super::rules::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTask {
    CreditAnalysis,
    ComplianceInterpretation,
    CreditMemo,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl GenerationSettings {
    /// Zero temperature with fixed sampling bounds so identical prompts replay identically.
    pub const fn deterministic() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task: PromptTask,
    pub prompt: String,
    pub settings: GenerationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub model_version: String,
}

/// Language model collaborator.
pub trait LanguageModel: Send + Sync {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<Generation, ServiceError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningAssessment {
    pub qualitative_score: f64,
    pub confidence: f64,
    pub narrative: String,
    pub model_version: String,
}

impl ReasoningAssessment {
    /// Low-confidence scores are advisory and carry no fusion weight.
    pub fn is_advisory(&self, confidence_floor: f64) -> bool {
        self.confidence < confidence_floor
    }
}

/// Structured reading of one compliance question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceInterpretation {
    pub compliant: bool,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub finding: String,
}

fn default_severity() -> Severity {
    Severity::Hard
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditMemo {
    pub memo_id: String,
    pub application_id: ApplicationId,
    pub status: DecisionStatus,
    pub content: String,
    pub model_version: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReasoningError {
    #[error("language model timed out after {0} ms")]
    Timeout(u64),
    #[error("language model unavailable: {0}")]
    Service(#[from] ServiceError),
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("{field} {value} outside 0..=1")]
    OutOfRange { field: &'static str, value: f64 },
}

impl ReasoningError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReasoningError::Timeout(_) => true,
            ReasoningError::Service(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Inputs for the qualitative analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub application: &'a Application,
    pub facts: &'a ApplicationFacts,
    pub features: &'a FeatureVector,
}

/// Inputs for the credit memorandum.
#[derive(Debug, Clone, Copy)]
pub struct MemoContext<'a> {
    pub application: &'a Application,
    pub facts: &'a ApplicationFacts,
    pub decision: &'a FusedDecision,
    pub reasoning: Option<&'a ReasoningAssessment>,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    qualitative_score: f64,
    confidence: f64,
    #[serde(default)]
    narrative: String,
}

pub struct ReasoningAdapter {
    model: Arc<dyn LanguageModel>,
    settings: GenerationSettings,
    timeout: Duration,
}

impl ReasoningAdapter {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            settings: GenerationSettings::deterministic(),
            timeout,
        }
    }

    pub fn settings(&self) -> GenerationSettings {
        self.settings
    }

    pub async fn analyze(
        &self,
        context: AnalysisContext<'_>,
    ) -> Result<ReasoningAssessment, ReasoningError> {
        let generation = self
            .call(PromptTask::CreditAnalysis, analysis_prompt(context))
            .await?;
        let response: AnalysisResponse = parse_json_object(&generation.text)?;

        for (field, value) in [
            ("qualitative_score", response.qualitative_score),
            ("confidence", response.confidence),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ReasoningError::OutOfRange { field, value });
            }
        }

        Ok(ReasoningAssessment {
            qualitative_score: response.qualitative_score,
            confidence: response.confidence,
            narrative: response.narrative,
            model_version: generation.model_version,
        })
    }

    pub async fn interpret_compliance(
        &self,
        question: &str,
        passages: &[String],
        facts: &ApplicationFacts,
    ) -> Result<ComplianceInterpretation, ReasoningError> {
        let generation = self
            .call(
                PromptTask::ComplianceInterpretation,
                compliance_prompt(question, passages, facts),
            )
            .await?;
        parse_json_object(&generation.text)
    }

    pub async fn draft_memo(&self, context: MemoContext<'_>) -> Result<CreditMemo, ReasoningError> {
        let generation = self
            .call(PromptTask::CreditMemo, memo_prompt(context))
            .await?;
        let content = generation.text.trim().to_string();
        if content.is_empty() {
            return Err(ReasoningError::Malformed("empty credit memo".to_string()));
        }
        Ok(CreditMemo {
            memo_id: uuid::Uuid::new_v4().to_string(),
            application_id: context.application.application_id.clone(),
            status: context.decision.status,
            content,
            model_version: generation.model_version,
            generated_at: Utc::now(),
        })
    }

    async fn call(&self, task: PromptTask, prompt: String) -> Result<Generation, ReasoningError> {
        let request = GenerationRequest {
            task,
            prompt,
            settings: self.settings,
        };
        tokio::time::timeout(self.timeout, self.model.generate(&request))
            .await
            .map_err(|_| ReasoningError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(ReasoningError::from)
    }
}

/// Pull the outermost JSON object out of a response, tolerating code fences and prose.
fn parse_json_object<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ReasoningError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(ReasoningError::Malformed(
                "response does not contain a JSON object".to_string(),
            ))
        }
    };
    serde_json::from_str(body).map_err(|err| ReasoningError::Malformed(err.to_string()))
}

fn analysis_prompt(context: AnalysisContext<'_>) -> String {
    let application = context.application;
    let facts = context.facts;
    let mut prompt = String::from(
        "You are an expert credit analyst for a rural bank. Assess the creditworthiness of the \
         loan application below.\n\n## Applicant\n",
    );
    let _ = writeln!(prompt, "- Name: {}", application.applicant.full_name);
    let _ = writeln!(prompt, "- Age: {}", facts.age);
    let _ = writeln!(prompt, "- Occupation: {}", facts.occupation);
    let _ = writeln!(prompt, "- Monthly income: {:.0}", facts.monthly_income);
    let _ = writeln!(prompt, "- Sector: {}", facts.sector);
    let _ = writeln!(prompt, "\n## Loan\n- Amount: {:.0}", facts.loan_amount);
    let _ = writeln!(prompt, "- Term: {} months", facts.loan_term_months);
    let _ = writeln!(prompt, "- Purpose: {}", application.loan.purpose);
    let _ = writeln!(prompt, "\n## Ratios\n- DTI: {:.3}", facts.debt_to_income);
    let _ = writeln!(prompt, "- DSCR: {:.3}", facts.debt_service_coverage);
    if let Some(ltv) = facts.loan_to_value {
        let _ = writeln!(prompt, "- LTV: {ltv:.3}");
    }
    let _ = writeln!(prompt, "\n## Bureau\n- Delinquencies: {}", facts.delinquency_count);
    match facts.credit_score {
        Some(score) => {
            let _ = writeln!(prompt, "- Credit score: {score}");
        }
        None => prompt.push_str("- Credit score: unavailable\n"),
    }
    prompt.push_str("\n## Features\n");
    for (name, value) in &context.features.0 {
        let _ = writeln!(prompt, "- {name}: {value}");
    }
    prompt.push_str(
        "\nRespond with a JSON object only: {\"qualitative_score\": <0..1, higher is more \
         creditworthy>, \"confidence\": <0..1>, \"narrative\": \"<assessment>\"}",
    );
    prompt
}

fn compliance_prompt(question: &str, passages: &[String], facts: &ApplicationFacts) -> String {
    let mut prompt = format!("Compliance question: {question}\n\n## Policy passages\n");
    for (index, passage) in passages.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", index + 1, passage.trim());
    }
    let _ = writeln!(
        prompt,
        "\n## Application facts\n- Age: {}\n- DTI: {:.3}\n- DSCR: {:.3}",
        facts.age, facts.debt_to_income, facts.debt_service_coverage
    );
    match facts.loan_to_value {
        Some(ltv) => {
            let _ = writeln!(prompt, "- LTV: {ltv:.3}");
        }
        None => prompt.push_str("- LTV: unsecured\n"),
    }
    prompt.push_str(
        "\nUsing only the passages above, respond with a JSON object: {\"compliant\": <bool>, \
         \"severity\": \"hard\"|\"soft\", \"finding\": \"<explanation>\"}",
    );
    prompt
}

fn memo_prompt(context: MemoContext<'_>) -> String {
    let application = context.application;
    let decision = context.decision;
    let mut prompt = String::from("Write a formal credit memorandum in Markdown.\n\n## Application\n");
    let _ = writeln!(prompt, "- Applicant: {}", application.applicant.full_name);
    let _ = writeln!(prompt, "- Loan amount: {:.0}", application.loan.amount);
    let _ = writeln!(prompt, "- Term: {} months", application.loan.term_months);
    let _ = writeln!(prompt, "- Purpose: {}", application.loan.purpose);
    let _ = writeln!(prompt, "\n## Decision: {}", decision.status.label());
    let _ = writeln!(
        prompt,
        "- Composite score: {} ({})",
        decision.composite_score,
        decision.rating.label()
    );
    let _ = writeln!(prompt, "- Risk score: {:.3}", decision.risk_score);
    let _ = writeln!(prompt, "- DTI: {:.3}", context.facts.debt_to_income);
    let _ = writeln!(prompt, "- Reason: {}", decision.reason);
    for violation in &decision.violations {
        let _ = writeln!(prompt, "- Violation: {}", violation.summary());
    }
    if let Some(reasoning) = context.reasoning {
        let _ = writeln!(prompt, "\n## Analyst narrative\n{}", reasoning.narrative);
    }
    prompt.push_str(
        "\nInclude: executive summary, borrower profile, loan request, financial analysis, \
         risk assessment, recommendation and conditions.",
    );
    prompt
}
