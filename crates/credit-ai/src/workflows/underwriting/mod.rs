//! Credit underwriting: a durable multi-stage run that gathers intake data, scores it with
//! rules, a statistical model, a language model, and a policy corpus, fuses the signals into a
//! decision, and records the outcome with a full audit trail.

pub mod collaborators;
pub mod domain;
pub mod features;
pub mod fusion;
pub mod orchestrator;
pub mod policy;
pub mod reasoning;
pub mod router;
pub mod rules;
pub mod run;
pub mod scoring;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use collaborators::{
    ApplicationRepository, BlacklistClient, BroadcastEventSink, CreditBureauClient,
    DocumentService, EventSink, NullEventSink, ServiceError, WorkflowEvent,
};
pub use domain::{
    Applicant, Application, ApplicationFacts, ApplicationId, ApplicationStatus, BlacklistHit,
    BlacklistResult, BureauRecord, DocumentKind, DocumentSummary, ExtractedFinancials,
    FeatureVector, LoanTerms,
};
pub use fusion::{
    DecisionFusion, DecisionOrigin, DecisionRecord, DecisionStatus, DecisionThresholds,
    FusedDecision, FusionPolicy, RiskRating,
};
pub use orchestrator::{
    CancellationToken, Collaborators, DocumentRequirements, OrchestratorError,
    OrchestratorSettings, RetryPolicy, StepError, UnderwritingOrchestrator,
};
pub use policy::{ChunkingConfig, PolicyDocument, PolicyEngine, PolicyError, PolicyMetadata};
pub use reasoning::{Generation, GenerationRequest, LanguageModel, PromptTask, ReasoningAdapter};
pub use router::{policy_router, underwriting_router, WorkflowStatusView};
pub use rules::{RuleEngine, RuleEvaluation, RuleLimits, RuleViolation, Severity};
pub use run::{ReviewInput, RunId, RunStatus, StepName, StepStatus, WorkflowRun};
pub use scoring::{ModelPrediction, RiskModel, RiskScoreAdapter};
pub use service::{OverrideRequest, UnderwritingService, UnderwritingServiceError};
pub use store::{AuditAction, AuditEntry, InMemoryRunStore, JsonFileRunStore, RunStore};
