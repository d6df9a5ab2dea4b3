use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Response;
use chrono::NaiveDate;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::workflows::underwriting::collaborators::{
    ApplicationRepository, BlacklistClient, CreditBureauClient, DocumentService, EventSink,
    ServiceError, WorkflowEvent,
};
use crate::workflows::underwriting::domain::{
    Applicant, Application, ApplicationId, ApplicationStatus, BlacklistHit, BlacklistResult,
    BureauRecord, DocumentKind, DocumentSummary, ExtractedFinancials, FeatureVector, LoanTerms,
};
use crate::workflows::underwriting::features::{aggregate, FeatureSet};
use crate::workflows::underwriting::orchestrator::{
    Collaborators, OrchestratorSettings, RetryPolicy, UnderwritingOrchestrator,
};
use crate::workflows::underwriting::policy::{
    ChunkingConfig, PolicyDocument, PolicyEngine, PolicyMetadata,
};
use crate::workflows::underwriting::reasoning::{
    Generation, GenerationRequest, LanguageModel, PromptTask,
};
use crate::workflows::underwriting::run::{RunId, WorkflowRun};
use crate::workflows::underwriting::scoring::{ModelPrediction, RiskModel};
use crate::workflows::underwriting::service::UnderwritingService;
use crate::workflows::underwriting::store::{InMemoryRunStore, RunStore};

pub(super) const APPLICATION: &str = "app-001";

pub(super) fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date")
}

/// Salaried applicant aged 45 whose loan lands at a debt-to-income ratio of 0.35.
pub(super) fn application(id: &str) -> Application {
    Application {
        application_id: ApplicationId(id.to_string()),
        applicant: Applicant {
            national_id: format!("3171-{id}"),
            full_name: "Sari Wulandari".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 1, 15).expect("valid date"),
            occupation: "Employee".to_string(),
            monthly_income: 20_000_000.0,
        },
        loan: LoanTerms {
            amount: 120_000_000.0,
            term_months: 24,
            purpose: "Working capital".to_string(),
            collateral_value: None,
        },
        sector: "retail".to_string(),
        status: ApplicationStatus::Underwriting,
    }
}

pub(super) fn bureau_record() -> BureauRecord {
    BureauRecord {
        credit_score: Some(720),
        total_accounts: 4,
        active_accounts: 2,
        delinquent_accounts: 0,
        total_debt: 720_000_000.0,
        inquiries_last_6m: 1,
    }
}

/// Aggregated facts and features for the standard applicant with a clean bureau file.
pub(super) fn feature_set() -> FeatureSet {
    aggregate(
        &application(APPLICATION),
        &ExtractedFinancials::default(),
        &bureau_record(),
        &BlacklistResult::default(),
        reference_date(),
    )
}

pub(super) fn complete_documents() -> Vec<DocumentSummary> {
    vec![
        DocumentSummary {
            document_id: "doc-id".to_string(),
            kind: DocumentKind::IdCard,
        },
        DocumentSummary {
            document_id: "doc-income".to_string(),
            kind: DocumentKind::IncomeStatement,
        },
    ]
}

pub(super) fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        branch_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
        },
        reference_date: Some(reference_date()),
        ..OrchestratorSettings::default()
    }
}

#[derive(Default)]
pub(super) struct MemoryApplications {
    records: Mutex<HashMap<ApplicationId, Application>>,
    /// Status writes fail while set.
    pub(super) offline: AtomicBool,
    /// Blocks each status write for this many milliseconds.
    pub(super) write_delay_ms: AtomicU32,
}

impl MemoryApplications {
    pub(super) fn insert(&self, application: Application) {
        self.records
            .lock()
            .expect("applications mutex poisoned")
            .insert(application.application_id.clone(), application);
    }

    pub(super) fn status_of(&self, id: &str) -> ApplicationStatus {
        self.records
            .lock()
            .expect("applications mutex poisoned")
            .get(&ApplicationId(id.to_string()))
            .map(|application| application.status)
            .expect("application exists")
    }
}

impl ApplicationRepository for MemoryApplications {
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, ServiceError> {
        Ok(self
            .records
            .lock()
            .expect("applications mutex poisoned")
            .get(id)
            .cloned())
    }

    fn update_status(
        &self,
        id: &ApplicationId,
        status: ApplicationStatus,
    ) -> Result<(), ServiceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("application registry offline".to_string()));
        }
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(delay)));
        }
        let mut records = self.records.lock().expect("applications mutex poisoned");
        let record = records
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        record.status = status;
        Ok(())
    }
}

pub(super) struct StaticDocuments {
    pub(super) documents: Mutex<Vec<DocumentSummary>>,
    pub(super) financials: ExtractedFinancials,
    pub(super) list_calls: AtomicUsize,
    pub(super) extract_calls: AtomicUsize,
}

impl Default for StaticDocuments {
    fn default() -> Self {
        Self {
            documents: Mutex::new(complete_documents()),
            financials: ExtractedFinancials::default(),
            list_calls: AtomicUsize::new(0),
            extract_calls: AtomicUsize::new(0),
        }
    }
}

impl DocumentService for StaticDocuments {
    fn list_documents<'a>(
        &'a self,
        _application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<Vec<DocumentSummary>, ServiceError>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.documents.lock().expect("documents mutex poisoned").clone())
        })
    }

    fn extracted_financials<'a>(
        &'a self,
        _application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<ExtractedFinancials, ServiceError>> {
        Box::pin(async move {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.financials.clone())
        })
    }
}

/// Bureau that fails with a network error for the first `flaky` calls.
pub(super) struct FlakyBureau {
    pub(super) record: BureauRecord,
    pub(super) flaky: AtomicU32,
    pub(super) calls: AtomicUsize,
}

impl Default for FlakyBureau {
    fn default() -> Self {
        Self {
            record: bureau_record(),
            flaky: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

impl CreditBureauClient for FlakyBureau {
    fn fetch<'a>(
        &'a self,
        _national_id: &'a str,
    ) -> BoxFuture<'a, Result<BureauRecord, ServiceError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.flaky.load(Ordering::SeqCst);
            if remaining > 0 {
                self.flaky.store(remaining - 1, Ordering::SeqCst);
                return Err(ServiceError::Network("connection reset".to_string()));
            }
            Ok(self.record.clone())
        })
    }
}

#[derive(Default)]
pub(super) struct StaticBlacklist {
    pub(super) listed: AtomicBool,
    pub(super) calls: AtomicUsize,
}

impl BlacklistClient for StaticBlacklist {
    fn check<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<BlacklistResult, ServiceError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.listed.load(Ordering::SeqCst) {
                return Ok(BlacklistResult::default());
            }
            Ok(BlacklistResult {
                listed: true,
                hits: vec![BlacklistHit {
                    identifier: identifier.to_string(),
                    reason: "fraud".to_string(),
                    severity: "high".to_string(),
                }],
            })
        })
    }
}

/// Risk model returning a configurable default probability; can fail or hang on demand.
pub(super) struct ScriptedRiskModel {
    pub(super) probability_of_default: Mutex<f64>,
    pub(super) unavailable: AtomicBool,
    pub(super) hang: AtomicBool,
    pub(super) calls: AtomicUsize,
}

impl ScriptedRiskModel {
    pub(super) fn returning(probability_of_default: f64) -> Self {
        Self {
            probability_of_default: Mutex::new(probability_of_default),
            unavailable: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

impl RiskModel for ScriptedRiskModel {
    fn predict<'a>(
        &'a self,
        features: &'a FeatureVector,
    ) -> BoxFuture<'a, Result<ModelPrediction, ServiceError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                futures_util::future::pending::<()>().await;
            }
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(ServiceError::Unavailable("model server down".to_string()));
            }
            let mut importances = std::collections::BTreeMap::new();
            if let Some(dti) = features.get("debt_to_income") {
                importances.insert("debt_to_income".to_string(), -dti);
            }
            importances.insert("monthly_income".to_string(), 0.12);
            Ok(ModelPrediction {
                probability_of_default: *self
                    .probability_of_default
                    .lock()
                    .expect("risk mutex poisoned"),
                model_version: "risk-test-1".to_string(),
                feature_importances: importances,
            })
        })
    }
}

/// Language model answering each prompt task from a script.
pub(super) struct ScriptedLanguageModel {
    pub(super) analysis: Mutex<String>,
    /// Compliance questions containing this text are answered as a hard breach.
    pub(super) breach_question: Mutex<Option<String>>,
    pub(super) memo: String,
    pub(super) requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedLanguageModel {
    pub(super) fn scoring(qualitative_score: f64, confidence: f64) -> Self {
        Self {
            analysis: Mutex::new(analysis_json(qualitative_score, confidence)),
            breach_question: Mutex::new(None),
            memo: "# Credit Memorandum\n\nRecommendation recorded.".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn calls(&self, task: PromptTask) -> usize {
        self.requests
            .lock()
            .expect("requests mutex poisoned")
            .iter()
            .filter(|request| request.task == task)
            .count()
    }
}

pub(super) fn analysis_json(qualitative_score: f64, confidence: f64) -> String {
    format!(
        "```json\n{{\"qualitative_score\": {qualitative_score}, \"confidence\": {confidence}, \
         \"narrative\": \"Stable salaried borrower\"}}\n```"
    )
}

impl LanguageModel for ScriptedLanguageModel {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<Generation, ServiceError>> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("requests mutex poisoned")
                .push(request.clone());
            let text = match request.task {
                PromptTask::CreditAnalysis => {
                    self.analysis.lock().expect("analysis mutex poisoned").clone()
                }
                PromptTask::ComplianceInterpretation => {
                    let question = request.prompt.lines().next().unwrap_or_default();
                    let breach = self
                        .breach_question
                        .lock()
                        .expect("breach mutex poisoned")
                        .as_ref()
                        .is_some_and(|needle| question.contains(needle.as_str()));
                    if breach {
                        "{\"compliant\": false, \"severity\": \"hard\", \"finding\": \"exceeds policy maximum\"}"
                            .to_string()
                    } else {
                        "{\"compliant\": true, \"severity\": \"soft\", \"finding\": \"within policy\"}"
                            .to_string()
                    }
                }
                PromptTask::CreditMemo => self.memo.clone(),
            };
            Ok(Generation {
                text,
                model_version: "llm-test-1".to_string(),
            })
        })
    }
}

#[derive(Default)]
pub(super) struct RecordingEvents {
    pub(super) events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEvents {
    pub(super) fn snapshot(&self) -> Vec<WorkflowEvent> {
        self.events.lock().expect("events mutex poisoned").clone()
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: WorkflowEvent) {
        self.events.lock().expect("events mutex poisoned").push(event);
    }
}

/// Orchestrator wired to scripted collaborators, with handles for assertions.
pub(super) struct Harness {
    pub(super) orchestrator: UnderwritingOrchestrator,
    pub(super) store: Arc<InMemoryRunStore>,
    pub(super) applications: Arc<MemoryApplications>,
    pub(super) documents: Arc<StaticDocuments>,
    pub(super) bureau: Arc<FlakyBureau>,
    pub(super) blacklist: Arc<StaticBlacklist>,
    pub(super) risk: Arc<ScriptedRiskModel>,
    pub(super) language: Arc<ScriptedLanguageModel>,
    pub(super) policy: Arc<PolicyEngine>,
    pub(super) events: Arc<RecordingEvents>,
}

impl Harness {
    /// Risk 0.78 and reasoning 0.8 at confidence 0.9 for the standard applicant.
    pub(super) fn new() -> Self {
        Self::with(0.22, 0.8, 0.9, settings())
    }

    pub(super) fn with(
        probability_of_default: f64,
        qualitative_score: f64,
        confidence: f64,
        settings: OrchestratorSettings,
    ) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let applications = Arc::new(MemoryApplications::default());
        applications.insert(application(APPLICATION));
        let documents = Arc::new(StaticDocuments::default());
        let bureau = Arc::new(FlakyBureau::default());
        let blacklist = Arc::new(StaticBlacklist::default());
        let risk = Arc::new(ScriptedRiskModel::returning(probability_of_default));
        let language = Arc::new(ScriptedLanguageModel::scoring(qualitative_score, confidence));
        let policy = Arc::new(PolicyEngine::in_memory(ChunkingConfig::default()));
        let events = Arc::new(RecordingEvents::default());

        let orchestrator = UnderwritingOrchestrator::new(
            Collaborators {
                store: store.clone(),
                applications: applications.clone(),
                documents: documents.clone(),
                bureau: bureau.clone(),
                blacklist: blacklist.clone(),
                risk_model: risk.clone(),
                language_model: language.clone(),
                policy: policy.clone(),
                events: events.clone(),
            },
            settings,
        );

        Self {
            orchestrator,
            store,
            applications,
            documents,
            bureau,
            blacklist,
            risk,
            language,
            policy,
            events,
        }
    }

    pub(super) fn service(&self) -> UnderwritingService {
        UnderwritingService::new(self.orchestrator.clone())
    }

    pub(super) fn application_id(&self) -> ApplicationId {
        ApplicationId(APPLICATION.to_string())
    }

    /// Start a run with default thresholds and wait for its driver to stop.
    pub(super) async fn run_to_rest(&self) -> WorkflowRun {
        let run_id = self
            .orchestrator
            .start(&self.application_id(), None)
            .await
            .expect("run starts");
        self.orchestrator.wait(&run_id).await.expect("run settles")
    }

    pub(super) async fn settle(&self, run_id: &RunId) -> WorkflowRun {
        self.orchestrator.wait(run_id).await.expect("run settles")
    }

    pub(super) fn index_lending_policy(&self) {
        self.policy
            .index(&lending_policy())
            .expect("policy indexes");
    }

    pub(super) fn stored(&self, run_id: &RunId) -> WorkflowRun {
        self.store
            .fetch_run(run_id)
            .expect("store readable")
            .expect("run persisted")
    }
}

pub(super) fn lending_policy() -> PolicyDocument {
    PolicyDocument {
        document_id: "pojk-33".to_string(),
        text: "The maximum debt-to-income ratio for consumer loans is 40 percent of monthly \
               income. Borrowers must be between 21 and 65 years of age at loan maturity. \
               The maximum loan-to-value ratio for secured loans is 80 percent of the \
               appraised collateral value."
            .to_string(),
        metadata: PolicyMetadata {
            title: "Prudential Lending Standards".to_string(),
            section: Some("Pasal 5".to_string()),
            page: Some(12),
            regulation: Some("POJK 33/2018".to_string()),
        },
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}
