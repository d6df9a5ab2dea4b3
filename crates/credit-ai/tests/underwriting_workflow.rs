use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use credit_ai::workflows::underwriting::policy::parse_policy_csv;
use credit_ai::workflows::underwriting::{
    Applicant, Application, ApplicationId, ApplicationRepository, ApplicationStatus,
    BlacklistClient, BlacklistResult, BureauRecord, ChunkingConfig, Collaborators,
    CreditBureauClient, DecisionOrigin, DecisionStatus, DocumentKind, DocumentService,
    DocumentSummary, ExtractedFinancials, FeatureVector, Generation, GenerationRequest,
    JsonFileRunStore, LanguageModel, LoanTerms, ModelPrediction, NullEventSink,
    OrchestratorSettings, OverrideRequest, PolicyEngine, PromptTask, RetryPolicy, RiskModel,
    RunStatus, RunStore, ServiceError, StepName, UnderwritingOrchestrator, UnderwritingService,
};
use futures_util::future::BoxFuture;

const APPLICATION: &str = "app-777";

#[derive(Default)]
struct Applications(Mutex<HashMap<ApplicationId, Application>>);

impl Applications {
    fn with(application: Application) -> Self {
        let store = Self::default();
        store
            .0
            .lock()
            .expect("applications mutex")
            .insert(application.application_id.clone(), application);
        store
    }

    fn status(&self) -> ApplicationStatus {
        self.0
            .lock()
            .expect("applications mutex")
            .get(&ApplicationId(APPLICATION.to_string()))
            .map(|application| application.status)
            .expect("application present")
    }
}

impl ApplicationRepository for Applications {
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, ServiceError> {
        Ok(self.0.lock().expect("applications mutex").get(id).cloned())
    }

    fn update_status(
        &self,
        id: &ApplicationId,
        status: ApplicationStatus,
    ) -> Result<(), ServiceError> {
        let mut records = self.0.lock().expect("applications mutex");
        let record = records
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        record.status = status;
        Ok(())
    }
}

struct Intake;

impl DocumentService for Intake {
    fn list_documents<'a>(
        &'a self,
        _application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<Vec<DocumentSummary>, ServiceError>> {
        Box::pin(async {
            Ok(vec![
                DocumentSummary {
                    document_id: "ktp".to_string(),
                    kind: DocumentKind::IdCard,
                },
                DocumentSummary {
                    document_id: "bank-3m".to_string(),
                    kind: DocumentKind::BankStatement,
                },
            ])
        })
    }

    fn extracted_financials<'a>(
        &'a self,
        _application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<ExtractedFinancials, ServiceError>> {
        Box::pin(async { Ok(ExtractedFinancials::default()) })
    }
}

impl CreditBureauClient for Intake {
    fn fetch<'a>(
        &'a self,
        _national_id: &'a str,
    ) -> BoxFuture<'a, Result<BureauRecord, ServiceError>> {
        Box::pin(async {
            Ok(BureauRecord {
                credit_score: Some(705),
                total_accounts: 3,
                active_accounts: 1,
                delinquent_accounts: 0,
                total_debt: 36_000_000.0,
                inquiries_last_6m: 0,
            })
        })
    }
}

impl BlacklistClient for Intake {
    fn check<'a>(
        &'a self,
        _identifier: &'a str,
    ) -> BoxFuture<'a, Result<BlacklistResult, ServiceError>> {
        Box::pin(async { Ok(BlacklistResult::default()) })
    }
}

/// Default probability 0.15 unless switched off.
struct SwitchableRiskModel {
    online: AtomicBool,
}

impl RiskModel for SwitchableRiskModel {
    fn predict<'a>(
        &'a self,
        _features: &'a FeatureVector,
    ) -> BoxFuture<'a, Result<ModelPrediction, ServiceError>> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(ServiceError::Unavailable("model endpoint offline".to_string()));
            }
            Ok(ModelPrediction {
                probability_of_default: 0.15,
                model_version: "xgb-2025.06".to_string(),
                feature_importances: BTreeMap::from([("debt_to_income".to_string(), 0.4)]),
            })
        })
    }
}

struct CannedLanguageModel;

impl LanguageModel for CannedLanguageModel {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<Generation, ServiceError>> {
        let text = match request.task {
            PromptTask::CreditAnalysis => {
                r#"{"qualitative_score": 0.7, "confidence": 0.85, "narrative": "Stable trader"}"#
            }
            PromptTask::ComplianceInterpretation => {
                r#"{"compliant": true, "severity": "soft", "finding": "within limits"}"#
            }
            PromptTask::CreditMemo => "# Credit Memorandum\n\nApproved within policy.",
        };
        Box::pin(async move {
            Ok(Generation {
                text: text.to_string(),
                model_version: "gemini-test".to_string(),
            })
        })
    }
}

fn application() -> Application {
    Application {
        application_id: ApplicationId(APPLICATION.to_string()),
        applicant: Applicant {
            national_id: "3273-0101".to_string(),
            full_name: "Dewi Lestari".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1988, 3, 2).expect("valid date"),
            occupation: "Business Owner".to_string(),
            monthly_income: 15_000_000.0,
        },
        loan: LoanTerms {
            amount: 60_000_000.0,
            term_months: 12,
            purpose: "Inventory".to_string(),
            collateral_value: Some(150_000_000.0),
        },
        sector: "trade".to_string(),
        status: ApplicationStatus::Underwriting,
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        branch_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        reference_date: NaiveDate::from_ymd_opt(2025, 6, 1),
        ..OrchestratorSettings::default()
    }
}

fn orchestrator(
    store: Arc<dyn RunStore>,
    applications: Arc<Applications>,
    risk: Arc<SwitchableRiskModel>,
) -> UnderwritingOrchestrator {
    let intake = Arc::new(Intake);
    UnderwritingOrchestrator::new(
        Collaborators {
            store,
            applications,
            documents: intake.clone(),
            bureau: intake.clone(),
            blacklist: intake,
            risk_model: risk,
            language_model: Arc::new(CannedLanguageModel),
            policy: Arc::new(PolicyEngine::in_memory(ChunkingConfig::default())),
            events: Arc::new(NullEventSink),
        },
        settings(),
    )
}

#[tokio::test]
async fn failed_run_resumes_after_restart_from_state_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("underwriting.json");
    let applications = Arc::new(Applications::with(application()));
    let application_id = ApplicationId(APPLICATION.to_string());

    let run_id = {
        let store = Arc::new(JsonFileRunStore::open(&path).expect("open state"));
        let risk = Arc::new(SwitchableRiskModel {
            online: AtomicBool::new(false),
        });
        let first = orchestrator(store, applications.clone(), risk);
        let run_id = first
            .start(&application_id, None)
            .await
            .expect("run starts");
        let failed = first.wait(&run_id).await.expect("run settles");
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.current_stage, 3);
        run_id
    };

    let store = Arc::new(JsonFileRunStore::open(&path).expect("reopen state"));
    let persisted = store
        .fetch_run(&run_id)
        .expect("readable")
        .expect("run persisted");
    assert_eq!(persisted.status, RunStatus::Failed);
    assert!(persisted.output(StepName::FeatureAggregation).is_some());

    let risk = Arc::new(SwitchableRiskModel {
        online: AtomicBool::new(true),
    });
    let second = orchestrator(store, applications.clone(), risk);
    second.resume(&run_id).await.expect("resume accepted");
    let run = second.wait(&run_id).await.expect("run settles");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.resume_count, 1);
    assert_eq!(run.step(StepName::CreditBureau).attempts, 1);
    assert_eq!(applications.status(), ApplicationStatus::Approved);

    let reopened = JsonFileRunStore::open(&path).expect("reopen state");
    let decision = reopened
        .latest_decision(&application_id)
        .expect("readable")
        .expect("decision persisted");
    assert_eq!(decision.decision.status, DecisionStatus::Approve);
    assert_eq!(decision.lineage.risk_model_version.as_deref(), Some("xgb-2025.06"));
    assert!(decision.memo_ref.is_some());
}

#[tokio::test]
async fn overrides_supersede_without_erasing_history() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(JsonFileRunStore::open(dir.path().join("state.json")).expect("open"));
    let applications = Arc::new(Applications::with(application()));
    let risk = Arc::new(SwitchableRiskModel {
        online: AtomicBool::new(true),
    });
    let service = UnderwritingService::new(orchestrator(store, applications.clone(), risk));
    let application_id = ApplicationId(APPLICATION.to_string());

    let run_id = service
        .start(&application_id, None, None)
        .await
        .expect("run starts");
    service.orchestrator().wait(&run_id).await.expect("run settles");
    let automated = service.latest_decision(&application_id).expect("decision");

    let overridden = service
        .override_decision(
            &application_id,
            OverrideRequest {
                new_status: DecisionStatus::Reject,
                reason: "concentration limit for trade sector".to_string(),
                actor_id: "risk-officer".to_string(),
            },
        )
        .await
        .expect("override recorded");

    let history = service.decision_history(&application_id).expect("history");
    assert_eq!(history, vec![automated.clone(), overridden.clone()]);
    assert_eq!(
        overridden.origin,
        DecisionOrigin::Override {
            actor_id: "risk-officer".to_string(),
            reason: "concentration limit for trade sector".to_string(),
            supersedes: automated.decision_id.clone(),
        }
    );
    assert_eq!(applications.status(), ApplicationStatus::Rejected);
}

#[test]
fn csv_corpus_is_searchable_after_import() {
    let csv = "document_id,title,section,page,regulation,text\n\
               pojk-33,Prudential Lending,Pasal 5,12,POJK 33/2018,Borrowers must be between 21 and 65 years of age.\n\
               pojk-33,Prudential Lending,Pasal 6,13,POJK 33/2018,The maximum loan-to-value ratio is 80 percent.\n\
               int-07,Internal Credit Policy,,,,Debt-to-income above 40 percent is not permitted.\n";
    let engine = PolicyEngine::in_memory(ChunkingConfig::new(200, 40).expect("valid chunking"));

    for document in parse_policy_csv(csv.as_bytes()).expect("csv parses") {
        engine.index(&document).expect("document indexes");
    }

    let hits = engine
        .query("maximum loan-to-value ratio", 1)
        .expect("query");
    assert_eq!(hits[0].chunk.document_id, "pojk-33");
    assert_eq!(hits[0].chunk.metadata.section.as_deref(), Some("Pasal 5"));
    assert_eq!(engine.chunk_count().expect("count"), 2);
}
