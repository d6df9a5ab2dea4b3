use chrono::NaiveDate;
use credit_ai::workflows::underwriting::{
    Applicant, Application, ApplicationId, ApplicationRepository, ApplicationStatus, BlacklistClient,
    BlacklistHit, BlacklistResult, BureauRecord, CreditBureauClient, DocumentKind, DocumentService,
    DocumentSummary, ExtractedFinancials, FeatureVector, Generation, GenerationRequest,
    LanguageModel, LoanTerms, ModelPrediction, PolicyDocument, PolicyMetadata, PromptTask,
    RiskModel, ServiceError,
};
use futures_util::future::BoxFuture;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Intake data for one sample applicant.
#[derive(Debug, Clone)]
struct SampleFile {
    application: Application,
    documents: Vec<DocumentSummary>,
    financials: ExtractedFinancials,
    bureau: BureauRecord,
    blacklist: BlacklistResult,
}

/// In-process stand-in for the intake, document, bureau, and blacklist services.
#[derive(Default, Clone)]
pub(crate) struct SampleIntake {
    files: Arc<Mutex<HashMap<ApplicationId, SampleFile>>>,
}

impl SampleIntake {
    /// Three applicants: a clean approval, a borderline file, and a blacklisted borrower.
    pub(crate) fn seeded() -> Self {
        let intake = Self::default();
        if let Ok(mut files) = intake.files.lock() {
            for file in sample_files() {
                files.insert(file.application.application_id.clone(), file);
            }
        }
        intake
    }

    pub(crate) fn application_ids(&self) -> Result<Vec<ApplicationId>, ServiceError> {
        let mut ids: Vec<ApplicationId> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Rewrite the stored applicant, e.g. to try a different age in the demo.
    pub(crate) fn adjust_applicant(
        &self,
        id: &ApplicationId,
        adjust: impl FnOnce(&mut Applicant),
    ) -> Result<(), ServiceError> {
        let mut files = self.lock()?;
        let file = files
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("application {id}")))?;
        adjust(&mut file.application.applicant);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ApplicationId, SampleFile>>, ServiceError> {
        self.files
            .lock()
            .map_err(|_| ServiceError::Unavailable("sample intake lock poisoned".to_string()))
    }

    fn file(&self, id: &ApplicationId) -> Result<SampleFile, ServiceError> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("application {id}")))
    }

    fn by_national_id(&self, national_id: &str) -> Result<SampleFile, ServiceError> {
        self.lock()?
            .values()
            .find(|file| file.application.applicant.national_id == national_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("national id {national_id}")))
    }
}

impl ApplicationRepository for SampleIntake {
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, ServiceError> {
        Ok(self.lock()?.get(id).map(|file| file.application.clone()))
    }

    fn update_status(
        &self,
        id: &ApplicationId,
        status: ApplicationStatus,
    ) -> Result<(), ServiceError> {
        let mut files = self.lock()?;
        let file = files
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("application {id}")))?;
        file.application.status = status;
        Ok(())
    }
}

impl DocumentService for SampleIntake {
    fn list_documents<'a>(
        &'a self,
        application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<Vec<DocumentSummary>, ServiceError>> {
        Box::pin(async move { Ok(self.file(application_id)?.documents) })
    }

    fn extracted_financials<'a>(
        &'a self,
        application_id: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<ExtractedFinancials, ServiceError>> {
        Box::pin(async move { Ok(self.file(application_id)?.financials) })
    }
}

impl CreditBureauClient for SampleIntake {
    fn fetch<'a>(&'a self, national_id: &'a str) -> BoxFuture<'a, Result<BureauRecord, ServiceError>> {
        Box::pin(async move { Ok(self.by_national_id(national_id)?.bureau) })
    }
}

impl BlacklistClient for SampleIntake {
    fn check<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<BlacklistResult, ServiceError>> {
        Box::pin(async move {
            match self.by_national_id(identifier) {
                Ok(file) => Ok(file.blacklist),
                Err(ServiceError::NotFound(_)) => Ok(BlacklistResult::default()),
                Err(err) => Err(err),
            }
        })
    }
}

/// Logistic scorecard over debt burden and delinquencies, optionally pinned to one probability.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScorecardRiskModel {
    fixed_probability: Option<f64>,
}

impl ScorecardRiskModel {
    const VERSION: &'static str = "scorecard-demo-1";

    pub(crate) fn pinned(probability_of_default: f64) -> Self {
        Self {
            fixed_probability: Some(probability_of_default),
        }
    }

    fn probability(features: &FeatureVector) -> f64 {
        let dti = features.get("debt_to_income").unwrap_or(0.0);
        let delinquent = features.get("delinquent_accounts").unwrap_or(0.0);
        let logit = -3.2 + 5.0 * dti + 0.9 * delinquent;
        1.0 / (1.0 + (-logit).exp())
    }
}

impl RiskModel for ScorecardRiskModel {
    fn predict<'a>(
        &'a self,
        features: &'a FeatureVector,
    ) -> BoxFuture<'a, Result<ModelPrediction, ServiceError>> {
        Box::pin(async move {
            Ok(ModelPrediction {
                probability_of_default: self
                    .fixed_probability
                    .unwrap_or_else(|| Self::probability(features)),
                model_version: Self::VERSION.to_string(),
                feature_importances: BTreeMap::from([
                    ("debt_to_income".to_string(), 0.55),
                    ("delinquent_accounts".to_string(), 0.30),
                    ("monthly_income".to_string(), -0.15),
                ]),
            })
        })
    }
}

/// Offline language model that answers from the figures quoted in each prompt.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TemplateLanguageModel {
    /// Qualitative score and confidence returned for every credit analysis.
    fixed_analysis: Option<(f64, f64)>,
}

impl TemplateLanguageModel {
    const VERSION: &'static str = "template-demo-1";

    pub(crate) fn pinned(qualitative_score: f64, confidence: f64) -> Self {
        Self {
            fixed_analysis: Some((qualitative_score, confidence)),
        }
    }

    fn quoted_dti(prompt: &str) -> Option<f64> {
        prompt
            .lines()
            .find_map(|line| line.trim().strip_prefix("- DTI:"))
            .and_then(|value| value.trim().parse().ok())
    }

    fn respond(&self, request: &GenerationRequest) -> String {
        let dti = Self::quoted_dti(&request.prompt);
        match request.task {
            PromptTask::CreditAnalysis => {
                let (score, confidence) = self.fixed_analysis.unwrap_or_else(|| match dti {
                    Some(dti) => ((1.0 - dti).clamp(0.0, 1.0), 0.8),
                    None => (0.5, 0.4),
                });
                serde_json::json!({
                    "qualitative_score": (score * 100.0).round() / 100.0,
                    "confidence": confidence,
                    "narrative": "Repayment capacity judged from the quoted debt burden.",
                })
                .to_string()
            }
            PromptTask::ComplianceInterpretation => {
                let compliant = dti.map_or(true, |dti| dti <= 0.6);
                serde_json::json!({
                    "compliant": compliant,
                    "severity": "soft",
                    "finding": if compliant {
                        "Application facts sit within the quoted passages."
                    } else {
                        "Debt-to-income is above the level the passages allow."
                    },
                })
                .to_string()
            }
            PromptTask::CreditMemo => {
                let mut memo = String::from("# Credit Memorandum\n\n");
                for line in request.prompt.lines().filter(|line| line.starts_with("- ")) {
                    memo.push_str(line);
                    memo.push('\n');
                }
                memo.push_str("\nPrepared from the automated underwriting record.\n");
                memo
            }
        }
    }
}

impl LanguageModel for TemplateLanguageModel {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<Generation, ServiceError>> {
        Box::pin(async move {
            Ok(Generation {
                text: self.respond(request),
                model_version: Self::VERSION.to_string(),
            })
        })
    }
}

/// Lending policy excerpts indexed when no corpus file is configured.
pub(crate) fn builtin_policy_documents() -> Vec<PolicyDocument> {
    vec![
        PolicyDocument {
            document_id: "pojk-33-2018".to_string(),
            text: "Debt-to-income for consumer and micro loans must not exceed 40 percent of \
                   verified monthly income. Loans above this ratio require documented \
                   mitigants and senior credit officer approval."
                .to_string(),
            metadata: PolicyMetadata {
                title: "Prudential Lending Standards".to_string(),
                section: Some("Pasal 5".to_string()),
                page: Some(12),
                regulation: Some("POJK 33/2018".to_string()),
            },
        },
        PolicyDocument {
            document_id: "pojk-40-2019".to_string(),
            text: "Secured facilities must keep loan-to-value at or below 80 percent of the \
                   appraised collateral value. Borrowers with active delinquencies are not \
                   eligible for new exposure until arrears are settled."
                .to_string(),
            metadata: PolicyMetadata {
                title: "Asset Quality Assessment".to_string(),
                section: Some("Pasal 9".to_string()),
                page: Some(21),
                regulation: Some("POJK 40/2019".to_string()),
            },
        },
        PolicyDocument {
            document_id: "int-credit-manual".to_string(),
            text: "Applicants must be between 21 and 65 years old at maturity. Income must be \
                   evidenced by bank statements or financial statements covering at least \
                   three months."
                .to_string(),
            metadata: PolicyMetadata {
                title: "Internal Credit Manual".to_string(),
                section: Some("Eligibility".to_string()),
                page: None,
                regulation: None,
            },
        },
    ]
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

fn documents(kinds: &[(&str, DocumentKind)]) -> Vec<DocumentSummary> {
    kinds
        .iter()
        .map(|(id, kind)| DocumentSummary {
            document_id: (*id).to_string(),
            kind: *kind,
        })
        .collect()
}

fn sample_files() -> Vec<SampleFile> {
    vec![
        SampleFile {
            application: Application {
                application_id: ApplicationId("app-1001".to_string()),
                applicant: Applicant {
                    national_id: "3174011505800001".to_string(),
                    full_name: "Siti Rahmawati".to_string(),
                    date_of_birth: date(1980, 5, 15),
                    occupation: "Business Owner".to_string(),
                    monthly_income: 20_000_000.0,
                },
                loan: LoanTerms {
                    amount: 120_000_000.0,
                    term_months: 24,
                    purpose: "Working capital for grocery distribution".to_string(),
                    collateral_value: Some(250_000_000.0),
                },
                sector: "trade".to_string(),
                status: ApplicationStatus::Underwriting,
            },
            documents: documents(&[
                ("ktp-1001", DocumentKind::IdCard),
                ("bank-1001", DocumentKind::BankStatement),
                ("is-1001", DocumentKind::IncomeStatement),
            ]),
            financials: ExtractedFinancials {
                metrics: BTreeMap::from([
                    ("net_income".to_string(), 96_000_000.0),
                    ("revenue".to_string(), 540_000_000.0),
                ]),
            },
            bureau: BureauRecord {
                credit_score: Some(742),
                total_accounts: 4,
                active_accounts: 2,
                delinquent_accounts: 0,
                total_debt: 48_000_000.0,
                inquiries_last_6m: 1,
            },
            blacklist: BlacklistResult::default(),
        },
        SampleFile {
            application: Application {
                application_id: ApplicationId("app-1002".to_string()),
                applicant: Applicant {
                    national_id: "3273022208910002".to_string(),
                    full_name: "Agus Pratama".to_string(),
                    date_of_birth: date(1991, 8, 22),
                    occupation: "Farmer".to_string(),
                    monthly_income: 7_500_000.0,
                },
                loan: LoanTerms {
                    amount: 45_000_000.0,
                    term_months: 18,
                    purpose: "Irrigation pump and seed stock".to_string(),
                    collateral_value: None,
                },
                sector: "agriculture".to_string(),
                status: ApplicationStatus::Underwriting,
            },
            documents: documents(&[
                ("ktp-1002", DocumentKind::IdCard),
                ("bank-1002", DocumentKind::BankStatement),
            ]),
            financials: ExtractedFinancials::default(),
            bureau: BureauRecord {
                credit_score: Some(655),
                total_accounts: 3,
                active_accounts: 2,
                delinquent_accounts: 1,
                total_debt: 30_000_000.0,
                inquiries_last_6m: 3,
            },
            blacklist: BlacklistResult::default(),
        },
        SampleFile {
            application: Application {
                application_id: ApplicationId("app-1003".to_string()),
                applicant: Applicant {
                    national_id: "3578030303850003".to_string(),
                    full_name: "Budi Santoso".to_string(),
                    date_of_birth: date(1985, 3, 3),
                    occupation: "Trader".to_string(),
                    monthly_income: 12_000_000.0,
                },
                loan: LoanTerms {
                    amount: 80_000_000.0,
                    term_months: 36,
                    purpose: "Shop renovation".to_string(),
                    collateral_value: Some(90_000_000.0),
                },
                sector: "trade".to_string(),
                status: ApplicationStatus::Underwriting,
            },
            documents: documents(&[
                ("ktp-1003", DocumentKind::IdCard),
                ("bs-1003", DocumentKind::BalanceSheet),
            ]),
            financials: ExtractedFinancials::default(),
            bureau: BureauRecord {
                credit_score: Some(690),
                total_accounts: 2,
                active_accounts: 1,
                delinquent_accounts: 0,
                total_debt: 10_000_000.0,
                inquiries_last_6m: 0,
            },
            blacklist: BlacklistResult {
                listed: true,
                hits: vec![BlacklistHit {
                    identifier: "3578030303850003".to_string(),
                    reason: "fraudulent collateral documents".to_string(),
                    severity: "high".to_string(),
                }],
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_ai::workflows::underwriting::reasoning::GenerationSettings;

    #[test]
    fn seeded_intake_lists_every_sample() {
        let intake = SampleIntake::seeded();
        let ids = intake.application_ids().expect("ids");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].0, "app-1001");
    }

    #[tokio::test]
    async fn unknown_identifiers_are_not_blacklisted() {
        let intake = SampleIntake::seeded();
        let result = intake.check("0000").await.expect("lookup");
        assert!(!result.listed);
        let listed = intake.check("3578030303850003").await.expect("lookup");
        assert!(listed.listed);
    }

    #[test]
    fn scorecard_rises_with_debt_burden() {
        let mut low = FeatureVector::default();
        low.insert("debt_to_income", 0.1);
        let mut high = FeatureVector::default();
        high.insert("debt_to_income", 0.6);
        high.insert("delinquent_accounts", 1.0);
        assert!(ScorecardRiskModel::probability(&low) < ScorecardRiskModel::probability(&high));
    }

    #[tokio::test]
    async fn pinned_models_ignore_inputs() {
        let prediction = ScorecardRiskModel::pinned(0.3)
            .predict(&FeatureVector::default())
            .await
            .expect("prediction");
        assert_eq!(prediction.probability_of_default, 0.3);

        let request = GenerationRequest {
            task: PromptTask::CreditAnalysis,
            prompt: "- DTI: 0.100".to_string(),
            settings: GenerationSettings::deterministic(),
        };
        let generation = TemplateLanguageModel::pinned(0.25, 0.9)
            .generate(&request)
            .await
            .expect("generation");
        let body: serde_json::Value = serde_json::from_str(&generation.text).expect("json");
        assert_eq!(body["qualitative_score"], 0.25);
        assert_eq!(body["confidence"], 0.9);
    }

    #[test]
    fn template_model_reads_quoted_ratio() {
        assert_eq!(
            TemplateLanguageModel::quoted_dti("## Facts\n- DTI: 0.350\n"),
            Some(0.35)
        );
        assert_eq!(TemplateLanguageModel::quoted_dti("no figures"), None);
    }
}
