use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for loan applications owned by the intake service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId(pub String);

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Loan application snapshot as handed over by the intake collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub application_id: ApplicationId,
    pub applicant: Applicant,
    pub loan: LoanTerms,
    pub sector: String,
    pub status: ApplicationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applicant {
    pub national_id: String,
    pub full_name: String,
    pub date_of_birth: NaiveDate,
    pub occupation: String,
    pub monthly_income: f64,
}

impl Applicant {
    /// Age in whole years on `on`, accounting for birthdays not yet reached that year.
    pub fn age_on(&self, on: NaiveDate) -> u32 {
        let mut age = on.year() - self.date_of_birth.year();
        if (on.month(), on.day()) < (self.date_of_birth.month(), self.date_of_birth.day()) {
            age -= 1;
        }
        age.max(0) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub amount: f64,
    pub term_months: u32,
    pub purpose: String,
    #[serde(default)]
    pub collateral_value: Option<f64>,
}

/// Lifecycle tracked by the intake service; the core only writes terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Submitted,
    Verifying,
    Underwriting,
    ManualReview,
    Approved,
    Rejected,
    Cancelled,
}

impl ApplicationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::Verifying => "verifying",
            ApplicationStatus::Underwriting => "underwriting",
            ApplicationStatus::ManualReview => "manual_review",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved | ApplicationStatus::Rejected | ApplicationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    BankStatement,
    TaxReturn,
    SalarySlip,
    BusinessLicense,
    IdCard,
    Other,
}

impl DocumentKind {
    pub const fn label(self) -> &'static str {
        match self {
            DocumentKind::IncomeStatement => "income_statement",
            DocumentKind::BalanceSheet => "balance_sheet",
            DocumentKind::CashFlow => "cash_flow",
            DocumentKind::BankStatement => "bank_statement",
            DocumentKind::TaxReturn => "tax_return",
            DocumentKind::SalarySlip => "salary_slip",
            DocumentKind::BusinessLicense => "business_license",
            DocumentKind::IdCard => "id_card",
            DocumentKind::Other => "other",
        }
    }
}

/// Metadata for an uploaded document, as reported by the document service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub kind: DocumentKind,
}

/// Metrics extracted from financial statements, merged across documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFinancials {
    pub metrics: BTreeMap<String, f64>,
}

impl ExtractedFinancials {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Credit bureau snapshot for a borrower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BureauRecord {
    pub credit_score: Option<u16>,
    pub total_accounts: u32,
    pub active_accounts: u32,
    pub delinquent_accounts: u32,
    pub total_debt: f64,
    pub inquiries_last_6m: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistHit {
    pub identifier: String,
    pub reason: String,
    pub severity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistResult {
    pub listed: bool,
    pub hits: Vec<BlacklistHit>,
}

/// Typed facts consumed by the rule engine and the compliance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationFacts {
    pub age: u32,
    pub monthly_income: f64,
    pub loan_amount: f64,
    pub loan_term_months: u32,
    pub debt_to_income: f64,
    pub debt_service_coverage: f64,
    pub loan_to_value: Option<f64>,
    pub delinquency_count: u32,
    pub credit_score: Option<u16>,
    pub inquiries_last_6m: u32,
    pub sector: String,
    pub occupation: String,
    pub blacklisted: bool,
}

/// Named numeric features in a stable order for the risk model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub BTreeMap<String, f64>);

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }
}
