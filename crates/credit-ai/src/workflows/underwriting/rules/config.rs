use serde::{Deserialize, Serialize};

/// Policy limits behind the rule catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleLimits {
    pub min_age: u32,
    pub max_age: u32,
    pub max_debt_to_income: f64,
    pub min_debt_service_coverage: f64,
    pub max_loan_to_value: f64,
    pub max_delinquencies: u32,
    pub max_loan_amount: f64,
    pub restricted_sectors: Vec<String>,
    pub min_monthly_income: f64,
    pub min_credit_score: u16,
    pub max_term_months: u32,
    pub max_recent_inquiries: u32,
    pub stable_occupations: Vec<String>,
}

impl Default for RuleLimits {
    fn default() -> Self {
        Self {
            min_age: 21,
            max_age: 65,
            max_debt_to_income: 0.40,
            min_debt_service_coverage: 1.25,
            max_loan_to_value: 0.80,
            max_delinquencies: 0,
            max_loan_amount: 500_000_000.0,
            restricted_sectors: vec![
                "gambling".to_string(),
                "weapons".to_string(),
                "tobacco".to_string(),
            ],
            min_monthly_income: 3_000_000.0,
            min_credit_score: 550,
            max_term_months: 60,
            max_recent_inquiries: 3,
            stable_occupations: [
                "employee",
                "karyawan",
                "pegawai",
                "civil servant",
                "pns",
                "government",
                "professional",
                "doctor",
                "engineer",
                "teacher",
                "business owner",
            ]
            .iter()
            .map(|value| value.to_string())
            .collect(),
        }
    }
}
