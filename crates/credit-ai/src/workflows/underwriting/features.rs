use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationFacts, BlacklistResult, BureauRecord, ExtractedFinancials,
    FeatureVector,
};

/// Existing bureau debt is assumed to amortise over thirty years.
const EXISTING_DEBT_AMORTISATION_MONTHS: f64 = 360.0;
/// Coverage reported when there is no debt service at all.
const UNBOUNDED_COVERAGE: f64 = 999.0;

/// Aggregated inputs for the assessment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub facts: ApplicationFacts,
    pub features: FeatureVector,
}

/// Pure aggregation of intake outputs; `reference_date` pins the age calculation to the run.
pub fn aggregate(
    application: &Application,
    financials: &ExtractedFinancials,
    bureau: &BureauRecord,
    blacklist: &BlacklistResult,
    reference_date: NaiveDate,
) -> FeatureSet {
    let income = application.applicant.monthly_income;
    let loan = &application.loan;

    let new_payment = if loan.term_months > 0 {
        loan.amount / loan.term_months as f64
    } else {
        loan.amount
    };
    let existing_payment = bureau.total_debt / EXISTING_DEBT_AMORTISATION_MONTHS;
    let debt_service = new_payment + existing_payment;

    let debt_to_income = if income > 0.0 {
        debt_service / income
    } else {
        1.0
    };

    let operating_monthly = financials
        .metric("operating_income")
        .map(|annual| annual / 12.0)
        .unwrap_or(0.0);
    let coverage_income = income + operating_monthly;
    let debt_service_coverage = if coverage_income <= 0.0 {
        0.0
    } else if debt_service <= 0.0 {
        UNBOUNDED_COVERAGE
    } else {
        coverage_income / debt_service
    };

    let loan_to_value = loan.collateral_value.map(|value| {
        if value > 0.0 {
            loan.amount / value
        } else {
            1.0
        }
    });

    let facts = ApplicationFacts {
        age: application.applicant.age_on(reference_date),
        monthly_income: income,
        loan_amount: loan.amount,
        loan_term_months: loan.term_months,
        debt_to_income,
        debt_service_coverage,
        loan_to_value,
        delinquency_count: bureau.delinquent_accounts,
        credit_score: bureau.credit_score,
        inquiries_last_6m: bureau.inquiries_last_6m,
        sector: application.sector.clone(),
        occupation: application.applicant.occupation.clone(),
        blacklisted: blacklist.listed,
    };

    let mut features = FeatureVector::default();
    features.insert("age", facts.age as f64);
    features.insert("monthly_income", income);
    features.insert("loan_amount", loan.amount);
    features.insert("loan_term_months", loan.term_months as f64);
    features.insert(
        "payment_to_income_ratio",
        if income > 0.0 { new_payment / income } else { 1.0 },
    );
    features.insert("debt_to_income", debt_to_income);
    features.insert("debt_service_coverage", debt_service_coverage);
    features.insert("delinquent_accounts", bureau.delinquent_accounts as f64);
    features.insert("inquiries_last_6m", bureau.inquiries_last_6m as f64);
    features.insert("total_debt", bureau.total_debt);
    if let Some(score) = bureau.credit_score {
        features.insert("credit_score", score as f64);
    }
    if let Some(ltv) = loan_to_value {
        features.insert("loan_to_value", ltv);
    }
    for (name, value) in &financials.metrics {
        features.insert(format!("fin_{name}"), *value);
    }

    FeatureSet { facts, features }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::underwriting::domain::{
        Applicant, ApplicationId, ApplicationStatus, LoanTerms,
    };

    fn application() -> Application {
        Application {
            application_id: ApplicationId("app-1".to_string()),
            applicant: Applicant {
                national_id: "3171000000000001".to_string(),
                full_name: "Sari Wulandari".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1980, 6, 15).expect("valid"),
                occupation: "Employee".to_string(),
                monthly_income: 20_000_000.0,
            },
            loan: LoanTerms {
                amount: 120_000_000.0,
                term_months: 24,
                purpose: "Working capital".to_string(),
                collateral_value: Some(200_000_000.0),
            },
            sector: "retail".to_string(),
            status: ApplicationStatus::Underwriting,
        }
    }

    fn bureau() -> BureauRecord {
        BureauRecord {
            credit_score: Some(700),
            total_accounts: 3,
            active_accounts: 2,
            delinquent_accounts: 0,
            total_debt: 36_000_000.0,
            inquiries_last_6m: 1,
        }
    }

    #[test]
    fn computes_ratios_from_terms_and_bureau_debt() {
        let mut financials = ExtractedFinancials::default();
        financials
            .metrics
            .insert("operating_income".to_string(), 60_000_000.0);
        let set = aggregate(
            &application(),
            &financials,
            &bureau(),
            &BlacklistResult::default(),
            NaiveDate::from_ymd_opt(2025, 6, 14).expect("valid"),
        );

        // 5,000,000 new payment + 100,000 existing over 20,000,000 income.
        assert!((set.facts.debt_to_income - 0.255).abs() < 1e-9);
        // (20,000,000 + 5,000,000) / 5,100,000
        assert!((set.facts.debt_service_coverage - 25.0 / 5.1).abs() < 1e-9);
        assert_eq!(set.facts.loan_to_value, Some(0.6));
        assert_eq!(set.facts.age, 44, "birthday not reached on the reference date");
        assert_eq!(set.features.get("credit_score"), Some(700.0));
        assert_eq!(set.features.get("fin_operating_income"), Some(60_000_000.0));
    }

    #[test]
    fn missing_income_maxes_out_dti() {
        let mut application = application();
        application.applicant.monthly_income = 0.0;
        let set = aggregate(
            &application,
            &ExtractedFinancials::default(),
            &bureau(),
            &BlacklistResult::default(),
            NaiveDate::from_ymd_opt(2025, 6, 15).expect("valid"),
        );

        assert_eq!(set.facts.debt_to_income, 1.0);
        assert_eq!(set.facts.debt_service_coverage, 0.0);
        assert_eq!(set.facts.age, 45);
    }
}
