use super::super::domain::ApplicationFacts;
use super::config::RuleLimits;
use super::Severity;

type Predicate = fn(&ApplicationFacts, &RuleLimits) -> Option<String>;

/// Named predicate over typed facts; `check` returns a message when the rule is breached.
pub(crate) struct Rule {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub check: Predicate,
}

pub(crate) fn standard_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "POJK_AGE_001",
            name: "Borrower Age Limit",
            description: "Borrower age must fall within the regulatory range",
            severity: Severity::Hard,
            check: |facts, limits| {
                (facts.age < limits.min_age || facts.age > limits.max_age).then(|| {
                    format!(
                        "borrower age {} outside acceptable range ({}-{})",
                        facts.age, limits.min_age, limits.max_age
                    )
                })
            },
        },
        Rule {
            id: "POJK_DTI_001",
            name: "Maximum DTI Ratio",
            description: "Debt-to-income ratio must not exceed the regulatory maximum",
            severity: Severity::Hard,
            check: |facts, limits| {
                (facts.debt_to_income > limits.max_debt_to_income).then(|| {
                    format!(
                        "DTI ratio {:.1}% exceeds {:.0}% limit",
                        facts.debt_to_income * 100.0,
                        limits.max_debt_to_income * 100.0
                    )
                })
            },
        },
        Rule {
            id: "POJK_LTV_001",
            name: "Maximum Loan-to-Value Ratio",
            description: "Secured loans must stay within the loan-to-value cap",
            severity: Severity::Hard,
            check: |facts, limits| match facts.loan_to_value {
                Some(ltv) if ltv > limits.max_loan_to_value => Some(format!(
                    "LTV {:.1}% exceeds {:.0}% limit",
                    ltv * 100.0,
                    limits.max_loan_to_value * 100.0
                )),
                _ => None,
            },
        },
        Rule {
            id: "POJK_CREDIT_001",
            name: "No Active Delinquencies",
            description: "Borrower must not carry delinquent accounts",
            severity: Severity::Hard,
            check: |facts, limits| {
                (facts.delinquency_count > limits.max_delinquencies).then(|| {
                    format!(
                        "{} delinquent account(s) reported by the bureau",
                        facts.delinquency_count
                    )
                })
            },
        },
        Rule {
            id: "POJK_DSCR_001",
            name: "Minimum DSCR",
            description: "Debt service coverage must meet the regulatory minimum",
            severity: Severity::Hard,
            check: |facts, limits| {
                (facts.debt_service_coverage < limits.min_debt_service_coverage).then(|| {
                    format!(
                        "DSCR {:.2} below minimum {:.2}",
                        facts.debt_service_coverage, limits.min_debt_service_coverage
                    )
                })
            },
        },
        Rule {
            id: "INT_AMOUNT_001",
            name: "Maximum Loan Amount",
            description: "Loan amount must not exceed the internal exposure cap",
            severity: Severity::Hard,
            check: |facts, limits| {
                (facts.loan_amount > limits.max_loan_amount).then(|| {
                    format!(
                        "loan amount {:.0} exceeds cap {:.0}",
                        facts.loan_amount, limits.max_loan_amount
                    )
                })
            },
        },
        Rule {
            id: "INT_SECTOR_001",
            name: "Restricted Sector",
            description: "Lending to restricted sectors is prohibited",
            severity: Severity::Hard,
            check: |facts, limits| {
                let sector = facts.sector.trim().to_ascii_lowercase();
                limits
                    .restricted_sectors
                    .iter()
                    .any(|restricted| restricted.eq_ignore_ascii_case(&sector))
                    .then(|| format!("sector '{}' is restricted", facts.sector))
            },
        },
        Rule {
            id: "INT_BLACKLIST_001",
            name: "Blacklist Screening",
            description: "Borrower identifiers must not appear on the internal blacklist",
            severity: Severity::Hard,
            check: |facts, _| {
                facts
                    .blacklisted
                    .then(|| "borrower identifier appears on the blacklist".to_string())
            },
        },
        Rule {
            id: "POJK_INCOME_001",
            name: "Minimum Monthly Income",
            description: "Borrower should meet the minimum monthly income",
            severity: Severity::Soft,
            check: |facts, limits| {
                (facts.monthly_income < limits.min_monthly_income).then(|| {
                    format!(
                        "monthly income {:.0} below minimum {:.0}",
                        facts.monthly_income, limits.min_monthly_income
                    )
                })
            },
        },
        Rule {
            id: "INT_CREDIT_001",
            name: "Minimum Credit Score",
            description: "Bureau credit score should meet the internal minimum",
            severity: Severity::Soft,
            check: |facts, limits| match facts.credit_score {
                Some(score) if score >= limits.min_credit_score => None,
                Some(score) => Some(format!(
                    "credit score {score} below minimum {}",
                    limits.min_credit_score
                )),
                None => Some("no bureau credit score available".to_string()),
            },
        },
        Rule {
            id: "INT_TERM_001",
            name: "Maximum Loan Term",
            description: "Loan term should not exceed the internal maximum",
            severity: Severity::Soft,
            check: |facts, limits| {
                (facts.loan_term_months > limits.max_term_months).then(|| {
                    format!(
                        "term {} months exceeds {} months",
                        facts.loan_term_months, limits.max_term_months
                    )
                })
            },
        },
        Rule {
            id: "INT_INQUIRY_001",
            name: "Recent Credit Inquiries",
            description: "Limit on bureau inquiries over the last six months",
            severity: Severity::Soft,
            check: |facts, limits| {
                (facts.inquiries_last_6m > limits.max_recent_inquiries).then(|| {
                    format!(
                        "{} inquiries in the last 6 months (max {})",
                        facts.inquiries_last_6m, limits.max_recent_inquiries
                    )
                })
            },
        },
        Rule {
            id: "INT_EMPLOY_001",
            name: "Employment Stability",
            description: "Borrower should hold stable employment",
            severity: Severity::Soft,
            check: |facts, limits| {
                let occupation = facts.occupation.to_lowercase();
                let stable = limits
                    .stable_occupations
                    .iter()
                    .any(|candidate| occupation.contains(candidate.as_str()));
                (!stable).then(|| format!("occupation '{}' not considered stable", facts.occupation))
            },
        },
    ]
}
