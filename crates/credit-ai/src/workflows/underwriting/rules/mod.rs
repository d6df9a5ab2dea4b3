mod catalog;
mod config;

pub use config::RuleLimits;

use super::domain::ApplicationFacts;
use catalog::Rule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

/// Single rule breach surfaced to decision fusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

impl RuleViolation {
    pub fn summary(&self) -> String {
        format!("[{}] {}", self.rule_id, self.message)
    }
}

/// Outcome of evaluating every rule; violations are accumulated, never short-circuited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub hard_violations: Vec<RuleViolation>,
    pub soft_violations: Vec<RuleViolation>,
    pub pass: bool,
    pub rules_evaluated: usize,
}

/// Documentation view of a catalogued rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDescriptor {
    pub rule_id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
}

/// Stateless evaluator applying the rule catalogue to application facts.
pub struct RuleEngine {
    limits: RuleLimits,
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(limits: RuleLimits) -> Self {
        Self {
            limits,
            rules: catalog::standard_rules(),
        }
    }

    pub fn limits(&self) -> &RuleLimits {
        &self.limits
    }

    pub fn evaluate(&self, facts: &ApplicationFacts) -> RuleEvaluation {
        let mut hard_violations = Vec::new();
        let mut soft_violations = Vec::new();

        for rule in &self.rules {
            let Some(message) = (rule.check)(facts, &self.limits) else {
                continue;
            };
            let violation = RuleViolation {
                rule_id: rule.id.to_string(),
                severity: rule.severity,
                message,
            };
            match rule.severity {
                Severity::Hard => hard_violations.push(violation),
                Severity::Soft => soft_violations.push(violation),
            }
        }

        // Stable ordering keeps the result independent of catalogue order.
        hard_violations.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        soft_violations.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

        RuleEvaluation {
            pass: hard_violations.is_empty(),
            hard_violations,
            soft_violations,
            rules_evaluated: self.rules.len(),
        }
    }

    pub fn catalogue(&self) -> Vec<RuleDescriptor> {
        self.rules
            .iter()
            .map(|rule| RuleDescriptor {
                rule_id: rule.id,
                name: rule.name,
                description: rule.description,
                severity: rule.severity,
            })
            .collect()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RuleLimits::default())
    }
}
