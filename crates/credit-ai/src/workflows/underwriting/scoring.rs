use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::collaborators::ServiceError;
use super::domain::FeatureVector;

/// Raw output of the statistical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub probability_of_default: f64,
    pub model_version: String,
    pub feature_importances: BTreeMap<String, f64>,
}

/// Trained risk model collaborator.
pub trait RiskModel: Send + Sync {
    fn predict<'a>(
        &'a self,
        features: &'a FeatureVector,
    ) -> BoxFuture<'a, Result<ModelPrediction, ServiceError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAttribution {
    pub feature: String,
    pub contribution: f64,
}

/// Normalised creditworthiness derived from the model's default probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// `1 - probability_of_default`, higher is better.
    pub normalized_score: f64,
    pub probability_of_default: f64,
    pub model_version: String,
    pub attribution: Vec<FeatureAttribution>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
    #[error("missing required features: {}", .0.join(", "))]
    MissingFeatures(Vec<String>),
    #[error("feature {0} is not a finite number")]
    NonFiniteFeature(String),
    #[error("model returned an invalid probability: {0}")]
    InvalidOutput(f64),
    #[error("risk model timed out after {0} ms")]
    Timeout(u64),
    #[error("risk model unavailable: {0}")]
    Service(#[from] ServiceError),
}

impl ScoringError {
    pub fn is_transient(&self) -> bool {
        match self {
            ScoringError::Timeout(_) => true,
            ScoringError::Service(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Features the model cannot score without.
pub const DEFAULT_REQUIRED_FEATURES: [&str; 6] = [
    "age",
    "monthly_income",
    "loan_amount",
    "loan_term_months",
    "debt_to_income",
    "delinquent_accounts",
];

pub struct RiskScoreAdapter {
    model: Arc<dyn RiskModel>,
    required: Vec<String>,
    timeout: Duration,
}

impl RiskScoreAdapter {
    pub fn new(model: Arc<dyn RiskModel>, timeout: Duration) -> Self {
        Self {
            model,
            required: DEFAULT_REQUIRED_FEATURES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            timeout,
        }
    }

    pub fn with_required(mut self, required: Vec<String>) -> Self {
        self.required = required;
        self
    }

    pub async fn score(&self, features: &FeatureVector) -> Result<RiskAssessment, ScoringError> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| features.get(name).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ScoringError::MissingFeatures(missing));
        }
        if let Some((name, _)) = features.0.iter().find(|(_, value)| !value.is_finite()) {
            return Err(ScoringError::NonFiniteFeature(name.clone()));
        }

        let prediction = tokio::time::timeout(self.timeout, self.model.predict(features))
            .await
            .map_err(|_| ScoringError::Timeout(self.timeout.as_millis() as u64))??;

        let pd = prediction.probability_of_default;
        if !pd.is_finite() || !(0.0..=1.0).contains(&pd) {
            return Err(ScoringError::InvalidOutput(pd));
        }

        let mut attribution: Vec<FeatureAttribution> = prediction
            .feature_importances
            .into_iter()
            .filter(|(_, contribution)| contribution.is_finite())
            .map(|(feature, contribution)| FeatureAttribution {
                feature,
                contribution,
            })
            .collect();
        attribution.sort_by(|a, b| {
            b.contribution
                .abs()
                .total_cmp(&a.contribution.abs())
                .then_with(|| a.feature.cmp(&b.feature))
        });

        Ok(RiskAssessment {
            normalized_score: 1.0 - pd,
            probability_of_default: pd,
            model_version: prediction.model_version,
            attribution,
        })
    }
}
