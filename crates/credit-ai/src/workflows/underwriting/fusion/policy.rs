use serde::{Deserialize, Serialize};

use super::RiskRating;

/// Relative contribution of each signal to the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub risk: f64,
    pub reasoning: f64,
    pub rules: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            risk: 0.4,
            reasoning: 0.3,
            rules: 0.3,
        }
    }
}

/// Approve/reject cut-offs in composite units (0..=1000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionThresholds {
    pub approve: u32,
    pub reject: u32,
}

impl DecisionThresholds {
    pub const MAX_COMPOSITE: u32 = 1000;

    pub fn new(approve: u32, reject: u32) -> Result<Self, ThresholdError> {
        if approve > Self::MAX_COMPOSITE {
            return Err(ThresholdError::OutOfRange(approve));
        }
        if reject > approve {
            return Err(ThresholdError::Inverted { approve, reject });
        }
        Ok(Self { approve, reject })
    }

    /// Build thresholds from fractional cut-offs as accepted by the HTTP API.
    pub fn from_fractions(approve: f64, reject: f64) -> Result<Self, ThresholdError> {
        let to_units = |value: f64| -> Result<u32, ThresholdError> {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ThresholdError::InvalidFraction(value));
            }
            Ok((value * Self::MAX_COMPOSITE as f64).round() as u32)
        };
        Self::new(to_units(approve)?, to_units(reject)?)
    }
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            approve: 700,
            reject: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("threshold {0} exceeds the composite scale")]
    OutOfRange(u32),
    #[error("reject threshold {reject} is above approve threshold {approve}")]
    Inverted { approve: u32, reject: u32 },
    #[error("threshold fraction {0} must lie within 0..=1")]
    InvalidFraction(f64),
}

/// Lower bounds for each rating, highest first; anything below the last band is `D`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingBands {
    bands: Vec<(RiskRating, u32)>,
}

impl RatingBands {
    pub fn new(mut bands: Vec<(RiskRating, u32)>) -> Self {
        bands.sort_by(|a, b| b.1.cmp(&a.1));
        Self { bands }
    }

    pub fn rate(&self, composite: u32) -> RiskRating {
        self.bands
            .iter()
            .find(|(_, floor)| composite >= *floor)
            .map(|(rating, _)| *rating)
            .unwrap_or(RiskRating::D)
    }
}

impl Default for RatingBands {
    fn default() -> Self {
        Self::new(vec![
            (RiskRating::AAA, 800),
            (RiskRating::AA, 700),
            (RiskRating::A, 600),
            (RiskRating::BBB, 500),
            (RiskRating::BB, 400),
            (RiskRating::B, 300),
            (RiskRating::C, 200),
        ])
    }
}

/// Moves borderline approvals carrying soft violations into manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftEscalation {
    pub enabled: bool,
    pub margin: u32,
}

impl Default for SoftEscalation {
    fn default() -> Self {
        Self {
            enabled: true,
            margin: 50,
        }
    }
}

/// Static fusion configuration; thresholds travel with each run instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionPolicy {
    pub weights: FusionWeights,
    pub bands: RatingBands,
    pub confidence_floor: f64,
    pub escalation: SoftEscalation,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            bands: RatingBands::default(),
            confidence_floor: 0.6,
            escalation: SoftEscalation::default(),
        }
    }
}
