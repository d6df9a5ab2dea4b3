use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::super::domain::ApplicationId;
use super::super::run::RunId;
use super::FusedDecision;

/// How a decision record came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionOrigin {
    Automated,
    Reviewed {
        reviewer_id: String,
        reason: String,
    },
    Override {
        actor_id: String,
        reason: String,
        supersedes: String,
    },
}

/// Versions of the models that contributed to a decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLineage {
    pub risk_model_version: Option<String>,
    pub reasoning_model_version: Option<String>,
}

/// Immutable decision as persisted by the store. Overrides append a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub application_id: ApplicationId,
    pub run_id: Option<RunId>,
    pub decision: FusedDecision,
    pub lineage: ModelLineage,
    pub memo_ref: Option<String>,
    pub origin: DecisionOrigin,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        application_id: ApplicationId,
        run_id: Option<RunId>,
        decision: FusedDecision,
        lineage: ModelLineage,
        origin: DecisionOrigin,
    ) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            application_id,
            run_id,
            decision,
            lineage,
            memo_ref: None,
            origin,
            decided_at: Utc::now(),
        }
    }

    pub fn with_memo(mut self, memo_ref: Option<String>) -> Self {
        self.memo_ref = memo_ref;
        self
    }
}
