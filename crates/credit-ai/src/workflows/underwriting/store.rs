//! Durable run state, audit trail, and decision history.
//!
//! Every mutation goes through [`RunStore::apply`], which commits a run snapshot, its audit
//! entries, and an optional decision record as one unit. Run snapshots carry the revision they
//! were read at; a stale revision or a write against a cancelled run is refused.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::ApplicationId;
use super::fusion::DecisionRecord;
use super::run::{RunId, RunStatus, StepName, WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RunStarted,
    StepStarted,
    StepCompleted,
    StepRetrying,
    StepFailed,
    StepSkipped,
    AwaitingReview,
    ReviewSubmitted,
    RunResumed,
    RunInterrupted,
    RunFailed,
    RunCancelled,
    RunCompleted,
    DecisionOverridden,
}

/// Append-only audit record; the store assigns `sequence` on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub sequence: u64,
    pub run_id: Option<RunId>,
    pub application_id: ApplicationId,
    pub action: AuditAction,
    pub step: Option<StepName>,
    pub actor: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub const SYSTEM_ACTOR: &'static str = "system";

    pub fn system(run: &WorkflowRun, action: AuditAction, detail: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            run_id: Some(run.run_id.clone()),
            application_id: run.application_id.clone(),
            action,
            step: None,
            actor: Self::SYSTEM_ACTOR.to_string(),
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    pub fn for_step(
        run: &WorkflowRun,
        step: StepName,
        action: AuditAction,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            step: Some(step),
            ..Self::system(run, action, detail)
        }
    }

    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Unit of work committed atomically.
#[derive(Debug, Clone, Default)]
pub struct StoreCommit {
    pub run: Option<WorkflowRun>,
    pub audit: Vec<AuditEntry>,
    pub decision: Option<DecisionRecord>,
}

impl StoreCommit {
    pub fn run(run: WorkflowRun) -> Self {
        Self {
            run: Some(run),
            ..Self::default()
        }
    }

    pub fn with_audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }

    pub fn with_decision(mut self, decision: DecisionRecord) -> Self {
        self.decision = Some(decision);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("run {run_id} changed concurrently (expected revision {expected}, found {found})")]
    RevisionConflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },
    #[error("run {0} is cancelled")]
    RunCancelled(RunId),
    #[error("decision {0} already recorded")]
    DuplicateDecision(String),
    #[error("state file error: {0}")]
    Io(String),
    #[error("state serialization failed: {0}")]
    Serialization(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Durable home for runs, audit entries, and decisions.
pub trait RunStore: Send + Sync {
    /// Commit atomically, returning the run's new revision when a run snapshot was included.
    fn apply(&self, commit: StoreCommit) -> Result<Option<u64>, StoreError>;
    fn fetch_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError>;
    /// Runs that are pending, running, or waiting for review.
    fn active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError>;
    fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, StoreError>;
    fn application_audit(&self, application_id: &ApplicationId)
        -> Result<Vec<AuditEntry>, StoreError>;
    /// Decisions for an application, oldest first.
    fn decisions_for(&self, application_id: &ApplicationId)
        -> Result<Vec<DecisionRecord>, StoreError>;
    /// Every run recorded for an application, oldest first.
    fn runs_for(&self, application_id: &ApplicationId) -> Result<Vec<WorkflowRun>, StoreError>;

    fn latest_decision(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<DecisionRecord>, StoreError> {
        Ok(self.decisions_for(application_id)?.pop())
    }

    /// The run a new start would conflict with: one still in flight or parked, otherwise a
    /// failed one that can still be resumed.
    fn active_run_for(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let runs = self.runs_for(application_id)?;
        let active = runs.iter().find(|run| is_active(run.status));
        let resumable = runs.iter().find(|run| run.status == RunStatus::Failed);
        Ok(active.or(resumable).cloned())
    }
}

fn is_active(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Pending | RunStatus::Running | RunStatus::AwaitingReview
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    runs: BTreeMap<RunId, WorkflowRun>,
    audit: Vec<AuditEntry>,
    decisions: Vec<DecisionRecord>,
    next_sequence: u64,
}

impl StoreState {
    /// Validates the whole commit before touching any state.
    fn apply(&mut self, commit: StoreCommit) -> Result<Option<u64>, StoreError> {
        if let Some(run) = &commit.run {
            let found = self.runs.get(&run.run_id);
            if let Some(existing) = found {
                if existing.status == RunStatus::Cancelled {
                    return Err(StoreError::RunCancelled(run.run_id.clone()));
                }
            }
            let found_revision = found.map(|existing| existing.revision).unwrap_or(0);
            if found_revision != run.revision {
                return Err(StoreError::RevisionConflict {
                    run_id: run.run_id.clone(),
                    expected: run.revision,
                    found: found_revision,
                });
            }
        }
        if let Some(decision) = &commit.decision {
            if self
                .decisions
                .iter()
                .any(|existing| existing.decision_id == decision.decision_id)
            {
                return Err(StoreError::DuplicateDecision(decision.decision_id.clone()));
            }
        }

        let revision = commit.run.map(|mut run| {
            run.revision += 1;
            let revision = run.revision;
            self.runs.insert(run.run_id.clone(), run);
            revision
        });
        for mut entry in commit.audit {
            self.next_sequence += 1;
            entry.sequence = self.next_sequence;
            self.audit.push(entry);
        }
        if let Some(decision) = commit.decision {
            self.decisions.push(decision);
        }
        Ok(revision)
    }

    fn active_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .values()
            .filter(|run| is_active(run.status))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    fn runs_for(&self, application_id: &ApplicationId) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .values()
            .filter(|run| &run.application_id == application_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    fn audit_trail(&self, run_id: &RunId) -> Vec<AuditEntry> {
        self.audit
            .iter()
            .filter(|entry| entry.run_id.as_ref() == Some(run_id))
            .cloned()
            .collect()
    }

    fn application_audit(&self, application_id: &ApplicationId) -> Vec<AuditEntry> {
        self.audit
            .iter()
            .filter(|entry| &entry.application_id == application_id)
            .cloned()
            .collect()
    }

    fn decisions_for(&self, application_id: &ApplicationId) -> Vec<DecisionRecord> {
        self.decisions
            .iter()
            .filter(|record| &record.application_id == application_id)
            .cloned()
            .collect()
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: Mutex<StoreState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut guard))
    }
}

impl RunStore for InMemoryRunStore {
    fn apply(&self, commit: StoreCommit) -> Result<Option<u64>, StoreError> {
        self.with_state(|state| state.apply(commit))?
    }

    fn fetch_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError> {
        self.with_state(|state| state.runs.get(run_id).cloned())
    }

    fn active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        self.with_state(|state| state.active_runs())
    }

    fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, StoreError> {
        self.with_state(|state| state.audit_trail(run_id))
    }

    fn application_audit(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.with_state(|state| state.application_audit(application_id))
    }

    fn decisions_for(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        self.with_state(|state| state.decisions_for(application_id))
    }

    fn runs_for(&self, application_id: &ApplicationId) -> Result<Vec<WorkflowRun>, StoreError> {
        self.with_state(|state| state.runs_for(application_id))
    }
}

/// Store persisted as a single JSON document, rewritten through a temp file on every commit.
#[derive(Debug)]
pub struct JsonFileRunStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileRunStore {
    /// Open the state file, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read(&path).map_err(|err| StoreError::Io(err.to_string()))?;
            serde_json::from_slice(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))?;
            }
        }
        let encoded = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, encoded).map_err(|err| StoreError::Io(err.to_string()))?;
        std::fs::rename(&temp, &self.path).map_err(|err| StoreError::Io(err.to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        let guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard))
    }
}

impl RunStore for JsonFileRunStore {
    fn apply(&self, commit: StoreCommit) -> Result<Option<u64>, StoreError> {
        let mut guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = guard.clone();
        let revision = next.apply(commit)?;
        self.persist(&next)?;
        *guard = next;
        Ok(revision)
    }

    fn fetch_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError> {
        self.read(|state| state.runs.get(run_id).cloned())
    }

    fn active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        self.read(|state| state.active_runs())
    }

    fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, StoreError> {
        self.read(|state| state.audit_trail(run_id))
    }

    fn application_audit(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.read(|state| state.application_audit(application_id))
    }

    fn decisions_for(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        self.read(|state| state.decisions_for(application_id))
    }

    fn runs_for(&self, application_id: &ApplicationId) -> Result<Vec<WorkflowRun>, StoreError> {
        self.read(|state| state.runs_for(application_id))
    }
}
