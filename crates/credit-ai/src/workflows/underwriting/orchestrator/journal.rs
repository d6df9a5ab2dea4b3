use std::sync::Arc;

use tokio::sync::Mutex;

use super::super::fusion::DecisionRecord;
use super::super::run::{RunStatus, WorkflowRun};
use super::super::store::{AuditEntry, RunStore, StoreCommit, StoreError};
use super::OrchestratorError;

/// Side effects committed together with a run mutation.
#[derive(Debug, Default)]
pub(crate) struct Mutation {
    pub(crate) audit: Vec<AuditEntry>,
    pub(crate) decision: Option<DecisionRecord>,
}

impl Mutation {
    pub(crate) fn audit(entry: AuditEntry) -> Self {
        Self {
            audit: vec![entry],
            decision: None,
        }
    }

    pub(crate) fn quiet() -> Self {
        Self::default()
    }
}

/// In-memory copy of one run whose every change is committed to the store before it is visible.
pub(crate) struct Journal {
    run: Mutex<WorkflowRun>,
    store: Arc<dyn RunStore>,
}

impl Journal {
    pub(crate) fn new(run: WorkflowRun, store: Arc<dyn RunStore>) -> Self {
        Self {
            run: Mutex::new(run),
            store,
        }
    }

    pub(crate) async fn snapshot(&self) -> WorkflowRun {
        self.run.lock().await.clone()
    }

    /// Apply `change` to a copy, commit it, and only then replace the held run.
    ///
    /// Cancelled runs accept no further changes.
    pub(crate) async fn commit<F>(&self, change: F) -> Result<WorkflowRun, OrchestratorError>
    where
        F: FnOnce(&mut WorkflowRun) -> Result<Mutation, OrchestratorError>,
    {
        let mut held = self.run.lock().await;
        if held.status == RunStatus::Cancelled {
            return Err(StoreError::RunCancelled(held.run_id.clone()).into());
        }

        let mut next = held.clone();
        let mutation = change(&mut next)?;
        let commit = StoreCommit {
            run: Some(next.clone()),
            audit: mutation.audit,
            decision: mutation.decision,
        };
        if let Some(revision) = self.store.apply(commit)? {
            next.revision = revision;
        }
        *held = next.clone();
        Ok(next)
    }
}
