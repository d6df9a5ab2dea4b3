//! Policy retrieval: chunked regulatory documents, similarity search, and compliance checks.

mod chunking;
mod embedding;
mod import;
mod store;

pub use chunking::{chunk_text, ChunkingConfig};
pub use embedding::{cosine_similarity, Embedder, HashingEmbedder};
pub use import::parse_policy_csv;
pub use store::{InMemoryVectorStore, VectorStore};

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::domain::ApplicationFacts;
use super::reasoning::{ReasoningAdapter, ReasoningError};
use super::rules::{RuleViolation, Severity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub title: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub regulation: Option<String>,
}

/// Source document handed to [`PolicyEngine::index`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub document_id: String,
    pub text: String,
    pub metadata: PolicyMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub section: Option<String>,
    pub page: Option<u32>,
    pub regulation: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_version: u32,
    pub sequence: u64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
    pub indexed_at: DateTime<Utc>,
}

impl PolicyChunk {
    pub fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.chunk_id.clone(),
            document_id: self.document_id.clone(),
            document_version: self.document_version,
            title: self.metadata.title.clone(),
            section: self.metadata.section.clone(),
            page: self.metadata.page,
            regulation: self.metadata.regulation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: PolicyChunk,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReceipt {
    pub document_id: String,
    pub document_version: u32,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub document_version: u32,
    pub title: String,
    pub section: Option<String>,
    pub page: Option<u32>,
    pub regulation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub citations: Vec<Citation>,
}

impl ComplianceViolation {
    pub fn as_rule_violation(&self) -> RuleViolation {
        let sources: Vec<String> = self
            .citations
            .iter()
            .map(|citation| match &citation.regulation {
                Some(regulation) => format!("{} ({regulation})", citation.title),
                None => citation.title.clone(),
            })
            .collect();
        let message = if sources.is_empty() {
            self.message.clone()
        } else {
            format!("{} [source: {}]", self.message, sources.join(", "))
        };
        RuleViolation {
            rule_id: self.rule_id.clone(),
            severity: self.severity,
            message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub violations: Vec<ComplianceViolation>,
    pub cited_sources: Vec<Citation>,
    pub checks_performed: usize,
}

impl ComplianceReport {
    pub fn compliant(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("chunk overlap {chunk_overlap} must be smaller than chunk size {chunk_size}")]
    InvalidChunking {
        chunk_size: usize,
        chunk_overlap: usize,
    },
    #[error("document {0} has no indexable text")]
    EmptyDocument(String),
    #[error("unknown policy document {0}")]
    UnknownDocument(String),
    #[error("chunk {0} already exists")]
    DuplicateChunk(String),
    #[error("policy import failed: {0}")]
    Import(String),
    #[error("vector store lock poisoned")]
    StorePoisoned,
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),
}

impl PolicyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PolicyError::Reasoning(err) if err.is_transient())
    }
}

/// Fixed compliance questions asked of the corpus for every application.
struct ComplianceQuestion {
    rule_id: &'static str,
    question: &'static str,
}

const COMPLIANCE_QUESTIONS: [ComplianceQuestion; 3] = [
    ComplianceQuestion {
        rule_id: "POLICY_AGE",
        question: "What is the permitted borrower age limit?",
    },
    ComplianceQuestion {
        rule_id: "POLICY_LTV",
        question: "What is the maximum loan-to-value ratio for secured loans?",
    },
    ComplianceQuestion {
        rule_id: "POLICY_DTI",
        question: "What is the maximum debt-to-income ratio?",
    },
];

const COMPLIANCE_PASSAGES: usize = 3;

pub struct PolicyEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    chunking: ChunkingConfig,
    // Serialises version and sequence assignment across concurrent index calls.
    index_lock: Mutex<()>,
}

impl PolicyEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            chunking,
            index_lock: Mutex::new(()),
        }
    }

    pub fn in_memory(chunking: ChunkingConfig) -> Self {
        Self::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            chunking,
        )
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    /// Index `document` as a new version; earlier versions stay until pruned.
    pub fn index(&self, document: &PolicyDocument) -> Result<IndexReceipt, PolicyError> {
        let windows = chunk_text(&document.text, self.chunking);
        if windows.is_empty() {
            return Err(PolicyError::EmptyDocument(document.document_id.clone()));
        }

        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| PolicyError::StorePoisoned)?;
        let version = self
            .store
            .latest_version(&document.document_id)?
            .map(|latest| latest + 1)
            .unwrap_or(1);
        let first_sequence = self.store.max_sequence()? + 1;
        let indexed_at = Utc::now();

        let chunks: Vec<PolicyChunk> = windows
            .into_iter()
            .enumerate()
            .map(|(offset, text)| PolicyChunk {
                chunk_id: format!("{}:v{}:{}", document.document_id, version, offset),
                document_id: document.document_id.clone(),
                document_version: version,
                sequence: first_sequence + offset as u64,
                embedding: self.embedder.embed(&text),
                text,
                metadata: ChunkMetadata {
                    title: document.metadata.title.clone(),
                    section: document.metadata.section.clone(),
                    page: document.metadata.page,
                    regulation: document.metadata.regulation.clone(),
                    chunk_size: self.chunking.chunk_size,
                    chunk_overlap: self.chunking.chunk_overlap,
                },
                indexed_at,
            })
            .collect();
        let chunk_count = chunks.len();
        self.store.insert(chunks)?;

        info!(
            document_id = %document.document_id,
            version,
            chunk_count,
            "indexed policy document"
        );
        Ok(IndexReceipt {
            document_id: document.document_id.clone(),
            document_version: version,
            chunk_count,
        })
    }

    /// Most similar chunks first; equal scores favour the most recently indexed chunk.
    pub fn query(&self, question: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, PolicyError> {
        let embedding = self.embedder.embed(question);
        self.store.search(&embedding, top_k)
    }

    /// Drop chunks from superseded versions of `document_id`.
    pub fn prune_stale(&self, document_id: &str) -> Result<usize, PolicyError> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| PolicyError::StorePoisoned)?;
        let latest = self
            .store
            .latest_version(document_id)?
            .ok_or_else(|| PolicyError::UnknownDocument(document_id.to_string()))?;
        let removed = self.store.remove_before(document_id, latest)?;
        info!(document_id, latest, removed, "pruned stale policy chunks");
        Ok(removed)
    }

    pub fn chunk_count(&self) -> Result<usize, PolicyError> {
        self.store.chunk_count()
    }

    /// Ask the canned compliance questions and let the reasoning adapter read the passages.
    ///
    /// Questions without any retrieved passage are skipped: no evidence, no violation.
    pub async fn check_compliance(
        &self,
        facts: &ApplicationFacts,
        reasoning: &ReasoningAdapter,
    ) -> Result<ComplianceReport, PolicyError> {
        let mut report = ComplianceReport::default();

        for check in &COMPLIANCE_QUESTIONS {
            let hits: Vec<RetrievedChunk> = self
                .query(check.question, COMPLIANCE_PASSAGES)?
                .into_iter()
                .filter(|hit| hit.similarity > 0.0)
                .collect();
            if hits.is_empty() {
                debug!(rule_id = check.rule_id, "no policy passages retrieved");
                continue;
            }

            let passages: Vec<String> = hits.iter().map(|hit| hit.chunk.text.clone()).collect();
            let citations: Vec<Citation> = hits.iter().map(|hit| hit.chunk.citation()).collect();
            let interpretation = reasoning
                .interpret_compliance(check.question, &passages, facts)
                .await?;
            report.checks_performed += 1;

            for citation in &citations {
                if !report.cited_sources.contains(citation) {
                    report.cited_sources.push(citation.clone());
                }
            }
            if !interpretation.compliant {
                report.violations.push(ComplianceViolation {
                    rule_id: check.rule_id.to_string(),
                    severity: interpretation.severity,
                    message: interpretation.finding,
                    citations,
                });
            }
        }

        Ok(report)
    }
}
