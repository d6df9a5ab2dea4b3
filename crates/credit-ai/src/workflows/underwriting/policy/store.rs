use std::collections::BTreeMap;
use std::sync::Mutex;

use super::embedding::cosine_similarity;
use super::{PolicyChunk, PolicyError, RetrievedChunk};

/// Vector database collaborator holding policy chunks.
pub trait VectorStore: Send + Sync {
    /// Insert chunks of a new document version; existing chunks are never overwritten.
    fn insert(&self, chunks: Vec<PolicyChunk>) -> Result<(), PolicyError>;
    fn latest_version(&self, document_id: &str) -> Result<Option<u32>, PolicyError>;
    /// Highest sequence number handed out so far.
    fn max_sequence(&self) -> Result<u64, PolicyError>;
    /// Similarity search over the latest version of every document.
    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>, PolicyError>;
    /// Remove chunks of `document_id` older than `keep_version`, returning how many were dropped.
    fn remove_before(&self, document_id: &str, keep_version: u32) -> Result<usize, PolicyError>;
    fn chunk_count(&self) -> Result<usize, PolicyError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    chunks: Mutex<Vec<PolicyChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<PolicyChunk>>, PolicyError> {
        self.chunks.lock().map_err(|_| PolicyError::StorePoisoned)
    }
}

impl VectorStore for InMemoryVectorStore {
    fn insert(&self, chunks: Vec<PolicyChunk>) -> Result<(), PolicyError> {
        let mut guard = self.guard()?;
        if let Some(duplicate) = chunks
            .iter()
            .find(|chunk| guard.iter().any(|existing| existing.chunk_id == chunk.chunk_id))
        {
            return Err(PolicyError::DuplicateChunk(duplicate.chunk_id.clone()));
        }
        guard.extend(chunks);
        Ok(())
    }

    fn latest_version(&self, document_id: &str) -> Result<Option<u32>, PolicyError> {
        let guard = self.guard()?;
        Ok(guard
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.document_version)
            .max())
    }

    fn max_sequence(&self) -> Result<u64, PolicyError> {
        let guard = self.guard()?;
        Ok(guard.iter().map(|chunk| chunk.sequence).max().unwrap_or(0))
    }

    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>, PolicyError> {
        let guard = self.guard()?;
        let mut latest: BTreeMap<&str, u32> = BTreeMap::new();
        for chunk in guard.iter() {
            let entry = latest.entry(chunk.document_id.as_str()).or_insert(0);
            *entry = (*entry).max(chunk.document_version);
        }

        let mut hits: Vec<RetrievedChunk> = guard
            .iter()
            .filter(|chunk| latest.get(chunk.document_id.as_str()) == Some(&chunk.document_version))
            .map(|chunk| RetrievedChunk {
                similarity: cosine_similarity(embedding, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.chunk.sequence.cmp(&a.chunk.sequence))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn remove_before(&self, document_id: &str, keep_version: u32) -> Result<usize, PolicyError> {
        let mut guard = self.guard()?;
        let before = guard.len();
        guard.retain(|chunk| {
            chunk.document_id != document_id || chunk.document_version >= keep_version
        });
        Ok(before - guard.len())
    }

    fn chunk_count(&self) -> Result<usize, PolicyError> {
        Ok(self.guard()?.len())
    }
}
