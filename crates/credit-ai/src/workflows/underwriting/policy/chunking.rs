use serde::{Deserialize, Serialize};

use super::PolicyError;

/// Character window settings, fixed per indexed document version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, PolicyError> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(PolicyError::InvalidChunking {
                chunk_size,
                chunk_overlap,
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
        }
    }
}

/// Split `text` into overlapping windows of `chunk_size` characters.
///
/// Windows advance by `chunk_size - chunk_overlap`; the final window ends at the text end.
/// Whitespace-only windows are dropped.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let stride = config.chunk_size.saturating_sub(config.chunk_overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        if !window.trim().is_empty() {
            chunks.push(window);
        }
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}
