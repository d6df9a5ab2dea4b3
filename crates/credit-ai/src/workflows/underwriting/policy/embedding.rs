use std::collections::BTreeMap;

/// Turns text into a dense vector. Implementations must be deterministic.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Term-frequency vectors hashed into fixed buckets; needs no external service.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// FNV-1a, stable across platforms and releases.
    fn bucket(term: &str, dimensions: usize) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in term.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % dimensions as u64) as usize
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.chars().count() >= 2)
            .map(|token| token.to_lowercase())
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut counts: BTreeMap<String, f32> = BTreeMap::new();
        let mut total = 0.0f32;
        for token in Self::tokenize(text) {
            *counts.entry(token).or_default() += 1.0;
            total += 1.0;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        if total == 0.0 {
            return vector;
        }
        for (term, count) in &counts {
            // Longer terms tend to carry more meaning than short function words.
            let weight = 1.0 + (term.chars().count() as f32).ln();
            vector[Self::bucket(term, self.dimensions)] += (count / total) * weight;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

/// Cosine similarity; zero for empty, mismatched, or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator < f64::EPSILON {
        0.0
    } else {
        (dot / denominator).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_unit_similarity() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Maximum loan-to-value ratio is 80 percent");
        let b = embedder.embed("Maximum loan-to-value ratio is 80 percent");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let vector = embedder.embed("  ");
        assert_eq!(vector.len(), 16);
        assert_eq!(cosine_similarity(&vector, &vector), 0.0);
    }

    #[test]
    fn related_text_scores_above_unrelated() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("borrower age limit");
        let related = embedder.embed("The borrower age must be at least 21 years; age limit 65");
        let unrelated = embedder.embed("Collateral appraisal by licensed valuers");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }
}
