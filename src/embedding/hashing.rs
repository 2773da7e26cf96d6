//! Offline feature-hashing embedder.
//!
//! Tokens are lowercased alphanumeric runs; CJK ideographs and kana are
//! emitted one token per character since those scripts do not separate
//! words with spaces. Each token is hashed into one of `dims` buckets with a
//! hash-derived sign, and the result is L2-normalised. Identical text always
//! yields identical vectors, which makes this provider the default for
//! air-gapped installs and for tests.

use async_trait::async_trait;

use super::EmbeddingProvider;
use crate::error::KbResult;

pub const DEFAULT_HASH_DIMS: usize = 256;

pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            model: format!("hash-{}", dims),
            dims,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF   // hiragana, katakana
        | 0x3400..=0x4DBF // CJK extension A
        | 0x4E00..=0x9FFF // CJK unified
        | 0xAC00..=0xD7AF // hangul syllables
        | 0xF900..=0xFAFF)
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in text.chars().flat_map(char::to_lowercase) {
        if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            word.push(c);
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_tokenize_mixed_scripts() {
        assert_eq!(
            tokenize("Capital of FRANCE: 巴黎!"),
            vec!["capital", "of", "france", "巴", "黎"]
        );
    }

    #[test]
    fn test_deterministic_and_normalised() {
        let p = HashingProvider::new(64);
        let a = p.embed_one("The capital of France is Paris.");
        let b = p.embed_one("The capital of France is Paris.");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let p = HashingProvider::default();
        let doc = p.embed_one("The capital of France is Paris.");
        let related = p.embed_one("What is the capital of France?");
        let unrelated = p.embed_one("Photosynthesis converts sunlight into sugar.");
        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let p = HashingProvider::new(8);
        assert!(p.embed_one("  ...  ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_model_name_includes_dims() {
        assert_eq!(HashingProvider::new(128).model_name(), "hash-128");
    }
}
