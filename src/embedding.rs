//! Text embedding models.
//!
//! Similarity search only needs a deterministic `text -> vector` function.
//! [`HashingEmbedder`] is always available and needs no model files;
//! enabling the `fastembed` feature adds [`FastEmbedder`], which runs a
//! sentence-transformer through ONNX.

use crate::error::{Error, Result};

/// A deterministic text encoder producing fixed-length vectors.
///
/// Identical input must always produce an identical vector, because cached
/// similarity results are keyed on the input text rather than the vector.
pub trait Embedder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector returned by [`encode`](Self::encode).
    fn dimension(&self) -> usize;

    /// Encode several texts. The default calls [`encode`](Self::encode) for
    /// each one; models with native batching override it.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }
}

/// Bag-of-words embedder using the hashing trick.
///
/// Each lower-cased alphanumeric token is hashed with BLAKE3 into one of
/// `dimension` buckets and the resulting count vector is L2-normalized.
/// Texts that share words get a positive cosine similarity; texts with no
/// words in common score near zero.
///
/// # Examples
///
/// ```
/// use docseek::embedding::{Embedder, HashingEmbedder};
///
/// let embedder = HashingEmbedder::new(384);
/// let v = embedder.encode("hello world").unwrap();
/// assert_eq!(v.len(), 384);
/// assert_eq!(v, embedder.encode("Hello, WORLD!").unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let hash = blake3::hash(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.dimension as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for HashingEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(&token.to_lowercase())] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Scale `vector` to unit length in place. A zero vector is left unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Check that `vector` has the length an index was opened with.
pub(crate) fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(Error::Embedding(format!(
            "expected a {expected}-dimensional vector, got {}",
            vector.len()
        )))
    }
}

#[cfg(feature = "fastembed")]
pub use self::fast::FastEmbedder;

#[cfg(feature = "fastembed")]
mod fast {
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tracing::info;

    use super::Embedder;
    use crate::error::{Error, Result};

    /// all-MiniLM-L6-v2 through fastembed. Model files are downloaded on
    /// first use into fastembed's cache directory.
    pub struct FastEmbedder {
        model: TextEmbedding,
    }

    impl FastEmbedder {
        pub const DIMENSION: usize = 384;

        pub fn new() -> Result<Self> {
            info!("loading all-MiniLM-L6-v2 embedding model");
            let model = TextEmbedding::try_new(InitOptions::new(
                EmbeddingModel::AllMiniLML6V2,
            ))
            .map_err(|e| Error::Embedding(e.to_string()))?;
            Ok(Self { model })
        }
    }

    impl Embedder for FastEmbedder {
        fn encode(&self, text: &str) -> Result<Vec<f32>> {
            self.encode_batch(&[text])?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::Embedding("no embedding generated".into())
                })
        }

        fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            self.model
                .embed(texts.to_vec(), None)
                .map_err(|e| Error::Embedding(e.to_string()))
        }

        fn dimension(&self) -> usize {
            Self::DIMENSION
        }
    }
}
