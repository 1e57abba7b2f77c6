//! Tunables for every search provider.
//!
//! All fields have defaults, so a partial `config.json` in the data
//! directory only needs to name the values it overrides.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub cache: CacheConfig,
    pub fulltext: FullTextConfig,
    pub regex: RegexConfig,
    pub similarity: SimilarityConfig,
    /// Minimum filename ratio for fuzzy matches, `0.0..=1.0`.
    pub fuzzy_threshold: f32,
    /// Dimension of the built-in hashing embedder.
    pub embedding_dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries kept in the memory tier.
    pub max_items: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullTextConfig {
    /// Default result cap for full-text queries.
    pub limit: usize,
    /// Memory budget handed to the tantivy writer, in bytes.
    pub writer_memory_budget: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexConfig {
    pub max_complexity: usize,
    pub chunk_timeout_ms: u64,
    pub chunk_bytes: usize,
    /// Number of files scanned concurrently per batch.
    pub batch_size: usize,
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub search_threshold: f32,
    pub similar_files_threshold: f32,
    pub group_threshold: f32,
    pub max_results: usize,
    pub min_group_size: usize,
    pub encode_batch_size: usize,
    pub encode_concurrency: usize,
    /// Upper bound on bytes read from a single file before encoding.
    pub max_read_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            fulltext: FullTextConfig::default(),
            regex: RegexConfig::default(),
            similarity: SimilarityConfig::default(),
            fuzzy_threshold: 0.6,
            embedding_dimension: 384,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            ttl_secs: 3600,
        }
    }
}

impl Default for FullTextConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            writer_memory_budget: 50_000_000,
        }
    }
}

impl Default for RegexConfig {
    fn default() -> Self {
        Self {
            max_complexity: 300,
            chunk_timeout_ms: 500,
            chunk_bytes: 64 * 1024,
            batch_size: 10,
            max_results: 100,
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            search_threshold: 0.5,
            similar_files_threshold: 0.7,
            group_threshold: 0.8,
            max_results: 10,
            min_group_size: 2,
            encode_batch_size: 100,
            encode_concurrency: 10,
            max_read_bytes: 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl RegexConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

impl SearchConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    path = %path.display(),
                    "no config file, using defaults"
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a provider unable to do any work.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.cache.max_items == 0, "cache.max_items must be positive"),
            (self.fulltext.limit == 0, "fulltext.limit must be positive"),
            (self.regex.batch_size == 0, "regex.batch_size must be positive"),
            (self.regex.chunk_bytes == 0, "regex.chunk_bytes must be positive"),
            (
                self.similarity.encode_batch_size == 0,
                "similarity.encode_batch_size must be positive",
            ),
            (
                self.similarity.encode_concurrency == 0,
                "similarity.encode_concurrency must be positive",
            ),
            (
                !(0.0..=1.0).contains(&self.fuzzy_threshold),
                "fuzzy_threshold must be within 0.0..=1.0",
            ),
            (
                self.embedding_dimension == 0,
                "embedding_dimension must be positive",
            ),
        ];

        for (failed, message) in checks {
            if failed {
                return Err(Error::Config(message.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config =
            SearchConfig::load(&tmp.path().join("config.json")).unwrap();
        assert_eq!(config, SearchConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"regex": {"chunk_timeout_ms": 250},
                "cache": {"max_items": 5}}"#,
        )
        .unwrap();

        let config = SearchConfig::load(&path).unwrap();
        assert_eq!(config.regex.chunk_timeout(), Duration::from_millis(250));
        assert_eq!(config.regex.batch_size, 10);
        assert_eq!(config.cache.max_items, 5);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.fulltext.limit, 20);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = SearchConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = SearchConfig::default();
        config.regex.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
