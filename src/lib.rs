//! docseek - multi-modal local file search.
//!
//! docseek indexes already-extracted [`FileRecord`]s into three backends (a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) full-text index, a
//! SQLite metadata table and an embedding vector index) and searches them
//! by filename, full text, fuzzy filename, metadata filter, bounded regex
//! or embedding similarity. Regex and similarity results go through a
//! shared two-tier cache.
//!
//! # Quick start
//!
//! ```no_run
//! use docseek::{AppContext, DataDir, FileRecord, SearchEngine, SearchMethod};
//!
//! # async fn run() -> docseek::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let engine = SearchEngine::open(AppContext::open(data_dir)?)?;
//!
//! let record = FileRecord::new("/notes/todo.md", "buy milk")
//!     .with_tags(["home"]);
//! let report = engine.index(record).await;
//! assert!(report.is_ok());
//!
//! let hits = engine
//!     .search(SearchMethod::FullText { query: "milk".into(), limit: None })
//!     .await;
//! for hit in &hits {
//!     println!("{} ({:.3})", hit.path, hit.score);
//! }
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cluster;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod fulltext_index;
pub mod fuzzy;
pub mod logging;
pub mod metadata_store;
pub mod record;
pub mod regex_search;
pub mod similarity;
pub mod vector_index;

pub use cache::CacheManager;
pub use config::SearchConfig;
pub use context::AppContext;
pub use coordinator::{
    BackendOutcome,
    IndexCoordinator,
    IndexReport,
    IndexStats,
    SearchEngine,
    SearchMethod,
};
pub use data_dir::DataDir;
pub use embedding::{Embedder, HashingEmbedder};
pub use error::{Error, ErrorKind, Result};
pub use fulltext_index::FullTextIndex;
pub use metadata_store::{MetadataFilter, MetadataStore};
pub use record::{FileRecord, SearchHit};
pub use regex_search::{RegexProvider, RegexRequest};
pub use similarity::{GroupRequest, SimilarityProvider};
pub use vector_index::VectorIndex;
