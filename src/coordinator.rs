//! The search engine facade.
//!
//! [`IndexCoordinator`] owns the three storage backends and the two
//! providers. Writes fan out to every backend concurrently and each backend
//! succeeds or fails on its own; there is no cross-store transaction, so a
//! partially failed [`index`](IndexCoordinator::index) leaves the stores
//! inconsistent until the record is indexed again. Reads dispatch on
//! [`SearchMethod`] and degrade to an empty result when a backend fails.

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    context::AppContext,
    error::Result,
    fulltext_index::FullTextIndex,
    metadata_store::{MetadataFilter, MetadataStore},
    record::{FileRecord, SearchHit},
    regex_search::{RegexProvider, RegexRequest},
    similarity::{GroupRequest, SimilarityProvider},
    vector_index::VectorIndex,
};

/// Cache key prefixes whose entries are derived from indexed content.
const DERIVED_CACHE_PREFIXES: [&str; 2] = ["regex:", "similarity:"];

/// A search request. Each variant carries its own parameters; `None`
/// falls back to the configured default.
#[derive(Debug, Clone)]
pub enum SearchMethod {
    /// Case-insensitive substring of the filename.
    Filename { query: String },
    FullText { query: String, limit: Option<usize> },
    Fuzzy { query: String, threshold: Option<f32> },
    Regex(RegexRequest),
    Metadata(MetadataFilter),
    Semantic {
        query: String,
        threshold: Option<f32>,
        max_results: Option<usize>,
    },
}

impl SearchMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SearchMethod::Filename { .. } => "filename",
            SearchMethod::FullText { .. } => "fulltext",
            SearchMethod::Fuzzy { .. } => "fuzzy",
            SearchMethod::Regex(_) => "regex",
            SearchMethod::Metadata(_) => "metadata",
            SearchMethod::Semantic { .. } => "semantic",
        }
    }

    /// Build a method from its name and a single query string.
    ///
    /// Names are case-insensitive. For `metadata` the query is a JSON
    /// [`MetadataFilter`]; anything that is not valid JSON is read as a
    /// comma-separated tag list. `case_sensitive` only affects `regex`.
    /// Returns `None` for an unknown name.
    ///
    /// ```
    /// use docseek::SearchMethod;
    ///
    /// let m = SearchMethod::from_name("FullText", "hello", false).unwrap();
    /// assert_eq!(m.name(), "fulltext");
    /// assert!(SearchMethod::from_name("telepathy", "hello", false).is_none());
    /// ```
    pub fn from_name(
        name: &str,
        query: &str,
        case_sensitive: bool,
    ) -> Option<Self> {
        let query = query.to_string();
        let method = match name.to_ascii_lowercase().as_str() {
            "filename" => SearchMethod::Filename { query },
            "fulltext" => SearchMethod::FullText { query, limit: None },
            "fuzzy" => SearchMethod::Fuzzy {
                query,
                threshold: None,
            },
            "regex" => SearchMethod::Regex(
                RegexRequest::new(query).case_sensitive(case_sensitive),
            ),
            "metadata" => SearchMethod::Metadata(
                serde_json::from_str(&query)
                    .unwrap_or_else(|_| tag_filter(&query)),
            ),
            "semantic" | "similarity" => SearchMethod::Semantic {
                query,
                threshold: None,
                max_results: None,
            },
            _ => return None,
        };
        Some(method)
    }
}

fn tag_filter(query: &str) -> MetadataFilter {
    MetadataFilter {
        tags: query
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        ..MetadataFilter::default()
    }
}

/// What happened to one backend during an index or remove call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum BackendOutcome {
    Written,
    /// Nothing to do, e.g. no text to embed or no row to remove.
    #[default]
    Skipped,
    Failed(String),
}

impl BackendOutcome {
    fn from_result(result: Result<bool>) -> Self {
        match result {
            Ok(true) => BackendOutcome::Written,
            Ok(false) => BackendOutcome::Skipped,
            Err(e) => BackendOutcome::Failed(e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BackendOutcome::Failed(_))
    }
}

/// Per-backend outcome of [`IndexCoordinator::index`] or
/// [`IndexCoordinator::remove`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub path: String,
    pub fulltext: BackendOutcome,
    pub metadata: BackendOutcome,
    pub vector: BackendOutcome,
}

impl IndexReport {
    fn outcomes(&self) -> [(&'static str, &BackendOutcome); 3] {
        [
            ("full-text index", &self.fulltext),
            ("metadata store", &self.metadata),
            ("vector index", &self.vector),
        ]
    }

    /// Whether no backend failed.
    pub fn is_ok(&self) -> bool {
        self.outcomes().iter().all(|(_, o)| !o.is_failed())
    }

    pub fn any_written(&self) -> bool {
        self.outcomes()
            .iter()
            .any(|(_, o)| **o == BackendOutcome::Written)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: u64,
    pub metadata_rows: u64,
    pub vectors: usize,
    pub cached_entries: usize,
}

pub struct IndexCoordinator {
    ctx: AppContext,
    fulltext: Arc<FullTextIndex>,
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorIndex>,
    regex: RegexProvider,
    similarity: SimilarityProvider,
}

/// The coordinator under the name library users usually look for.
pub type SearchEngine = IndexCoordinator;

/// Run a synchronous store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl IndexCoordinator {
    /// Open (or create) every backend under the context's data directory.
    ///
    /// A corrupted full-text index is recreated empty; the other stores
    /// fail to open with an error.
    pub fn open(ctx: AppContext) -> Result<Self> {
        let fulltext = FullTextIndex::open(
            &ctx.data_dir.tantivy_dir()?,
            ctx.config.fulltext.writer_memory_budget,
        )?;
        let metadata = MetadataStore::open(&ctx.data_dir.metadata_db())?;
        let vectors = VectorIndex::open(
            &ctx.data_dir.vectors_db(),
            ctx.embedder.dimension(),
        )?;
        info!(root = %ctx.data_dir.root().display(), "search engine opened");
        Ok(Self::from_parts(ctx, fulltext, metadata, vectors))
    }

    /// Keep every backend in memory. The cache still uses the context's
    /// data directory.
    pub fn in_memory(ctx: AppContext) -> Result<Self> {
        let fulltext = FullTextIndex::open_in_ram(
            ctx.config.fulltext.writer_memory_budget,
        )?;
        let metadata = MetadataStore::open_in_memory()?;
        let vectors = VectorIndex::in_memory(ctx.embedder.dimension());
        Ok(Self::from_parts(ctx, fulltext, metadata, vectors))
    }

    fn from_parts(
        ctx: AppContext,
        fulltext: FullTextIndex,
        metadata: MetadataStore,
        vectors: VectorIndex,
    ) -> Self {
        let vectors = Arc::new(vectors);
        let regex = RegexProvider::new(
            ctx.config.regex.clone(),
            Arc::clone(&ctx.cache),
        );
        let similarity = SimilarityProvider::new(
            ctx.config.similarity.clone(),
            Arc::clone(&ctx.embedder),
            Arc::clone(&vectors),
            Arc::clone(&ctx.cache),
        );
        Self {
            ctx,
            fulltext: Arc::new(fulltext),
            metadata: Arc::new(metadata),
            vectors,
            regex,
            similarity,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Write `record` into the full-text index, the metadata store and, when
    /// it has preview text, the vector index.
    ///
    /// The three writes run concurrently and do not depend on each other.
    /// A failing backend is logged and reported; the others still commit.
    /// A record without text drops any vector previously stored for its
    /// path.
    pub async fn index(&self, record: FileRecord) -> IndexReport {
        let record = Arc::new(record);

        let fulltext = {
            let index = Arc::clone(&self.fulltext);
            let record = Arc::clone(&record);
            blocking(move || {
                index
                    .upsert(&record.path, &record.content_preview)
                    .map(|()| true)
            })
        };
        let metadata = {
            let store = Arc::clone(&self.metadata);
            let record = Arc::clone(&record);
            blocking(move || store.upsert(&record).map(|()| true))
        };
        let vector = async {
            let vectors = Arc::clone(&self.vectors);
            let path = record.path.clone();
            if !record.has_text() {
                return blocking(move || vectors.remove(&path).map(|_| false))
                    .await;
            }
            let embedding = self
                .similarity
                .encode(record.content_preview.clone())
                .await?;
            blocking(move || vectors.upsert(&path, embedding).map(|_| true))
                .await
        };

        let (fulltext, metadata, vector) =
            tokio::join!(fulltext, metadata, vector);
        let report = IndexReport {
            path: record.path.clone(),
            fulltext: BackendOutcome::from_result(fulltext),
            metadata: BackendOutcome::from_result(metadata),
            vector: BackendOutcome::from_result(vector),
        };
        self.finish_write("index", &report);
        report
    }

    /// Delete `path` from every backend. Each backend is attempted even if
    /// another fails.
    pub async fn remove(&self, path: &str) -> IndexReport {
        let fulltext = {
            let index = Arc::clone(&self.fulltext);
            let path = path.to_string();
            blocking(move || index.delete(&path).map(|()| true))
        };
        let metadata = {
            let store = Arc::clone(&self.metadata);
            let path = path.to_string();
            blocking(move || store.remove(&path))
        };
        let vector = {
            let vectors = Arc::clone(&self.vectors);
            let path = path.to_string();
            blocking(move || vectors.remove(&path))
        };

        let (fulltext, metadata, vector) =
            tokio::join!(fulltext, metadata, vector);
        let report = IndexReport {
            path: path.to_string(),
            fulltext: BackendOutcome::from_result(fulltext),
            metadata: BackendOutcome::from_result(metadata),
            vector: BackendOutcome::from_result(vector),
        };
        self.finish_write("remove", &report);
        report
    }

    fn finish_write(&self, op: &str, report: &IndexReport) {
        for (store, outcome) in report.outcomes() {
            if let BackendOutcome::Failed(error) = outcome {
                warn!(
                    op,
                    path = %report.path,
                    store,
                    %error,
                    "backend write failed"
                );
            }
        }

        if report.any_written() {
            let cache = &self.ctx.cache;
            if let Err(e) = cache.invalidate_any(&DERIVED_CACHE_PREFIXES) {
                warn!(error = %e, "failed to invalidate cached results");
            }
        }
        debug!(op, path = %report.path, ok = report.is_ok(), "write finished");
    }

    /// Run `method`, logging any error and returning no hits instead.
    pub async fn search(&self, method: SearchMethod) -> Vec<SearchHit> {
        let name = method.name();
        match self.try_search(method).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(
                    method = name,
                    kind = ?e.kind(),
                    error = %e,
                    "search failed"
                );
                Vec::new()
            }
        }
    }

    /// Run `method` and return backend errors to the caller.
    pub async fn try_search(
        &self,
        method: SearchMethod,
    ) -> Result<Vec<SearchHit>> {
        let config = &self.ctx.config;
        match method {
            SearchMethod::Filename { query } => {
                let store = Arc::clone(&self.metadata);
                blocking(move || store.search_filename(&query)).await
            }
            SearchMethod::FullText { query, limit } => {
                let index = Arc::clone(&self.fulltext);
                let limit = limit.unwrap_or(config.fulltext.limit);
                blocking(move || index.search(&query, limit)).await
            }
            SearchMethod::Fuzzy { query, threshold } => {
                let store = Arc::clone(&self.metadata);
                let threshold = threshold.unwrap_or(config.fuzzy_threshold);
                blocking(move || store.fuzzy_search(&query, threshold)).await
            }
            SearchMethod::Regex(request) => Ok(self
                .try_regex_search(request)
                .await?
                .into_iter()
                .map(SearchHit::exact)
                .collect()),
            SearchMethod::Metadata(filter) => {
                let store = Arc::clone(&self.metadata);
                let records =
                    blocking(move || store.metadata_search(&filter)).await?;
                Ok(records
                    .into_iter()
                    .map(|r| SearchHit::exact(r.path))
                    .collect())
            }
            SearchMethod::Semantic {
                query,
                threshold,
                max_results,
            } => {
                self.similarity
                    .search(
                        &query,
                        threshold.unwrap_or(config.similarity.search_threshold),
                        max_results.unwrap_or(config.similarity.max_results),
                        None,
                    )
                    .await
            }
        }
    }

    /// String-keyed entry point for command-line front ends. Unknown method
    /// names log a warning and return no hits.
    pub async fn search_by_name(
        &self,
        query: &str,
        method: &str,
        case_sensitive: bool,
    ) -> Vec<SearchHit> {
        match SearchMethod::from_name(method, query, case_sensitive) {
            Some(method) => self.search(method).await,
            None => {
                warn!(method, "unknown search method");
                Vec::new()
            }
        }
    }

    /// Paths of indexed files matching a regex. Order is unspecified.
    pub async fn regex_search(&self, request: RegexRequest) -> Vec<String> {
        self.try_regex_search(request).await.unwrap_or_else(|e| {
            warn!(kind = ?e.kind(), error = %e, "regex search failed");
            Vec::new()
        })
    }

    /// Like [`regex_search`](Self::regex_search), returning errors.
    ///
    /// An empty `paths` list means every path in the metadata store.
    pub async fn try_regex_search(
        &self,
        mut request: RegexRequest,
    ) -> Result<Vec<String>> {
        if request.paths.is_empty() {
            let store = Arc::clone(&self.metadata);
            request.paths = blocking(move || store.list_paths()).await?;
            request.whole_corpus = true;
        }
        if request.cancel.is_none() {
            request.cancel = Some(self.ctx.child_token());
        }
        self.regex.search(&request).await
    }

    /// Semantic search limited to `restrict_to`.
    pub async fn semantic_search_within(
        &self,
        query: &str,
        restrict_to: &HashSet<String>,
    ) -> Vec<SearchHit> {
        let config = &self.ctx.config.similarity;
        self.similarity
            .search(
                query,
                config.search_threshold,
                config.max_results,
                Some(restrict_to),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "semantic search failed");
                Vec::new()
            })
    }

    /// Files similar to the one at `path`, best first.
    pub async fn find_similar_files(
        &self,
        path: &str,
        threshold: Option<f32>,
        max_results: Option<usize>,
    ) -> Vec<SearchHit> {
        self.try_find_similar_files(path, threshold, max_results)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    path,
                    kind = ?e.kind(),
                    error = %e,
                    "similar file lookup failed"
                );
                Vec::new()
            })
    }

    pub async fn try_find_similar_files(
        &self,
        path: &str,
        threshold: Option<f32>,
        max_results: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let config = &self.ctx.config.similarity;
        self.similarity
            .find_similar_files(
                path,
                threshold.unwrap_or(config.similar_files_threshold),
                max_results.unwrap_or(config.max_results),
            )
            .await
    }

    /// Groups of mutually similar files. Groups and members are sorted.
    pub async fn find_file_groups(
        &self,
        request: GroupRequest,
    ) -> Vec<Vec<String>> {
        self.try_find_file_groups(request).await.unwrap_or_else(|e| {
            warn!(kind = ?e.kind(), error = %e, "file grouping failed");
            Vec::new()
        })
    }

    pub async fn try_find_file_groups(
        &self,
        mut request: GroupRequest,
    ) -> Result<Vec<Vec<String>>> {
        if request.cancel.is_none() {
            request.cancel = Some(self.ctx.child_token());
        }
        self.similarity.find_file_groups(request).await
    }

    /// Counts from every backend. A backend that cannot be read reports 0.
    pub async fn stats(&self) -> IndexStats {
        let fulltext = Arc::clone(&self.fulltext);
        let metadata = Arc::clone(&self.metadata);
        let vectors = Arc::clone(&self.vectors);
        let cache = Arc::clone(&self.ctx.cache);

        let counted = blocking(move || {
            Ok(IndexStats {
                documents: or_zero("full-text index", fulltext.num_docs()),
                metadata_rows: or_zero("metadata store", metadata.count()),
                vectors: or_zero("vector index", vectors.len()),
                cached_entries: or_zero("cache", cache.memory_len()),
            })
        })
        .await;
        counted.unwrap_or_else(|e| {
            warn!(error = %e, "collecting stats failed");
            IndexStats::default()
        })
    }

    /// Cancel in-flight sweeps, wait for index merges and drop expired
    /// cache files.
    pub async fn shutdown(self) -> Result<()> {
        self.ctx.begin_shutdown();

        let fulltext = Arc::clone(&self.fulltext);
        blocking(move || fulltext.close()).await?;

        let cache = Arc::clone(&self.ctx.cache);
        let purged = blocking(move || cache.purge_expired()).await?;
        info!(purged, "search engine shut down");
        Ok(())
    }
}

impl std::fmt::Debug for IndexCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCoordinator")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

fn or_zero<T: Default>(store: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        warn!(store, error = %e, "count unavailable");
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataDir, config::SearchConfig};

    async fn engine() -> (tempfile::TempDir, IndexCoordinator) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let mut config = SearchConfig::default();
        config.fulltext.writer_memory_budget = 15_000_000;
        let ctx = AppContext::with_config(data_dir, config).unwrap();
        (tmp, IndexCoordinator::in_memory(ctx).unwrap())
    }

    fn text_file(dir: &std::path::Path, name: &str, text: &str) -> FileRecord {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        FileRecord::new(path.to_string_lossy(), text)
    }

    #[tokio::test]
    async fn index_writes_every_backend() {
        let (tmp, engine) = engine().await;
        let report = engine
            .index(text_file(tmp.path(), "a.txt", "hello world"))
            .await;

        assert!(report.is_ok());
        assert_eq!(report.fulltext, BackendOutcome::Written);
        assert_eq!(report.metadata, BackendOutcome::Written);
        assert_eq!(report.vector, BackendOutcome::Written);
    }

    #[tokio::test]
    async fn record_without_text_skips_vector() {
        let (tmp, engine) = engine().await;
        let report = engine.index(text_file(tmp.path(), "empty.bin", "")).await;
        assert_eq!(report.vector, BackendOutcome::Skipped);
        assert_eq!(report.metadata, BackendOutcome::Written);
        assert_eq!(engine.stats().await.vectors, 0);
    }

    #[tokio::test]
    async fn reindexing_does_not_duplicate() {
        let (tmp, engine) = engine().await;
        let record = text_file(tmp.path(), "a.txt", "hello world");
        engine.index(record.clone()).await;
        engine.index(record).await;

        let stats = engine.stats().await;
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.metadata_rows, 1);
        assert_eq!(stats.vectors, 1);
    }

    #[tokio::test]
    async fn remove_clears_every_backend() {
        let (tmp, engine) = engine().await;
        let record = text_file(tmp.path(), "a.txt", "hello world");
        let path = record.path.clone();
        engine.index(record).await;

        let report = engine.remove(&path).await;
        assert!(report.is_ok());
        let stats = engine.stats().await;
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.metadata_rows, 0);
        assert_eq!(stats.vectors, 0);

        let second = engine.remove(&path).await;
        assert_eq!(second.metadata, BackendOutcome::Skipped);
        assert_eq!(second.vector, BackendOutcome::Skipped);
    }

    #[tokio::test]
    async fn writes_invalidate_regex_results() {
        let (tmp, engine) = engine().await;
        engine.index(text_file(tmp.path(), "a.txt", "needle")).await;

        let first = engine.regex_search(RegexRequest::new("needle")).await;
        assert_eq!(first.len(), 1);

        engine.index(text_file(tmp.path(), "b.txt", "needle too")).await;
        let second = engine.regex_search(RegexRequest::new("needle")).await;
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn explicit_regex_paths_are_not_widened() {
        let (tmp, engine) = engine().await;
        let a = text_file(tmp.path(), "a.txt", "needle");
        let b = text_file(tmp.path(), "b.txt", "hay");
        let a_path = a.path.clone();
        let b_path = b.path.clone();
        engine.index(a).await;
        engine.index(b).await;

        let all = engine.regex_search(RegexRequest::new("needle")).await;
        assert_eq!(all, vec![a_path]);

        let only_b = engine
            .regex_search(RegexRequest::new("needle").paths([b_path]))
            .await;
        assert!(only_b.is_empty());
    }

    #[tokio::test]
    async fn invalid_regex_degrades_to_empty() {
        let (tmp, engine) = engine().await;
        engine.index(text_file(tmp.path(), "a.txt", "aaaa")).await;

        let hits = engine
            .search(SearchMethod::Regex(RegexRequest::new(
                "((((((((a+)+)+)+)+)+)+)+)+",
            )))
            .await;
        assert!(hits.is_empty());

        let err = engine
            .try_search(SearchMethod::Regex(RegexRequest::new("(")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidPattern);
    }

    #[tokio::test]
    async fn unknown_method_name_is_empty() {
        let (tmp, engine) = engine().await;
        engine.index(text_file(tmp.path(), "a.txt", "hello")).await;
        assert!(
            engine
                .search_by_name("hello", "telepathy", false)
                .await
                .is_empty()
        );
        assert_eq!(
            engine.search_by_name("hello", "fulltext", false).await.len(),
            1
        );
    }

    #[test]
    fn metadata_name_accepts_json_or_tags() {
        let json = r#"{"extensions": ["md"]}"#;
        let Some(SearchMethod::Metadata(filter)) =
            SearchMethod::from_name("metadata", json, false)
        else {
            panic!("expected metadata method");
        };
        assert_eq!(filter.extensions, vec!["md".to_string()]);

        let Some(SearchMethod::Metadata(filter)) =
            SearchMethod::from_name("metadata", "work, urgent", false)
        else {
            panic!("expected metadata method");
        };
        assert_eq!(
            filter.tags,
            vec!["work".to_string(), "urgent".to_string()]
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_child_tokens() {
        let (_tmp, engine) = engine().await;
        let token = engine.context().child_token();
        engine.shutdown().await.unwrap();
        assert!(token.is_cancelled());
    }
}
