use std::{path::Path, sync::Mutex};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    collector::TopDocs,
    directory::MmapDirectory,
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    record::SearchHit,
};

/// Field names used in the schema.
pub mod fields {
    pub const PATH: &str = "path";
    pub const CONTENT: &str = "content";
}

const TOKENIZER: &str = "en_stem";

/// Inverted index over file content, keyed by path.
///
/// Writes go through a single `IndexWriter` guarded by a mutex, so
/// concurrent `upsert` calls are serialized and each one commits before the
/// next starts.
pub struct FullTextIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    path: Field,
    content: Field,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::PATH, STRING | STORED);

    let content_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    builder.add_text_field(fields::CONTENT, content_opts);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(TOKENIZER, en_stem);
}

fn has_expected_fields(index: &Index) -> bool {
    let schema = index.schema();
    schema.get_field(fields::PATH).is_ok()
        && schema.get_field(fields::CONTENT).is_ok()
}

fn mmap_dir(dir: &Path) -> Result<MmapDirectory> {
    MmapDirectory::open(dir).map_err(|e| {
        Error::Tantivy(tantivy::TantivyError::SystemError(e.to_string()))
    })
}

impl FullTextIndex {
    /// Open the index stored in `dir`, creating it if absent.
    ///
    /// An index that exists but cannot be opened, whose schema does not
    /// match, or whose segments cannot be loaded is deleted and recreated
    /// empty. Its previous content is lost and has to be rebuilt by
    /// re-indexing. A writer lock held by another process is returned as an
    /// error and leaves the directory untouched.
    pub fn open(dir: &Path, memory_budget: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = build_schema();

        let directory = mmap_dir(dir)?;
        let exists = Index::exists(&directory)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;

        if !exists {
            let index = Index::create(
                directory,
                schema,
                tantivy::IndexSettings::default(),
            )?;
            return Self::from_index(index, memory_budget);
        }

        match Self::open_existing(directory, memory_budget) {
            Ok(index) => Ok(index),
            Err(e @ Error::Tantivy(tantivy::TantivyError::LockFailure(..))) => {
                Err(e)
            }
            Err(e) => {
                let index = Self::recreate(dir, schema, &e.to_string())?;
                Self::from_index(index, memory_budget)
            }
        }
    }

    fn open_existing(
        directory: MmapDirectory,
        memory_budget: usize,
    ) -> Result<Self> {
        let index = Index::open(directory)?;
        if !has_expected_fields(&index) {
            return Err(Error::Tantivy(tantivy::TantivyError::SchemaError(
                "schema mismatch".to_string(),
            )));
        }
        Self::from_index(index, memory_budget)
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram(memory_budget: usize) -> Result<Self> {
        let index = Index::create_in_ram(build_schema());
        Self::from_index(index, memory_budget)
    }

    fn recreate(dir: &Path, schema: Schema, reason: &str) -> Result<Index> {
        let corruption = Error::IndexCorruption {
            path: dir.to_path_buf(),
            reason: reason.to_string(),
        };
        warn!("{corruption}; recreating empty index");

        std::fs::remove_dir_all(dir)?;
        std::fs::create_dir_all(dir)?;
        Ok(Index::create(
            mmap_dir(dir)?,
            schema,
            tantivy::IndexSettings::default(),
        )?)
    }

    fn from_index(index: Index, memory_budget: usize) -> Result<Self> {
        register_tokenizers(&index);
        let schema = index.schema();
        let path = schema.get_field(fields::PATH)?;
        let content = schema.get_field(fields::CONTENT)?;
        let reader = index.reader()?;
        let writer = index.writer_with_num_threads(1, memory_budget)?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(Some(writer)),
            path,
            content,
        })
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| Error::poisoned("full-text index"))?;
        let writer = guard.as_mut().ok_or(Error::StoreUnavailable {
            store: "full-text index",
            reason: "writer already closed".to_string(),
        })?;
        f(writer)
    }

    /// Replace the document stored for `path` and commit immediately.
    ///
    /// Commits are not followed by a merge wait; segments accumulate and are
    /// merged by tantivy's background policy.
    pub fn upsert(&self, path: &str, content: &str) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.path, path));
            writer.add_document(doc!(
                self.path => path,
                self.content => content,
            ))?;
            writer.commit()?;
            Ok(())
        })?;
        debug!(path, "full-text document committed");
        Ok(())
    }

    /// Remove the document stored for `path`, if any.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.path, path));
            writer.commit()?;
            Ok(())
        })
    }

    /// Search document content, best matches first.
    pub fn search(
        &self,
        query_str: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if query_str.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![self.content]);
        let (query, errors) = parser.parse_query_lenient(query_str);
        if !errors.is_empty() {
            debug!(
                query = query_str,
                ?errors,
                "lenient query parse dropped terms"
            );
        }

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(SearchHit::new(extract_text(&doc, self.path), score));
        }

        Ok(results)
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// Stop accepting writes and wait for pending merges to finish.
    pub fn close(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| Error::poisoned("full-text index"))?
            .take();
        if let Some(writer) = writer {
            writer.wait_merging_threads()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FullTextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullTextIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 15_000_000;

    fn paths(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.path.as_str()).collect()
    }

    #[test]
    fn create_and_search() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.upsert("/a/hello.md", "This is a test document about hello world")
            .unwrap();
        idx.upsert("/a/rust.md", "Rust is a systems programming language")
            .unwrap();

        let results = idx.search("hello world", 10).unwrap();
        assert_eq!(paths(&results), vec!["/a/hello.md"]);
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn upsert_replaces_previous_content() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.upsert("/a.md", "old content").unwrap();
        idx.upsert("/a.md", "new content").unwrap();

        assert_eq!(idx.num_docs().unwrap(), 1);
        assert!(idx.search("old", 10).unwrap().is_empty());
        assert_eq!(paths(&idx.search("content", 10).unwrap()), vec!["/a.md"]);
    }

    #[test]
    fn delete_removes_document() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.upsert("/a.md", "hello world").unwrap();
        assert_eq!(idx.search("hello", 10).unwrap().len(), 1);

        idx.delete("/a.md").unwrap();
        assert!(idx.search("hello", 10).unwrap().is_empty());
        assert_eq!(idx.num_docs().unwrap(), 0);
    }

    #[test]
    fn stemming_works() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.upsert("/run.md", "the runners were running quickly")
            .unwrap();

        // "run" should match "running" and "runners" via stemming.
        assert!(!idx.search("run", 10).unwrap().is_empty());
    }

    #[test]
    fn limit_caps_results() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        for i in 0..5 {
            idx.upsert(&format!("/doc{i}.txt"), "shared term").unwrap();
        }
        assert_eq!(idx.search("shared", 3).unwrap().len(), 3);
        assert!(idx.search("shared", 0).unwrap().is_empty());
    }

    #[test]
    fn malformed_query_does_not_fail() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.upsert("/a.md", "hello world").unwrap();
        assert!(idx.search("hello AND (", 10).is_ok());
        assert!(idx.search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");

        {
            let idx = FullTextIndex::open(&dir, BUDGET).unwrap();
            idx.upsert("/persist.md", "persistent data").unwrap();
            idx.close().unwrap();
        }

        {
            let idx = FullTextIndex::open(&dir, BUDGET).unwrap();
            let results = idx.search("persistent", 10).unwrap();
            assert_eq!(paths(&results), vec!["/persist.md"]);
        }
    }

    #[test]
    fn corrupted_index_is_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("meta.json"), b"{ definitely not meta")
            .unwrap();

        let idx = FullTextIndex::open(&dir, BUDGET).unwrap();
        assert_eq!(idx.num_docs().unwrap(), 0);

        idx.upsert("/fresh.md", "fresh start").unwrap();
        assert_eq!(idx.search("fresh", 10).unwrap().len(), 1);
    }

    #[test]
    fn missing_segment_files_are_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");
        {
            let idx = FullTextIndex::open(&dir, BUDGET).unwrap();
            idx.upsert("/lost.md", "soon gone").unwrap();
            idx.close().unwrap();
        }

        // Keep meta.json and the hidden bookkeeping files; drop the segments.
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name != "meta.json" && !name.starts_with('.') {
                std::fs::remove_file(&path).unwrap();
            }
        }

        let idx = FullTextIndex::open(&dir, BUDGET).unwrap();
        assert_eq!(idx.num_docs().unwrap(), 0);
        idx.upsert("/fresh.md", "fresh start").unwrap();
        assert_eq!(paths(&idx.search("fresh", 10).unwrap()), vec!["/fresh.md"]);
    }

    #[test]
    fn writes_after_close_fail() {
        let idx = FullTextIndex::open_in_ram(BUDGET).unwrap();
        idx.close().unwrap();
        let err = idx.upsert("/a.md", "text").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreUnavailable);
    }
}
