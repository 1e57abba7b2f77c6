use std::{collections::BTreeSet, path::Path};

use serde::{Deserialize, Serialize};

/// Upper bound on the preview text carried by a record, in characters.
pub const MAX_PREVIEW_CHARS: usize = 4096;

/// An already-extracted description of one file in the corpus.
///
/// `path` is the unique key: indexing a record whose path is already known
/// replaces the previous rows in every backend.
///
/// # Examples
///
/// ```
/// use docseek::FileRecord;
///
/// let record =
///     FileRecord::new("/notes/Todo.MD", "buy milk").with_tags(["home"]);
/// assert_eq!(record.filename, "Todo.MD");
/// assert_eq!(record.extension, "md");
/// assert_eq!(record.joined_tags(), "home");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub filename: String,
    /// Lower-case extension without the leading dot; empty when absent.
    pub extension: String,
    pub size: u64,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
    pub tags: BTreeSet<String>,
    pub content_preview: String,
    pub mime_type: Option<String>,
}

impl FileRecord {
    /// Build a record for `path`, deriving filename and extension from it.
    ///
    /// The preview is truncated to [`MAX_PREVIEW_CHARS`]; `size` starts as the
    /// byte length of the untruncated preview.
    pub fn new(
        path: impl Into<String>,
        content_preview: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let content_preview = content_preview.into();
        let p = Path::new(&path);
        let filename = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let extension = p
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Self {
            size: content_preview.len() as u64,
            content_preview: truncate_chars(content_preview, MAX_PREVIEW_CHARS),
            path,
            filename,
            extension,
            created_at: 0,
            updated_at: 0,
            tags: BTreeSet::new(),
            mime_type: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_timestamps(mut self, created_at: i64, updated_at: i64) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags
            .into_iter()
            .map(Into::into)
            .map(|t: String| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Whether the record carries text worth embedding.
    pub fn has_text(&self) -> bool {
        !self.content_preview.trim().is_empty()
    }

    /// Tags joined with commas in sorted order, as stored in the metadata
    /// table.
    pub fn joined_tags(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Inverse of [`joined_tags`](Self::joined_tags).
    pub fn split_tags(joined: &str) -> BTreeSet<String> {
        joined
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One `(path, score)` result. Score semantics depend on the search method:
/// engine relevance for full-text, similarity ratio for fuzzy and embedding
/// searches, and `1.0` for exact-match methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub score: f32,
}

impl SearchHit {
    pub fn new(path: impl Into<String>, score: f32) -> Self {
        Self {
            path: path.into(),
            score,
        }
    }

    /// A hit from a method with no graded relevance.
    pub fn exact(path: impl Into<String>) -> Self {
        Self::new(path, 1.0)
    }
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
    }
    text
}
