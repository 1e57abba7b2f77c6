use std::{
    collections::BTreeSet,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    fuzzy,
    record::{FileRecord, SearchHit},
};

/// Optional predicates for [`MetadataStore::metadata_search`].
///
/// Set fields are AND-ed together. Within `extensions` and `tags` the
/// values are OR-ed. A default filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataFilter {
    /// Extensions without the leading dot; compared case-insensitively.
    pub extensions: Vec<String>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    /// Unix seconds, inclusive.
    pub updated_after: Option<i64>,
    /// Unix seconds, inclusive.
    pub updated_before: Option<i64>,
    /// Substring matches against the comma-joined tag column.
    pub tags: Vec<String>,
}

/// Relational store of per-file metadata, one row per path.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "path, filename, extension, size, created_at, \
                              updated_at, tags, mime_type";

fn size_to_sql(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Escape `%`, `_` and the escape character itself for a `LIKE … ESCAPE '\'`
/// pattern.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn contains_pattern(s: &str) -> String {
    format!("%{}%", escape_like(s))
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                path TEXT NOT NULL UNIQUE,
                filename TEXT NOT NULL,
                extension TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                tags TEXT NOT NULL,
                mime_type TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_files_extension ON files(extension);
            CREATE INDEX IF NOT EXISTS idx_files_updated ON files(updated_at);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::poisoned("metadata store"))
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
        let size: i64 = row.get(3)?;
        let tags: String = row.get(6)?;
        Ok(FileRecord {
            path: row.get(0)?,
            filename: row.get(1)?,
            extension: row.get(2)?,
            size: u64::try_from(size).unwrap_or(0),
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            tags: FileRecord::split_tags(&tags),
            content_preview: String::new(),
            mime_type: row.get(7)?,
        })
    }

    /// Insert the row for `record.path`, replacing any previous one.
    pub fn upsert(&self, record: &FileRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO files (path, filename, extension, size, created_at,
                                updated_at, tags, mime_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(path) DO UPDATE SET
                 filename=excluded.filename,
                 extension=excluded.extension,
                 size=excluded.size,
                 created_at=excluded.created_at,
                 updated_at=excluded.updated_at,
                 tags=excluded.tags,
                 mime_type=excluded.mime_type",
            params![
                record.path,
                record.filename,
                normalize_extension(&record.extension),
                size_to_sql(record.size),
                record.created_at,
                record.updated_at,
                record.joined_tags(),
                record.mime_type,
            ],
        )?;
        debug!(path = %record.path, "metadata row upserted");
        Ok(())
    }

    /// Fetch the stored row for `path`. The preview is not stored here and
    /// comes back empty.
    pub fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM files WHERE path = ?1");
        Ok(conn
            .query_row(&sql, params![path], Self::row_to_record)
            .optional()?)
    }

    pub fn remove(&self, path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed =
            conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn list_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Case-insensitive substring match on the filename.
    ///
    /// SQLite's `LIKE` folds ASCII case only.
    pub fn search_filename(&self, substring: &str) -> Result<Vec<SearchHit>> {
        if substring.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path FROM files WHERE filename LIKE ?1 ESCAPE '\\' \
             ORDER BY path",
        )?;
        let rows = stmt.query_map(params![contains_pattern(substring)], |r| {
            r.get::<_, String>(0)
        })?;

        let mut hits = Vec::new();
        for path in rows {
            hits.push(SearchHit::exact(path?));
        }
        Ok(hits)
    }

    /// Score every filename against `query` and keep those at or above
    /// `threshold` (0.0 to 1.0), best first.
    ///
    /// This is a full table scan per call.
    pub fn fuzzy_search(
        &self,
        query: &str,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT filename, path FROM files")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut hits: Vec<SearchHit> = pairs
            .into_iter()
            .filter_map(|(filename, path)| {
                let score = fuzzy::best_ratio(query, &filename);
                (score >= threshold).then(|| SearchHit::new(path, score))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(hits)
    }

    /// Rows matching every set predicate of `filter`, most recently updated
    /// first.
    pub fn metadata_search(
        &self,
        filter: &MetadataFilter,
    ) -> Result<Vec<FileRecord>> {
        let mut where_parts: Vec<String> = Vec::new();
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        let extensions: BTreeSet<String> = filter
            .extensions
            .iter()
            .map(|e| normalize_extension(e))
            .filter(|e| !e.is_empty())
            .collect();
        if !extensions.is_empty() {
            let placeholders: Vec<_> =
                extensions.iter().map(|_| "?").collect();
            where_parts
                .push(format!("extension IN ({})", placeholders.join(",")));
            for ext in extensions {
                params_vec.push(Box::new(ext));
            }
        }

        if let Some(min) = filter.size_min {
            where_parts.push("size >= ?".to_string());
            params_vec.push(Box::new(size_to_sql(min)));
        }
        if let Some(max) = filter.size_max {
            where_parts.push("size <= ?".to_string());
            params_vec.push(Box::new(size_to_sql(max)));
        }
        if let Some(after) = filter.updated_after {
            where_parts.push("updated_at >= ?".to_string());
            params_vec.push(Box::new(after));
        }
        if let Some(before) = filter.updated_before {
            where_parts.push("updated_at <= ?".to_string());
            params_vec.push(Box::new(before));
        }

        let tags: Vec<&str> = filter
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            let ors: Vec<_> =
                tags.iter().map(|_| "tags LIKE ? ESCAPE '\\'").collect();
            where_parts.push(format!("({})", ors.join(" OR ")));
            for tag in tags {
                params_vec.push(Box::new(contains_pattern(tag)));
            }
        }

        let where_clause = if where_parts.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_parts.join(" AND "))
        };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM files {where_clause} \
             ORDER BY updated_at DESC, path"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let rows =
            stmt.query_map(params_refs.as_slice(), Self::row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}
