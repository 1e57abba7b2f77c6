use std::{path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("full-text index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("vector store error: {0}")]
    Redb(#[from] redb::Error),

    #[error("vector store open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("vector store storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("vector store transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("vector store table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("vector store commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("index at {path} is corrupted: {reason}")]
    IndexCorruption { path: PathBuf, reason: String },

    #[error("{store} unavailable: {reason}")]
    StoreUnavailable { store: &'static str, reason: String },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// Coarse classification of an [`Error`], used by callers that only need to
/// decide how to degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidPattern,
    IndexCorruption,
    StoreUnavailable,
    Timeout,
    Cancelled,
    Config,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Error::IndexCorruption { .. } => ErrorKind::IndexCorruption,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) | Error::DataDir(_) => ErrorKind::Config,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            Error::Io(_) => ErrorKind::Io,
            Error::Tantivy(_)
            | Error::Sqlite(_)
            | Error::Redb(_)
            | Error::RedbDatabase(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_)
            | Error::Json(_)
            | Error::Join(_)
            | Error::Embedding(_)
            | Error::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
        }
    }

    pub(crate) fn invalid_pattern(
        pattern: &str,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn poisoned(store: &'static str) -> Self {
        Error::StoreUnavailable {
            store,
            reason: "lock poisoned".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let err = Error::from(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn backend_errors_are_store_unavailable() {
        let err = Error::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn invalid_pattern_message_names_pattern() {
        let err = Error::invalid_pattern("(a+)+", "too complex");
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
        assert!(err.to_string().contains("(a+)+"));
    }
}
