use facesort_core::{ClusterError, ClusterId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),
    #[error("label name must not be empty")]
    InvalidLabel,
    #[error("database {} is unusable: {reason} (rebuild it to start over)", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("database {field} mismatch: stored '{stored}', current '{current}' (rebuild the database to switch)")]
    ModelMismatch {
        field: &'static str,
        stored: String,
        current: String,
    },
    #[error("cluster state changed under this writer (expected generation {expected}, found {found}); rerun the scan")]
    Conflict { expected: u64, found: u64 },
    #[error("no database at {}", .0.display())]
    Missing(PathBuf),
    #[error("cluster state: {0}")]
    Cluster(#[from] ClusterError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// SQLite failures that mean the file itself is damaged or not a database.
    pub(crate) fn is_corruption(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase)
        )
    }
}
