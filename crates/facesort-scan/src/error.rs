use facesort_store::StoreError;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read folder {}: {source}", .path.display())]
    FolderUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("scan cancelled")]
    Cancelled,
    #[error("at least one detection worker is required")]
    NoWorkers,
    #[error("detection workers disagree on model version: '{first}' vs '{other}'")]
    AnalyzerMismatch { first: String, other: String },
    #[error("cannot spawn detection worker: {0}")]
    Worker(std::io::Error),
    #[error("detection workers stopped before finishing the scan")]
    WorkersLost,
}

/// Why an image was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    /// The file could not be listed or read.
    Io,
    /// The analyzer rejected the image (decode or model failure).
    Detection,
    /// An embedding did not match the database's embedding dimension.
    Dimension,
}

/// A non-fatal, per-image problem. The image is retried on the next scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub path: String,
    pub kind: WarningKind,
    pub message: String,
}

impl ScanWarning {
    pub(crate) fn new(path: impl Into<String>, kind: WarningKind, message: impl Into<String>) -> Self {
        let warning = Self { path: path.into(), kind, message: message.into() };
        tracing::warn!(path = %warning.path, kind = ?warning.kind, message = %warning.message, "skipping image");
        warning
    }
}
