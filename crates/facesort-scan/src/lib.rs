//! facesort-scan — Incremental face scanning of a photo folder.
//!
//! Enumerates images, runs detection on a pool of worker threads, clusters
//! the resulting embeddings on a single writer in path order, and commits
//! each image to the folder database as it completes.

pub mod config;
mod error;
pub mod scanner;
pub mod source;

pub use config::{Config, ConfigError};
pub use error::{ScanError, ScanWarning, WarningKind};
pub use scanner::{CancelToken, ScanOptions, ScanRecord, ScanReport, ScanStats, Scanner};
