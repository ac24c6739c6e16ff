//! facesort-store — The per-folder face database.
//!
//! One SQLite file per scanned folder holds image fingerprints, face
//! observations, cluster state, merge aliases, labels and scan history.
//! Every write is a single `BEGIN IMMEDIATE` transaction; the file is
//! integrity-checked on open and never repaired silently.

mod clusters;
mod db;
mod error;
mod history;
mod images;
mod labels;
mod locate;
mod schema;

pub use clusters::{ClusterSummary, MergeOutcome};
pub use db::Database;
pub use error::StoreError;
pub use history::ScanRun;
pub use images::{Fingerprint, ImageUpdate};
pub use labels::Label;
pub use locate::{database_path, DbScope, FOLDER_DB_DIR};
pub use schema::SCHEMA_VERSION;
