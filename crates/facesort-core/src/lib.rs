//! facesort-core — Face detection, embedding and identity clustering.
//!
//! Uses SCRFD for face detection and ArcFace for face embedding, both running
//! via ONNX Runtime for CPU inference, and groups embeddings into stable
//! clusters with an online nearest-centroid index.

pub mod alignment;
pub mod analyzer;
pub mod cluster;
pub mod detector;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{DetectionError, FaceAnalyzer, OnnxAnalyzer};
pub use cluster::{Assignment, Cluster, ClusterError, ClusterIndex, MAX_EXEMPLARS};
pub use types::{BoundingBox, ClusterId, DetectedFace, Embedding, FaceObservation, Metric};

/// `$XDG_DATA_HOME/facesort`, falling back to `~/.local/share/facesort`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facesort")
}

/// Default location of the ONNX model files: `<data dir>/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_live_under_data_dir() {
        let data = default_data_dir();
        assert!(data.ends_with("facesort"));
        assert_eq!(default_model_dir(), data.join("models"));
    }
}
