//! The detect-and-embed capability consumed by the scan engine.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::DetectedFace;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Detect faces in an encoded image and embed each one.
///
/// Implementations must be deterministic for a fixed `model_version`, and
/// every embedding they return must come from the same embedding space.
/// Faces are returned in a stable order (the bundled implementation sorts by
/// detection confidence).
pub trait FaceAnalyzer: Send {
    /// Identifies the model pair; persisted per database.
    fn model_version(&self) -> &str;

    fn analyze(&mut self, image_bytes: &[u8]) -> Result<Vec<DetectedFace>, DetectionError>;
}

/// SCRFD detection + ArcFace embedding.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    model_version: String,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, min_confidence: f32) -> Result<Self, DetectionError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?
            .with_confidence_threshold(min_confidence);
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
            model_version: format!("scrfd_10g+{ARCFACE_MODEL_VERSION}"),
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn analyze(&mut self, image_bytes: &[u8]) -> Result<Vec<DetectedFace>, DetectionError> {
        let image = image::load_from_memory(image_bytes)?.to_rgb8();
        let boxes = self.detector.detect(&image)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bounding_box in boxes {
            let crop = match &bounding_box.landmarks {
                Some(landmarks) => alignment::align_face(&image, landmarks),
                None => None,
            }
            .or_else(|| alignment::crop_face(&image, &bounding_box));

            let Some(crop) = crop else {
                tracing::debug!(?bounding_box, "face too small to crop, skipping");
                continue;
            };

            let embedding = self.recognizer.embed(&crop)?;
            faces.push(DetectedFace { bounding_box, embedding });
        }
        Ok(faces)
    }
}
