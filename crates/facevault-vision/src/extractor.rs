//! [`EmbeddingExtractor`] backed by the SCRFD + ArcFace pipeline.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use facevault_core::{Embedding, EmbeddingExtractor, ExtractionError};
use image::DynamicImage;
use thiserror::Error;

use crate::detector::{DetectorError, FaceBox, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorSettings {
    /// Minimum SCRFD score for a detection to count.
    pub min_confidence: f32,
    /// A runner-up face at least this fraction of the largest face's area
    /// makes the input ambiguous.
    pub ambiguity_ratio: f32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            ambiguity_ratio: 0.5,
        }
    }
}

pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    settings: ExtractorSettings,
}

impl OnnxExtractor {
    pub fn load(
        scrfd_path: &Path,
        arcface_path: &Path,
        settings: ExtractorSettings,
    ) -> Result<Self, LoadError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            settings,
        })
    }

    pub fn settings(&self) -> ExtractorSettings {
        self.settings
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Embedding, ExtractionError> {
        let rgb = image.to_rgb8();

        let faces = lock(&self.detector)
            .detect(&rgb, self.settings.min_confidence)
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        let face = select_face(&faces, self.settings.ambiguity_ratio)?;

        tracing::debug!(
            detected = faces.len(),
            confidence = face.confidence,
            width = face.width,
            height = face.height,
            "selected face"
        );

        lock(&self.recognizer)
            .extract(&rgb, face)
            .map_err(|e| ExtractionError::Inference(e.to_string()))
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}

/// Pick the one face to embed.
///
/// The largest face wins unless a second face comes within `ambiguity_ratio`
/// of its area, in which case the input is rejected.
pub fn select_face(faces: &[FaceBox], ambiguity_ratio: f32) -> Result<&FaceBox, ExtractionError> {
    let mut by_area: Vec<&FaceBox> = faces.iter().collect();
    by_area.sort_by(|a, b| b.area().total_cmp(&a.area()));

    let largest = *by_area.first().ok_or(ExtractionError::NoFaceDetected)?;
    let comparable = by_area
        .iter()
        .filter(|f| f.area() >= largest.area() * ambiguity_ratio)
        .count();

    if comparable > 1 {
        return Err(ExtractionError::AmbiguousFace { faces: comparable });
    }
    Ok(largest)
}
