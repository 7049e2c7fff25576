//! Embedding extraction contract.
//!
//! The store and registry never run a model themselves; they call an
//! [`EmbeddingExtractor`] and treat any failure as final for that request.

use image::DynamicImage;
use thiserror::Error;

use crate::types::Embedding;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("ambiguous input: {faces} faces of comparable size detected")]
    AmbiguousFace { faces: usize },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Turns one face in an image into an embedding.
///
/// Implementations must fail with [`ExtractionError::NoFaceDetected`] or
/// [`ExtractionError::AmbiguousFace`] rather than guess.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &DynamicImage) -> Result<Embedding, ExtractionError>;

    /// Identifier of the model producing the embeddings, if known.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// Decode an uploaded image (JPEG, PNG, ...) from its encoded bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::InvalidImage("empty payload".into()));
    }
    image::load_from_memory(bytes).map_err(|e| ExtractionError::InvalidImage(e.to_string()))
}

/// Decode and extract in one step.
pub fn extract_from_bytes(
    extractor: &dyn EmbeddingExtractor,
    bytes: &[u8],
) -> Result<Embedding, ExtractionError> {
    let image = decode_image(bytes)?;
    extractor.extract(&image)
}
