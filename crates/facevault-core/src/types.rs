use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matcher::{MatchError, Metric};

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    fn check_dimension(&self, other: &Embedding) -> Result<(), MatchError> {
        if self.values.len() != other.values.len() {
            return Err(MatchError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }
        Ok(())
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-norm operand yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, MatchError> {
        self.check_dimension(other)?;

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }

    /// Euclidean norm of the difference of the two vectors.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, MatchError> {
        self.check_dimension(other)?;

        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }

    /// Return a copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// A registered face: one identity, one embedding, optionally the source image.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecord {
    pub identity: String,
    pub embedding: Embedding,
    /// Encoded source image as uploaded, when the store keeps images.
    pub image: Option<Vec<u8>>,
    pub registered_at: DateTime<Utc>,
}

/// Serializable view of a [`FaceRecord`] without the image payload.
#[derive(Debug, Clone, Serialize)]
pub struct FaceSummary {
    pub face_id: String,
    pub dimension: usize,
    pub model_version: Option<String>,
    pub has_image: bool,
    pub registered_at: DateTime<Utc>,
}

impl From<&FaceRecord> for FaceSummary {
    fn from(record: &FaceRecord) -> Self {
        Self {
            face_id: record.identity.clone(),
            dimension: record.embedding.dimension(),
            model_version: record.embedding.model_version.clone(),
            has_image: record.image.is_some(),
            registered_at: record.registered_at,
        }
    }
}

/// One ranked candidate from a search. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    #[serde(rename = "face_id")]
    pub identity: String,
    pub distance: f32,
    pub verified: bool,
}

/// Outcome of a pairwise verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub verified: bool,
    pub distance: f32,
    pub threshold: f32,
    pub metric: Metric,
}
