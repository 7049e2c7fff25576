//! Registration, verification and search over a [`FaceStore`].
//!
//! This is the surface the HTTP service and the CLI share. Every method is
//! blocking: extraction may take hundreds of milliseconds.

use std::sync::Arc;

use thiserror::Error;

use crate::extractor::{extract_from_bytes, EmbeddingExtractor, ExtractionError};
use crate::matcher::{MatchError, Matcher};
use crate::store::{FaceStore, StoreError};
use crate::types::{Comparison, FaceRecord, MatchResult};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity must be a non-empty string")]
    InvalidIdentity,
    #[error("face with ID {0} not found")]
    IdentityNotFound(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Persistence(StoreError),
}

/// Coarse classification used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself was unusable (bad image, no face, bad identity).
    ClientInput,
    NotFound,
    /// Storage, model or data-integrity failure on our side.
    Internal,
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::InvalidIdentity => ErrorKind::ClientInput,
            RegistryError::IdentityNotFound(_) => ErrorKind::NotFound,
            RegistryError::Extraction(ExtractionError::Inference(_)) => ErrorKind::Internal,
            RegistryError::Extraction(_) => ErrorKind::ClientInput,
            RegistryError::Match(_) | RegistryError::Persistence(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidIdentity => RegistryError::InvalidIdentity,
            StoreError::Extraction(e) => RegistryError::Extraction(e),
            other => RegistryError::Persistence(other),
        }
    }
}

pub struct Registry {
    store: Arc<FaceStore>,
    extractor: Arc<dyn EmbeddingExtractor>,
    matcher: Matcher,
}

impl Registry {
    pub fn new(
        store: Arc<FaceStore>,
        extractor: Arc<dyn EmbeddingExtractor>,
        matcher: Matcher,
    ) -> Self {
        Self {
            store,
            extractor,
            matcher,
        }
    }

    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn model_version(&self) -> Option<&str> {
        self.extractor.model_version()
    }

    pub fn register(&self, identity: &str, image: &[u8]) -> Result<FaceRecord, RegistryError> {
        Ok(self.store.register(self.extractor.as_ref(), identity, image)?)
    }

    pub fn get(&self, identity: &str) -> Result<FaceRecord, RegistryError> {
        self.store
            .get(identity)
            .ok_or_else(|| RegistryError::IdentityNotFound(identity.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        self.store.list()
    }

    pub fn delete(&self, identity: &str) -> Result<bool, RegistryError> {
        Ok(self.store.delete(identity)?)
    }

    /// Does `image` show the face registered as `identity`?
    pub fn verify(&self, identity: &str, image: &[u8]) -> Result<Comparison, RegistryError> {
        let record = self.get(identity)?;
        let query = extract_from_bytes(self.extractor.as_ref(), image)?;
        let comparison = self.matcher.compare(&query, &record.embedding)?;

        tracing::info!(
            identity,
            distance = comparison.distance,
            threshold = comparison.threshold,
            verified = comparison.verified,
            "verify"
        );
        Ok(comparison)
    }

    /// Rank every registered face against the face in `image`.
    pub fn search(
        &self,
        image: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<MatchResult>, RegistryError> {
        let query = extract_from_bytes(self.extractor.as_ref(), image)?;
        let candidates = self.store.embeddings();

        let mut results = self
            .matcher
            .search(&query, candidates.iter().map(|(id, e)| (id.as_str(), e)));
        if let Some(limit) = limit {
            results.truncate(limit);
        }

        tracing::debug!(
            candidates = candidates.len(),
            returned = results.len(),
            best = ?results.first().map(|r| r.distance),
            "search"
        );
        Ok(results)
    }

    /// Do two images show the same person? Nothing is stored.
    pub fn compare(&self, source: &[u8], target: &[u8]) -> Result<Comparison, RegistryError> {
        let a = extract_from_bytes(self.extractor.as_ref(), source)?;
        let b = extract_from_bytes(self.extractor.as_ref(), target)?;
        Ok(self.matcher.compare(&a, &b)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Metric;
    use crate::types::Embedding;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Embeds the top-left pixel colour; red 255 means "two faces".
    struct PixelExtractor;

    impl EmbeddingExtractor for PixelExtractor {
        fn extract(&self, image: &DynamicImage) -> Result<Embedding, ExtractionError> {
            let [r, g, b] = image.to_rgb8().get_pixel(0, 0).0;
            match (r, g, b) {
                (0, 0, 0) => Err(ExtractionError::NoFaceDetected),
                (255, _, _) => Err(ExtractionError::AmbiguousFace { faces: 2 }),
                _ => Ok(Embedding::new(vec![r as f32, g as f32, b as f32])),
            }
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(2, 2, Rgb(color))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn registry() -> Registry {
        Registry::new(
            Arc::new(FaceStore::open_in_memory().unwrap()),
            Arc::new(PixelExtractor),
            Matcher::new(Metric::Cosine),
        )
    }

    #[test]
    fn test_register_then_verify_same_face() {
        let reg = registry();
        reg.register("alice", &png([10, 200, 30])).unwrap();
        let c = reg.verify("alice", &png([10, 200, 30])).unwrap();
        assert!(c.verified);
        assert!(c.distance.abs() < 1e-6);
    }

    #[test]
    fn test_verify_different_face() {
        let reg = registry();
        reg.register("alice", &png([200, 1, 1])).unwrap();
        let c = reg.verify("alice", &png([1, 1, 200])).unwrap();
        assert!(!c.verified);
    }

    #[test]
    fn test_verify_unknown_identity_is_not_found() {
        let reg = registry();
        let err = reg.verify("nobody", &png([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RegistryError::IdentityNotFound(ref id) if id == "nobody"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_register_no_face_is_client_error() {
        let reg = registry();
        let err = reg.register("alice", &png([0, 0, 0])).unwrap_err();
        assert!(matches!(err, RegistryError::Extraction(ExtractionError::NoFaceDetected)));
        assert_eq!(err.kind(), ErrorKind::ClientInput);
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_register_ambiguous_face_is_client_error() {
        let reg = registry();
        let err = reg.register("alice", &png([255, 0, 0])).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Extraction(ExtractionError::AmbiguousFace { faces: 2 })
        ));
        assert_eq!(err.kind(), ErrorKind::ClientInput);
    }

    #[test]
    fn test_register_empty_identity() {
        let reg = registry();
        let err = reg.register("", &png([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidIdentity));
        assert_eq!(err.kind(), ErrorKind::ClientInput);
    }

    #[test]
    fn test_undecodable_image_is_client_error() {
        let reg = registry();
        let err = reg.register("alice", b"not an image").unwrap_err();
        assert!(matches!(err, RegistryError::Extraction(ExtractionError::InvalidImage(_))));
        assert_eq!(err.kind(), ErrorKind::ClientInput);
    }

    #[test]
    fn test_search_ranks_best_first_and_limits() {
        let reg = registry();
        reg.register("red", &png([200, 10, 10])).unwrap();
        reg.register("green", &png([10, 200, 10])).unwrap();
        reg.register("blue", &png([10, 10, 200])).unwrap();

        let all = reg.search(&png([12, 190, 12]), None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].identity, "green");
        assert!(all[0].verified);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));

        let top = reg.search(&png([12, 190, 12]), Some(1)).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].identity, "green");
    }

    #[test]
    fn test_search_skips_stray_dimension() {
        let reg = registry();
        reg.register("green", &png([10, 200, 10])).unwrap();
        reg.store()
            .put(FaceRecord {
                identity: "stray".into(),
                embedding: Embedding::new(vec![1.0; 5]),
                image: None,
                registered_at: chrono::Utc::now(),
            })
            .unwrap();

        let results = reg.search(&png([10, 200, 10]), None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity, "green");
    }

    #[test]
    fn test_verify_against_stray_dimension_is_internal() {
        let reg = registry();
        reg.store()
            .put(FaceRecord {
                identity: "stray".into(),
                embedding: Embedding::new(vec![1.0; 5]),
                image: None,
                registered_at: chrono::Utc::now(),
            })
            .unwrap();
        let err = reg.verify("stray", &png([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RegistryError::Match(MatchError::DimensionMismatch { .. })));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_compare_two_images() {
        let reg = registry();
        let same = reg.compare(&png([5, 100, 5]), &png([5, 100, 5])).unwrap();
        assert!(same.verified);
        let diff = reg.compare(&png([100, 5, 5]), &png([5, 5, 100])).unwrap();
        assert!(!diff.verified);
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_inference_failure_is_internal() {
        let err = RegistryError::Extraction(ExtractionError::Inference("boom".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
