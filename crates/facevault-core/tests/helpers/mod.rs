#![allow(dead_code)]

use std::io::Cursor;

use facevault_core::{Embedding, EmbeddingExtractor, ExtractionError};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// Deterministic extractor: the embedding is the top-left pixel colour.
/// Black means no face.
pub struct ColorExtractor;

impl EmbeddingExtractor for ColorExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Embedding, ExtractionError> {
        let [r, g, b] = image.to_rgb8().get_pixel(0, 0).0;
        if [r, g, b] == [0, 0, 0] {
            return Err(ExtractionError::NoFaceDetected);
        }
        Ok(Embedding::new(vec![r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0])
            .with_model_version("color-test"))
    }

    fn model_version(&self) -> Option<&str> {
        Some("color-test")
    }
}

/// Encode a solid-colour PNG.
pub fn png(color: [u8; 3]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(3, 3, Rgb(color))
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}
