//! facevault-vision — ONNX face detection and embedding.
//!
//! SCRFD finds faces and their landmarks, each face is aligned to the ArcFace
//! template, and ArcFace produces a unit-length 512-dim embedding.
//! [`OnnxExtractor`] wires the pipeline into facevault-core.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod recognizer;

pub use detector::{FaceBox, FaceDetector, Landmarks};
pub use extractor::{select_face, ExtractorSettings, LoadError, OnnxExtractor};
pub use recognizer::FaceRecognizer;
