//! facevault-core — Face embedding store and similarity matching.
//!
//! Persists one embedding per identity in SQLite, verifies pairs against a
//! distance threshold and ranks registered faces by linear scan. Embedding
//! extraction is delegated to an [`EmbeddingExtractor`].

pub mod config;
pub mod extractor;
pub mod matcher;
pub mod registry;
pub mod store;
pub mod types;

pub use config::Config;
pub use extractor::{EmbeddingExtractor, ExtractionError};
pub use matcher::{MatchError, Matcher, Metric};
pub use registry::{ErrorKind, Registry, RegistryError};
pub use store::{FaceStore, StoreError};
pub use types::{Comparison, Embedding, FaceRecord, FaceSummary, MatchResult};
