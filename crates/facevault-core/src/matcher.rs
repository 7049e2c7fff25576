//! Distance computation, threshold verification and ranked search.
//!
//! Two distance routes exist: Euclidean and cosine-derived (`1 - cos`). A
//! [`Matcher`] is bound to exactly one of them, so pairwise verification and
//! ranked search always agree on what a distance means and which threshold
//! applies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Comparison, Embedding, MatchResult};

/// Reference threshold for ArcFace-class embeddings on the cosine route.
pub const DEFAULT_COSINE_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Distance metric used by a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    #[default]
    Cosine,
}

impl Metric {
    /// Distance between two embeddings under this metric. Lower = more similar.
    pub fn distance(self, a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
        match self {
            Metric::Euclidean => distance(a, b),
            Metric::Cosine => cosine_distance(a, b),
        }
    }

    /// Threshold calibrated for this metric.
    ///
    /// For unit-norm embeddings `||a - b||^2 = 2 * (1 - cos)`, so the Euclidean
    /// threshold is the exact image of the cosine one.
    pub fn default_threshold(self) -> f32 {
        match self {
            Metric::Cosine => DEFAULT_COSINE_THRESHOLD,
            Metric::Euclidean => (2.0 * DEFAULT_COSINE_THRESHOLD).sqrt(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric '{other}' (expected 'cosine' or 'euclidean')")),
        }
    }
}

/// Euclidean distance between two equal-dimension embeddings.
pub fn distance(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    a.euclidean_distance(b)
}

/// Cosine-derived distance, `1 - cos(a, b)`, in [0, 2].
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    Ok(1.0 - a.similarity(b)?)
}

/// A pair is verified when its distance does not exceed the threshold.
pub fn verify(distance: f32, threshold: f32) -> bool {
    distance <= threshold
}

/// Metric plus the threshold calibrated for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    metric: Metric,
    threshold: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Metric::default())
    }
}

impl Matcher {
    /// Matcher using the metric's calibrated default threshold.
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            threshold: metric.default_threshold(),
        }
    }

    pub fn with_threshold(metric: Metric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pairwise verification of two embeddings.
    pub fn compare(&self, a: &Embedding, b: &Embedding) -> Result<Comparison, MatchError> {
        let distance = self.metric.distance(a, b)?;
        Ok(Comparison {
            verified: verify(distance, self.threshold),
            distance,
            threshold: self.threshold,
            metric: self.metric,
        })
    }

    /// Rank every candidate by distance to `query`, best match first.
    ///
    /// Candidates whose dimension differs from the query are skipped with a
    /// warning. The sort is stable, so equal distances keep enumeration order.
    pub fn search<'a, I>(&self, query: &Embedding, candidates: I) -> Vec<MatchResult>
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>,
    {
        let mut results: Vec<MatchResult> = candidates
            .into_iter()
            .filter_map(|(identity, embedding)| {
                match self.metric.distance(query, embedding) {
                    Ok(distance) => Some(MatchResult {
                        identity: identity.to_string(),
                        distance,
                        verified: verify(distance, self.threshold),
                    }),
                    Err(e) => {
                        tracing::warn!(identity, error = %e, "skipping candidate");
                        None
                    }
                }
            })
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results
    }
}
