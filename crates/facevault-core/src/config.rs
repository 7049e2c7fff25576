use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::{Matcher, Metric};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Service configuration.
///
/// Resolved in three layers: built-in defaults, then the optional TOML file
/// named by `FACEVAULT_CONFIG` (default `$XDG_CONFIG_HOME/facevault/config.toml`),
/// then `FACEVAULT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP service listens on.
    pub bind_addr: String,
    /// Path to the SQLite face database.
    pub db_path: PathBuf,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Distance metric for both verification and search.
    pub metric: Metric,
    /// Verification threshold; `None` uses the metric's calibrated default.
    pub threshold: Option<f32>,
    /// Keep the uploaded image next to its embedding.
    pub keep_images: bool,
    /// Maximum accepted request body, in bytes.
    pub max_upload_bytes: usize,
    /// Minimum detector confidence for a face to count.
    pub detection_confidence: f32,
    /// Runner-up face area, relative to the largest, at which input is ambiguous.
    pub ambiguity_ratio: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            db_path: data_dir.join("faces.db"),
            model_dir: data_dir.join("models"),
            metric: Metric::Cosine,
            threshold: None,
            keep_images: true,
            max_upload_bytes: 10 * 1024 * 1024,
            detection_confidence: 0.5,
            ambiguity_ratio: 0.5,
        }
    }
}

impl Config {
    /// Load from the default file location and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEVAULT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(t) = config.threshold.take() {
            config.set_threshold(t);
        }
        Ok(config)
    }

    /// Override fields from `FACEVAULT_*` variables looked up through `var`.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACEVAULT_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = var("FACEVAULT_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEVAULT_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(&var, "FACEVAULT_METRIC") {
            self.metric = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_THRESHOLD") {
            self.set_threshold(v);
        }
        if let Some(v) = var("FACEVAULT_KEEP_IMAGES") {
            self.keep_images = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = parsed(&var, "FACEVAULT_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_DETECTION_CONFIDENCE") {
            self.detection_confidence = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_AMBIGUITY_RATIO") {
            self.ambiguity_ratio = v;
        }
    }

    /// Use `threshold` for verification. Negative or non-finite values could
    /// never verify anything; they are ignored with a warning and `false` is
    /// returned.
    pub fn set_threshold(&mut self, threshold: f32) -> bool {
        if !threshold.is_finite() || threshold < 0.0 {
            tracing::warn!(threshold, "ignoring invalid verification threshold");
            return false;
        }
        self.threshold = Some(threshold);
        true
    }

    /// The matcher this configuration describes.
    pub fn matcher(&self) -> Matcher {
        match self.threshold {
            Some(t) => Matcher::with_threshold(self.metric, t),
            None => Matcher::new(self.metric),
        }
    }

    pub fn effective_threshold(&self) -> f32 {
        self.threshold.unwrap_or_else(|| self.metric.default_threshold())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facevault")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facevault")
        .join("config.toml")
}
