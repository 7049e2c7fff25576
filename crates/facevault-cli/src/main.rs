use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facevault_core::{Config, FaceStore, FaceSummary, Matcher, Metric, Registry};
use facevault_vision::{ExtractorSettings, OnnxExtractor};
use serde_json::json;

#[derive(Parser)]
#[command(name = "facevault", version, about = "Face registry CLI")]
struct Cli {
    /// Face database to use instead of the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Override the configured distance metric (cosine, euclidean)
    #[arg(long, global = true)]
    metric: Option<Metric>,

    /// Override the verification threshold
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or replace) the face in an image under an identity
    Register { id: String, image: PathBuf },
    /// List registered identities
    List,
    /// Show metadata for one identity
    Show { id: String },
    /// Remove a registered identity
    Delete { id: String },
    /// Check whether an image shows a registered identity
    Verify { id: String, image: PathBuf },
    /// Rank registered faces by similarity to an image
    Search {
        image: PathBuf,
        /// Return at most this many matches
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Compare the faces in two images without storing anything
    Compare { source: PathBuf, target: PathBuf },
    /// Show configuration and store status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("loading configuration")?;
    apply_overrides(&mut config, &cli)?;

    match cli.command {
        Commands::Register { id, image } => {
            let registry = open_registry(&config)?;
            let record = registry.register(&id, &read_image(&image)?)?;
            print_json(&FaceSummary::from(&record))?;
        }
        Commands::List => {
            let store = open_store(&config)?;
            print_json(&json!({ "registered_faces": store.list() }))?;
        }
        Commands::Show { id } => {
            let store = open_store(&config)?;
            let Some(record) = store.get(&id) else {
                bail!("face with ID {id} not found");
            };
            print_json(&FaceSummary::from(&record))?;
        }
        Commands::Delete { id } => {
            let store = open_store(&config)?;
            if !store.delete(&id)? {
                bail!("face with ID {id} not found");
            }
            println!("Face with ID {id} deleted");
        }
        Commands::Verify { id, image } => {
            let registry = open_registry(&config)?;
            let comparison = registry.verify(&id, &read_image(&image)?)?;
            print_json(&comparison)?;
        }
        Commands::Search { image, limit } => {
            let registry = open_registry(&config)?;
            let matches = registry.search(&read_image(&image)?, limit)?;
            print_json(&matches)?;
        }
        Commands::Compare { source, target } => {
            let registry = open_registry(&config)?;
            let comparison = registry.compare(&read_image(&source)?, &read_image(&target)?)?;
            print_json(&comparison)?;
        }
        Commands::Status => {
            let store = open_store(&config)?;
            print_json(&status(&config, &store))?;
        }
    }

    Ok(())
}

/// Command-line flags win over the file and environment layers.
fn apply_overrides(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(metric) = cli.metric {
        config.metric = metric;
    }
    if let Some(threshold) = cli.threshold {
        if !config.set_threshold(threshold) {
            bail!("--threshold must be a finite, non-negative number (got {threshold})");
        }
    }
    tracing::debug!(
        db = %config.db_path.display(),
        metric = %config.metric,
        threshold = config.effective_threshold(),
        "configuration resolved"
    );
    Ok(())
}

fn open_store(config: &Config) -> Result<FaceStore> {
    let store = FaceStore::open(&config.db_path)
        .with_context(|| format!("opening face store at {}", config.db_path.display()))?
        .keep_images(config.keep_images);
    Ok(store)
}

fn open_registry(config: &Config) -> Result<Registry> {
    let store = open_store(config)?;
    tracing::debug!(dir = %config.model_dir.display(), "loading face models");
    let extractor = OnnxExtractor::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        ExtractorSettings {
            min_confidence: config.detection_confidence,
            ambiguity_ratio: config.ambiguity_ratio,
        },
    )
    .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;

    Ok(Registry::new(Arc::new(store), Arc::new(extractor), config.matcher()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn status(config: &Config, store: &FaceStore) -> serde_json::Value {
    let matcher: Matcher = config.matcher();
    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "db_path": config.db_path.display().to_string(),
        "registered_faces": store.len(),
        "metric": matcher.metric(),
        "threshold": matcher.threshold(),
        "keep_images": config.keep_images,
        "models": {
            "detector": { "path": scrfd.display().to_string(), "present": scrfd.exists() },
            "recognizer": { "path": arcface.display().to_string(), "present": arcface.exists() },
        },
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search_with_limit_and_globals() {
        let cli = Cli::try_parse_from([
            "facevault",
            "search",
            "query.jpg",
            "--limit",
            "3",
            "--metric",
            "euclidean",
            "--db",
            "/tmp/f.db",
        ])
        .unwrap();
        assert_eq!(cli.metric, Some(Metric::Euclidean));
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/f.db")));
        match cli.command {
            Commands::Search { image, limit } => {
                assert_eq!(image, PathBuf::from("query.jpg"));
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_threshold_flag_overrides_config() {
        let cli = Cli::try_parse_from(["facevault", "--threshold", "0.3", "list"]).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli).unwrap();
        assert_eq!(config.threshold, Some(0.3));
        assert_eq!(config.matcher().threshold(), 0.3);
    }

    #[test]
    fn test_invalid_threshold_flag_rejected() {
        for raw in ["NaN", "-1"] {
            let flag = format!("--threshold={raw}");
            let cli = Cli::try_parse_from(["facevault", "list", flag.as_str()]).unwrap();
            let mut config = Config::default();
            assert!(apply_overrides(&mut config, &cli).is_err(), "accepted {raw}");
            assert_eq!(config.threshold, None);
        }
    }

    #[test]
    fn test_register_requires_image() {
        assert!(Cli::try_parse_from(["facevault", "register", "alice"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_metric() {
        assert!(Cli::try_parse_from(["facevault", "--metric", "manhattan", "list"]).is_err());
    }

    #[test]
    fn test_status_reports_store_and_models() {
        let config = Config {
            model_dir: PathBuf::from("/nonexistent/models"),
            ..Config::default()
        };
        let store = FaceStore::open_in_memory().unwrap();
        let value = status(&config, &store);
        assert_eq!(value["registered_faces"], 0);
        assert_eq!(value["metric"], "cosine");
        assert_eq!(value["models"]["detector"]["present"], false);
    }
}
