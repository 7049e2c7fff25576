use std::sync::Arc;

use anyhow::{Context, Result};
use facevault_core::{Config, FaceStore, Registry};
use facevault_vision::{ExtractorSettings, OnnxExtractor};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facevaultd starting");

    let config = Config::load().context("loading configuration")?;

    let store = FaceStore::open(&config.db_path)
        .with_context(|| format!("opening face store at {}", config.db_path.display()))?
        .keep_images(config.keep_images);

    // Fail fast: no point accepting requests without both models.
    let extractor = OnnxExtractor::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        ExtractorSettings {
            min_confidence: config.detection_confidence,
            ambiguity_ratio: config.ambiguity_ratio,
        },
    )
    .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;

    let matcher = config.matcher();
    tracing::info!(
        metric = %matcher.metric(),
        threshold = matcher.threshold(),
        keep_images = config.keep_images,
        "matcher configured"
    );

    let registry = Arc::new(Registry::new(Arc::new(store), Arc::new(extractor), matcher));
    let app = http::router(registry, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "facevaultd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facevaultd shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("facevaultd shutting down");
}
