// src/main.rs

use anyhow::{Context, Result};
use model_installer::api::{self, AppState};
use model_installer::prelude::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = InstallerConfig::from_env().context("invalid configuration")?;

    let store = SqliteJobStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening job database {}", config.db_path.display()))?;
    let registry = JobRegistry::spawn(Arc::new(store));

    let installer = Installer::from_config(&config, Arc::new(registry.clone()))
        .context("building download client")?;
    let resolver = HuggingFaceResolver::from_config(&config).context("building hub client")?;

    let state = AppState::new(
        Arc::new(installer),
        Arc::new(resolver),
        registry,
        config.download_dir.clone(),
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, max_concurrency = config.max_concurrency, "model installer listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
    }
}
