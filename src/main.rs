use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use serverbox::api::{self, AppState};
use serverbox::config::Config;
use serverbox::daytona::DaytonaApiClient;
use serverbox::error::Result;
use serverbox::manager::{InstanceManager, ManagerConfig};
use serverbox::resume::ResumeCoordinator;
use serverbox::store::{InstanceStore, SqliteInstanceStore};

#[tokio::main]
async fn main() {
    let level = std::env::var("SERVERBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal startup failure");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let store = Arc::new(SqliteInstanceStore::open(&config.db_path)?);
    tracing::info!(path = %config.db_path.display(), "metadata store opened");

    let provider = Arc::new(DaytonaApiClient::new(&config.daytona)?);
    if config.daytona.api_key.is_none() {
        tracing::warn!("DAYTONA_API_KEY is not set; sandbox operations will fail until it is");
    }

    let manager = Arc::new(InstanceManager::new(
        store.clone(),
        provider,
        ManagerConfig::default(),
    ));
    let coordinator = Arc::new(ResumeCoordinator::new(
        manager.clone(),
        config.auto_resume,
        Duration::from_millis(config.resume_timeout_ms),
    ));

    let host = config.host.clone();
    let port = config.port;
    let config = Arc::new(config);
    let state = AppState::new(manager, coordinator, config)?;

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .map_err(|e| {
            serverbox::ServerboxError::InvalidConfig(format!(
                "failed to bind {host}:{port}: {e}"
            ))
        })?;
    tracing::info!("serverbox listening on {host}:{port}");

    api::serve(listener, state).await?;

    store.close().await?;
    tracing::info!("clean shutdown");
    Ok(())
}
