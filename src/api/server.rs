//! Router assembly and server lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Result, ServerboxError};
use crate::manager::InstanceManager;
use crate::resume::ResumeCoordinator;

use super::middleware::admin_auth;
use super::proxy;
use super::routes;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub coordinator: Arc<ResumeCoordinator>,
    pub config: Arc<Config>,
    /// Externally-visible base URL used for `proxyUrl` fields.
    pub proxy_base_url: String,
    /// Client used for upstream forwarding; its read timeout enforces the
    /// configured idle budget without capping long-lived streams.
    pub upstream: reqwest::Client,
}

impl AppState {
    pub fn new(
        manager: Arc<InstanceManager>,
        coordinator: Arc<ResumeCoordinator>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let upstream = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| {
                ServerboxError::InvalidConfig(format!("failed to build upstream client: {e}"))
            })?;

        let proxy_base_url = config.proxy_base_url();
        Ok(Self {
            manager,
            coordinator,
            config,
            proxy_base_url,
            upstream,
        })
    }
}

/// Build the full router: health, admin (key-gated), and the instance proxy.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/instances",
            get(routes::list_instances).post(routes::create_instance),
        )
        .route(
            "/instances/:id",
            get(routes::get_instance).delete(routes::destroy_instance),
        )
        .route("/instances/:id/resume", post(routes::resume_instance))
        .route("/instances/:id/stop", post(routes::stop_instance))
        .route("/instances/:id/archive", post(routes::archive_instance))
        .route("/instances/:id/health", get(routes::instance_health))
        .route("/instances/:id/exec", post(routes::exec_instance))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let request_logs = state.config.request_logs;

    let router = Router::new()
        .route("/healthz", get(routes::healthz))
        .nest("/admin", admin)
        // Bare /i and /i/ must reach the proxy handler too, so a missing
        // instance id is reported as 400 rather than a routing 404.
        .route("/i", any(proxy::forward))
        .route("/i/", any(proxy::forward))
        .route("/i/:id", any(proxy::forward))
        .route("/i/:id/*suffix", any(proxy::forward))
        .fallback(routes::not_found)
        .with_state(state);

    if request_logs {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Serve until SIGINT/SIGTERM; in-flight requests drain before return.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerboxError::InvalidConfig(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
