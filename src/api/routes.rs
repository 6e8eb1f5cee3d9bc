//! Admin API route handlers.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;

use crate::daytona::ExecOptions;
use crate::error::ServerboxError;
use crate::manager::ListFilter;
use crate::types::{CreateOptions, InstanceState};

use super::server::AppState;
use super::types::{
    error_response, DestroyResponse, ErrorResponse, ExecRequest, InstanceEnvelope,
    InstanceListResponse, InstanceView, ListQuery,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// `GET /healthz` — liveness, no auth.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// `GET /admin/instances`
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<InstanceListResponse>, ApiError> {
    let filter = ListFilter {
        state: query.state.as_deref().map(InstanceState::parse),
        labels: None,
        refresh: query.refresh.unwrap_or(false),
    };

    let records = state
        .manager
        .list(filter)
        .await
        .map_err(|e| error_response(&e))?;

    let instances: Vec<InstanceView> = records
        .into_iter()
        .map(|record| InstanceView::new(record, &state.proxy_base_url))
        .collect();
    let count = instances.len();
    Ok(Json(InstanceListResponse { instances, count }))
}

/// `POST /admin/instances`
pub async fn create_instance(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<InstanceEnvelope>), ApiError> {
    let opts: CreateOptions = serde_json::from_slice(&body).map_err(|e| {
        error_response(&ServerboxError::InvalidConfig(format!(
            "invalid create body: {e}"
        )))
    })?;

    let record = state
        .manager
        .create(opts)
        .await
        .map_err(|e| error_response(&e))?;

    Ok((
        StatusCode::CREATED,
        Json(InstanceEnvelope {
            instance: InstanceView::new(record, &state.proxy_base_url),
        }),
    ))
}

/// `GET /admin/instances/{id}`
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceEnvelope>, ApiError> {
    let record = state.manager.get(&id).await.map_err(|e| error_response(&e))?;
    Ok(Json(InstanceEnvelope {
        instance: InstanceView::new(record, &state.proxy_base_url),
    }))
}

/// `POST /admin/instances/{id}/resume`
pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceEnvelope>, ApiError> {
    let timeout = Duration::from_millis(state.config.resume_timeout_ms);
    let record = state
        .manager
        .resume(&id, Some(timeout))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(InstanceEnvelope {
        instance: InstanceView::new(record, &state.proxy_base_url),
    }))
}

/// `POST /admin/instances/{id}/stop`
pub async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceEnvelope>, ApiError> {
    let record = state.manager.stop(&id).await.map_err(|e| error_response(&e))?;
    Ok(Json(InstanceEnvelope {
        instance: InstanceView::new(record, &state.proxy_base_url),
    }))
}

/// `POST /admin/instances/{id}/archive`
pub async fn archive_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceEnvelope>, ApiError> {
    let record = state
        .manager
        .archive(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(InstanceEnvelope {
        instance: InstanceView::new(record, &state.proxy_base_url),
    }))
}

/// `DELETE /admin/instances/{id}`
pub async fn destroy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DestroyResponse>, ApiError> {
    state
        .manager
        .destroy(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(DestroyResponse { ok: true, id }))
}

/// `GET /admin/instances/{id}/health`
pub async fn instance_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let health = state
        .manager
        .health(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "health": health })))
}

/// `POST /admin/instances/{id}/exec`
pub async fn exec_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: ExecRequest = serde_json::from_slice(&body).map_err(|e| {
        error_response(&ServerboxError::InvalidConfig(format!(
            "invalid exec body: {e}"
        )))
    })?;

    let opts = ExecOptions {
        cwd: request.cwd,
        timeout_ms: request.timeout_ms,
    };
    let result = state
        .manager
        .exec(&id, &request.command, &opts)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "result": result })))
}

/// Fallback for unmatched routes.
pub async fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
            code: None,
            details: None,
        }),
    )
}
