//! Admin authentication middleware.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use subtle::ConstantTimeEq;

use super::server::AppState;
use super::types::ErrorResponse;

/// Header carrying the admin API key.
pub const ADMIN_KEY_HEADER: &str = "x-serverbox-admin-key";

/// Reject requests whose admin key is missing or wrong. Comparison is
/// constant-time.
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    let authorized = provided.is_some_and(|key| {
        bool::from(
            key.as_bytes()
                .ct_eq(state.config.admin_api_key.as_bytes()),
        )
    });

    if !authorized {
        tracing::warn!("rejected admin request: missing or invalid key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized admin request.".to_string(),
                code: None,
                details: None,
            }),
        )
            .into_response();
    }

    next.run(request).await
}
