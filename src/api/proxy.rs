//! Instance proxy data plane
//!
//! Forwards any method on `/i/{instanceId}/{suffix}` to the instance's
//! upstream server: authenticates the caller, ensures the instance is
//! running (resuming it if needed), rewrites headers, and streams both
//! bodies without buffering.

use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

use crate::error::ServerboxError;
use crate::health::PREVIEW_TOKEN_HEADER;
use crate::types::InstanceRecord;

use super::middleware::ADMIN_KEY_HEADER;
use super::server::AppState;
use super::types::{error_response, ErrorResponse};

/// Header carrying the proxy-route key.
pub const PROXY_KEY_HEADER: &str = "x-serverbox-proxy-key";

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Caller-auth headers terminated at the proxy.
const CALLER_AUTH_HEADERS: [&str; 4] = [
    "authorization",
    PREVIEW_TOKEN_HEADER,
    ADMIN_KEY_HEADER,
    PROXY_KEY_HEADER,
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Entry point for all `/i/...` routes.
pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    match proxy(state, request).await {
        Ok(response) => response,
        Err(e) => error_response(&e).into_response(),
    }
}

async fn proxy(state: AppState, request: Request) -> crate::error::Result<Response> {
    if let Some(expected) = &state.config.proxy_api_key {
        let provided = request
            .headers()
            .get(PROXY_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        let authorized = provided
            .is_some_and(|key| bool::from(key.as_bytes().ct_eq(expected.as_bytes())));
        if !authorized {
            tracing::warn!("rejected proxy request: missing or invalid key");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Unauthorized proxy request.".to_string(),
                    code: None,
                    details: None,
                }),
            )
                .into_response());
        }
    }

    let (id, suffix) = parse_instance_path(request.uri().path())?;
    let record = state.coordinator.ensure_running(&id).await?;

    let Some(base_url) = record.url.as_deref() else {
        return Err(ServerboxError::InstanceNotRunning(id));
    };
    let mut upstream_url = format!("{}/{}", base_url.trim_end_matches('/'), suffix);
    if let Some(query) = request.uri().query() {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    let (parts, body) = request.into_parts();
    let upstream_headers = rewrite_request_headers(&parts.headers, &record)?;

    tracing::debug!(
        instance_id = %record.id,
        method = %parts.method,
        url = %upstream_url,
        "forwarding to upstream"
    );

    let mut builder = state
        .upstream
        .request(parts.method, &upstream_url)
        .headers(upstream_headers);
    // A known-empty body is omitted entirely; streaming it would force
    // chunked framing onto bodyless requests.
    if body.size_hint().exact() != Some(0) {
        builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let upstream_result = builder.send().await;

    let upstream_response = match upstream_result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(instance_id = %record.id, error = %e, "upstream request failed");
            return Ok((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: "Upstream proxy request failed".to_string(),
                    code: None,
                    details: Some(e.to_string()),
                }),
            )
                .into_response());
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    for (name, value) in &response_headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}

/// Split `/i/{id}/{suffix}` into id and suffix. The suffix may be empty.
fn parse_instance_path(path: &str) -> crate::error::Result<(String, String)> {
    let rest = path.strip_prefix("/i/").unwrap_or("");
    let (id, suffix) = match rest.split_once('/') {
        Some((id, suffix)) => (id, suffix),
        None => (rest, ""),
    };
    if id.is_empty() {
        return Err(ServerboxError::InvalidConfig(
            "missing instance id in proxy path".to_string(),
        ));
    }
    Ok((id.to_string(), suffix.to_string()))
}

/// Drop hop-by-hop, host, and caller-auth headers; inject upstream Basic
/// auth, the preview token, and forwarding metadata.
fn rewrite_request_headers(
    original: &HeaderMap,
    record: &InstanceRecord,
) -> crate::error::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in original {
        let lower = name.as_str();
        if lower == "host" || is_hop_by_hop(lower) || CALLER_AUTH_HEADERS.contains(&lower) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let credentials =
        BASE64_STANDARD.encode(format!("{}:{}", record.username, record.password));
    let basic = HeaderValue::from_str(&format!("Basic {credentials}")).map_err(|e| {
        ServerboxError::InvalidConfig(format!("instance credentials are not header-safe: {e}"))
    })?;
    headers.insert(header::AUTHORIZATION, basic);

    if let Some(token) = &record.preview_token {
        let value = HeaderValue::from_str(token).map_err(|e| {
            ServerboxError::InvalidConfig(format!("preview token is not header-safe: {e}"))
        })?;
        headers.insert(HeaderName::from_static(PREVIEW_TOKEN_HEADER), value);
    }

    if let Some(host) = original.get(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;
    use std::collections::HashMap;

    fn record() -> InstanceRecord {
        InstanceRecord {
            id: "A".into(),
            sandbox_id: "sbx-A".into(),
            state: InstanceState::Running,
            url: Some("https://upstream.example".into()),
            preview_token: Some("tok".into()),
            username: "opencode".into(),
            password: "pw".into(),
            providers: vec![],
            labels: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn path_parse_splits_id_and_suffix() {
        assert_eq!(
            parse_instance_path("/i/A/session").unwrap(),
            ("A".to_string(), "session".to_string())
        );
        assert_eq!(
            parse_instance_path("/i/A/a/b/c").unwrap(),
            ("A".to_string(), "a/b/c".to_string())
        );
        assert_eq!(
            parse_instance_path("/i/A").unwrap(),
            ("A".to_string(), String::new())
        );
        assert!(parse_instance_path("/i/").is_err());
    }

    #[test]
    fn rewrite_strips_and_injects() {
        let mut original = HeaderMap::new();
        original.insert(header::HOST, HeaderValue::from_static("proxy.example"));
        original.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        original.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        original.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        original.insert("x-serverbox-proxy-key", HeaderValue::from_static("pk"));
        original.insert("x-custom", HeaderValue::from_static("kept"));

        let rewritten = rewrite_request_headers(&original, &record()).unwrap();

        assert!(rewritten.get(header::HOST).is_none());
        assert!(rewritten.get(header::CONNECTION).is_none());
        assert!(rewritten.get("transfer-encoding").is_none());
        assert!(rewritten.get("x-serverbox-proxy-key").is_none());
        assert_eq!(rewritten.get("x-custom").unwrap(), "kept");

        // Basic base64("opencode:pw")
        assert_eq!(
            rewritten.get(header::AUTHORIZATION).unwrap(),
            "Basic b3BlbmNvZGU6cHc="
        );
        assert_eq!(rewritten.get(PREVIEW_TOKEN_HEADER).unwrap(), "tok");
        assert_eq!(rewritten.get("x-forwarded-host").unwrap(), "proxy.example");
        assert_eq!(rewritten.get("x-forwarded-proto").unwrap(), "http");
    }
}
