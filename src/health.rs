//! Upstream health probing
//!
//! The upstream server exposes `GET /global/health` behind Basic auth. The
//! prober polls it until the body reports healthy or the deadline passes.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Result, ServerboxError};

/// Header carrying the provider-issued preview token, when one exists.
pub const PREVIEW_TOKEN_HEADER: &str = "x-daytona-preview-token";

/// One health probe. Success requires HTTP 2xx and a JSON body with
/// `healthy: true`; returns the full health JSON.
pub async fn fetch_health(
    client: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
    preview_token: Option<&str>,
) -> Result<Value> {
    let url = format!("{}/global/health", base_url.trim_end_matches('/'));
    let mut request = client
        .get(&url)
        .basic_auth(username, Some(password));
    if let Some(token) = preview_token {
        request = request.header(PREVIEW_TOKEN_HEADER, token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ServerboxError::HealthCheckFailed(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ServerboxError::HealthCheckFailed(format!(
            "{url}: HTTP {status}"
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ServerboxError::HealthCheckFailed(format!("{url}: invalid JSON: {e}")))?;

    if body.get("healthy").and_then(Value::as_bool) != Some(true) {
        return Err(ServerboxError::HealthCheckFailed(format!(
            "{url}: body reports unhealthy"
        )));
    }
    Ok(body)
}

/// Poll until healthy or `timeout` elapses. A zero timeout fails before the
/// first attempt.
pub async fn wait_for_health(
    client: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
    preview_token: Option<&str>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = "no probe completed".to_string();

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(ServerboxError::HealthCheckFailed(format!(
                "timed out after {}ms: {last_error}",
                timeout.as_millis()
            )));
        }

        match fetch_health(client, base_url, username, password, preview_token).await {
            Ok(body) => return Ok(body),
            Err(e) => {
                tracing::debug!(error = %e, "health probe failed, retrying");
                last_error = e.to_string();
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_timeout_fails_before_probing() {
        let client = reqwest::Client::new();
        // Port 9 (discard) is never serving; a zero deadline must fail
        // without attempting the request anyway.
        let err = wait_for_health(
            &client,
            "http://127.0.0.1:9",
            "user",
            "pw",
            None,
            Duration::ZERO,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "HEALTH_CHECK_FAILED");
    }

    #[tokio::test]
    async fn unreachable_upstream_reports_last_error() {
        let client = reqwest::Client::new();
        let err = wait_for_health(
            &client,
            "http://127.0.0.1:9",
            "user",
            "pw",
            None,
            Duration::from_millis(120),
            Duration::from_millis(40),
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("timed out after"));
        assert!(message.contains("/global/health"));
    }
}
