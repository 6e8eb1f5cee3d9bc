//! Wire types for the HTTP API.

use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::error::ServerboxError;
use crate::types::InstanceRecord;

/// JSON error body: `{error, code?, details?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Translate a typed error into its HTTP representation.
pub fn error_response(error: &ServerboxError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error.http_status(),
        Json(ErrorResponse {
            error: error.to_string(),
            code: Some(error.code().to_string()),
            details: error.details(),
        }),
    )
}

/// A record as exposed over the wire: all record fields plus the stable
/// proxy URL.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub proxy_url: String,
}

impl InstanceView {
    pub fn new(record: InstanceRecord, proxy_base_url: &str) -> Self {
        let proxy_url = format!("{}/i/{}", proxy_base_url.trim_end_matches('/'), record.id);
        Self { record, proxy_url }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceEnvelope {
    pub instance: InstanceView,
}

#[derive(Debug, Serialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceView>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct DestroyResponse {
    pub ok: bool,
    pub id: String,
}

/// Query parameters accepted by the list route.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub refresh: Option<bool>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Body of `POST /admin/instances/{id}/exec`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;
    use std::collections::HashMap;

    #[test]
    fn instance_view_flattens_record_and_adds_proxy_url() {
        let record = InstanceRecord {
            id: "instance-1".into(),
            sandbox_id: "sbx-1".into(),
            state: InstanceState::Running,
            url: Some("https://preview.example".into()),
            preview_token: None,
            username: "opencode".into(),
            password: "pw".into(),
            providers: vec![],
            labels: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let view = InstanceView::new(record, "http://127.0.0.1:7788/");
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["proxyUrl"], "http://127.0.0.1:7788/i/instance-1");
        assert_eq!(value["sandboxId"], "sbx-1");
        assert_eq!(value["state"], "running");
    }

    #[test]
    fn error_response_carries_code_and_details() {
        let err = ServerboxError::CreateFailed(Box::new(ServerboxError::HealthCheckFailed(
            "timed out".into(),
        )));
        let (status, body) = error_response(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code.as_deref(), Some("CREATE_FAILED"));
        assert!(body.details.as_deref().unwrap().contains("timed out"));
    }
}
