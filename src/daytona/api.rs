//! Daytona REST API client
//!
//! Concrete [`SandboxProvider`] over the Daytona HTTP API. Every HTTP 404
//! maps to `SANDBOX_NOT_FOUND`; all other failures wrap into
//! `DAYTONA_API_ERROR` preserving the status and a body excerpt.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::DaytonaConfig;
use crate::error::{Result, ServerboxError};

use super::{
    normalize_state, ExecOptions, ExecResult, PreviewLink, Sandbox, SandboxProvider, SandboxSpec,
};

/// How much of an error body is kept in wrapped error messages.
const ERROR_BODY_EXCERPT: usize = 512;

pub struct DaytonaApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    target: Option<String>,
}

impl DaytonaApiClient {
    pub fn new(config: &DaytonaConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| ServerboxError::DaytonaApi(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            target: config.target.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let key = self
            .api_key
            .as_ref()
            .ok_or(ServerboxError::MissingDaytonaApiKey)?;
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(key))
    }

    /// Send a request, classifying failures. `context` names the sandbox (or
    /// operation) for error messages.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ServerboxError::DaytonaApi(format!("{context}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ServerboxError::SandboxNotFound(context.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
            return Err(ServerboxError::DaytonaApi(format!(
                "{context}: HTTP {status}: {excerpt}"
            )));
        }
        Ok(response)
    }

    async fn json_body(&self, response: reqwest::Response, context: &str) -> Result<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|e| ServerboxError::DaytonaApi(format!("{context}: invalid JSON: {e}")))
    }
}

/// Extract a sandbox from a response value, tolerating the id/state field
/// names the API has used across versions.
fn parse_sandbox(value: &Value) -> Result<Sandbox> {
    let id = value
        .get("id")
        .or_else(|| value.get("sandboxId"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ServerboxError::DaytonaApi("sandbox response is missing an id".to_string())
        })?;
    let state_raw = value
        .get("state")
        .or_else(|| value.get("status"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(Sandbox {
        id: id.to_string(),
        state: normalize_state(state_raw),
    })
}

#[async_trait]
impl SandboxProvider for DaytonaApiClient {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        let mut body = json!({
            "id": spec.id,
            "language": spec.language,
            "labels": spec.labels,
            "env": spec.env_vars,
        });
        if let Some(minutes) = spec.auto_stop_minutes {
            body["autoStopInterval"] = json!(minutes);
        }
        if let Some(minutes) = spec.auto_archive_minutes {
            body["autoArchiveInterval"] = json!(minutes);
        }
        if let Some(minutes) = spec.auto_delete_minutes {
            body["autoDeleteInterval"] = json!(minutes);
        }
        if let Some(resources) = &spec.resources {
            if let Some(cpu) = resources.cpu {
                body["cpu"] = json!(cpu);
            }
            if let Some(mem) = resources.mem {
                body["memory"] = json!(mem);
            }
            if let Some(disk) = resources.disk {
                body["disk"] = json!(disk);
            }
        }
        if let Some(target) = &self.target {
            body["target"] = json!(target);
        }

        let builder = self.request(reqwest::Method::POST, "/sandbox")?.json(&body);
        let response = self.send(builder, "create sandbox").await?;
        let value = self.json_body(response, "create sandbox").await?;
        parse_sandbox(&value)
    }

    async fn find_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let builder = self.request(reqwest::Method::GET, &format!("/sandbox/{sandbox_id}"))?;
        let response = self.send(builder, sandbox_id).await?;
        let value = self.json_body(response, sandbox_id).await?;
        parse_sandbox(&value)
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let builder = self.request(reqwest::Method::GET, "/sandbox")?;
        let response = self.send(builder, "list sandboxes").await?;
        let value = self.json_body(response, "list sandboxes").await?;

        // The API has returned both a raw array and an {items: [...]} wrapper.
        let items = value
            .as_array()
            .cloned()
            .or_else(|| value.get("items").and_then(Value::as_array).cloned())
            .ok_or_else(|| {
                ServerboxError::DaytonaApi("list response is neither array nor items".to_string())
            })?;

        items.iter().map(parse_sandbox).collect()
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let builder = self.request(reqwest::Method::DELETE, &format!("/sandbox/{sandbox_id}"))?;
        self.send(builder, sandbox_id).await?;
        Ok(())
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let builder =
            self.request(reqwest::Method::POST, &format!("/sandbox/{sandbox_id}/start"))?;
        self.send(builder, sandbox_id).await?;
        Ok(())
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let builder =
            self.request(reqwest::Method::POST, &format!("/sandbox/{sandbox_id}/stop"))?;
        self.send(builder, sandbox_id).await?;
        Ok(())
    }

    async fn archive_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let builder = self.request(
            reqwest::Method::POST,
            &format!("/sandbox/{sandbox_id}/archive"),
        )?;
        self.send(builder, sandbox_id).await?;
        Ok(())
    }

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink> {
        let builder = self.request(
            reqwest::Method::GET,
            &format!("/sandbox/{sandbox_id}/ports/{port}/preview-url"),
        )?;
        let response = self.send(builder, sandbox_id).await?;
        let value = self.json_body(response, sandbox_id).await?;

        // Either a bare URL string or {url, token}.
        match &value {
            Value::String(url) => Ok(PreviewLink {
                url: url.clone(),
                token: None,
            }),
            Value::Object(map) => {
                let url = map.get("url").and_then(Value::as_str).ok_or_else(|| {
                    ServerboxError::DaytonaApi(format!(
                        "{sandbox_id}: preview response is missing a url"
                    ))
                })?;
                Ok(PreviewLink {
                    url: url.to_string(),
                    token: map
                        .get("token")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            _ => Err(ServerboxError::DaytonaApi(format!(
                "{sandbox_id}: unexpected preview response shape"
            ))),
        }
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult> {
        let mut body = json!({ "command": command });
        if let Some(cwd) = &opts.cwd {
            body["cwd"] = json!(cwd);
        }
        if let Some(timeout_ms) = opts.timeout_ms {
            body["timeout"] = json!(timeout_ms / 1000);
        }

        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/toolbox/{sandbox_id}/process/execute"),
            )?
            .json(&body);
        let response = self.send(builder, sandbox_id).await?;
        let value = self.json_body(response, sandbox_id).await?;

        Ok(ExecResult {
            exit_code: value
                .get("exitCode")
                .or_else(|| value.get("code"))
                .and_then(Value::as_i64)
                .unwrap_or(-1) as i32,
            stdout: value
                .get("result")
                .or_else(|| value.get("stdout"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            stderr: value
                .get("stderr")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn upload_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/toolbox/{sandbox_id}/files/upload"),
            )?
            .query(&[("path", path)])
            .body(contents.to_vec());
        self.send(builder, sandbox_id).await?;
        Ok(())
    }

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let builder = self
            .request(
                reqwest::Method::GET,
                &format!("/toolbox/{sandbox_id}/files/download"),
            )?
            .query(&[("path", path)]);
        let response = self.send(builder, sandbox_id).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServerboxError::DaytonaApi(format!("{sandbox_id}: {e}")))?;
        Ok(bytes.to_vec())
    }
}
