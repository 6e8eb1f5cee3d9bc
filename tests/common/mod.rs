//! Shared test fixtures: a counting mock provider, an echoing upstream
//! server, and a fully wired serverbox app on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use serverbox::api::{build_router, AppState};
use serverbox::config::{Config, DaytonaConfig};
use serverbox::daytona::{
    ExecOptions, ExecResult, PreviewLink, Sandbox, SandboxProvider, SandboxSpec, SandboxState,
};
use serverbox::error::{Result, ServerboxError};
use serverbox::manager::{InstanceManager, ManagerConfig};
use serverbox::resume::ResumeCoordinator;
use serverbox::store::SqliteInstanceStore;

pub const ADMIN_KEY: &str = "test-admin-key";
pub const PROXY_KEY: &str = "test-proxy-key";
pub const PREVIEW_TOKEN: &str = "tok";

/// In-memory provider that counts calls and simulates sandbox state.
pub struct MockProvider {
    sandboxes: Mutex<HashMap<String, SandboxState>>,
    preview_url: Mutex<String>,
    preview_token: Option<String>,
    start_delay: Duration,
    fail_create_times: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub exec_commands: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(preview_url: &str) -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            preview_url: Mutex::new(preview_url.to_string()),
            preview_token: Some(PREVIEW_TOKEN.to_string()),
            start_delay: Duration::ZERO,
            fail_create_times: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            exec_commands: Mutex::new(Vec::new()),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_preview_url(&self, url: &str) {
        *self.preview_url.lock().unwrap() = url.to_string();
    }

    /// Make the next `n` create_sandbox calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_create_times.store(n, Ordering::SeqCst);
    }

    fn set_state(&self, sandbox_id: &str, state: SandboxState) -> Result<()> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        match sandboxes.get_mut(sandbox_id) {
            Some(slot) => {
                *slot = state;
                Ok(())
            }
            None => Err(ServerboxError::SandboxNotFound(sandbox_id.to_string())),
        }
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_create_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_create_times.store(remaining - 1, Ordering::SeqCst);
            return Err(ServerboxError::DaytonaApi(
                "simulated create failure".to_string(),
            ));
        }
        let id = format!("sbx-{}", spec.id);
        self.sandboxes
            .lock()
            .unwrap()
            .insert(id.clone(), SandboxState::Running);
        Ok(Sandbox {
            id,
            state: SandboxState::Running,
        })
    }

    async fn find_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(sandbox_id)
            .map(|state| Sandbox {
                id: sandbox_id.to_string(),
                state: *state,
            })
            .ok_or_else(|| ServerboxError::SandboxNotFound(sandbox_id.to_string()))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state)| Sandbox {
                id: id.clone(),
                state: *state,
            })
            .collect())
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        match self.sandboxes.lock().unwrap().remove(sandbox_id) {
            Some(_) => Ok(()),
            None => Err(ServerboxError::SandboxNotFound(sandbox_id.to_string())),
        }
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> Result<()> {
        tokio::time::sleep(self.start_delay).await;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(sandbox_id, SandboxState::Running)
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.set_state(sandbox_id, SandboxState::Stopped)
    }

    async fn archive_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.set_state(sandbox_id, SandboxState::Archived)
    }

    async fn preview_link(&self, _sandbox_id: &str, _port: u16) -> Result<PreviewLink> {
        Ok(PreviewLink {
            url: self.preview_url.lock().unwrap().clone(),
            token: self.preview_token.clone(),
        })
    }

    async fn exec(
        &self,
        _sandbox_id: &str,
        command: &str,
        _opts: &ExecOptions,
    ) -> Result<ExecResult> {
        self.exec_commands.lock().unwrap().push(command.to_string());
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn upload_file(&self, _sandbox_id: &str, _path: &str, _contents: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn download_file(&self, _sandbox_id: &str, _path: &str) -> Result<Vec<u8>> {
        Ok(b"mock-file".to_vec())
    }
}

/// A running upstream test server: health endpoint plus a request echo.
pub struct Upstream {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl Upstream {
    /// Kill the upstream so forwarding hits a closed port.
    pub fn shut_down(&self) {
        self.handle.abort();
    }
}

async fn echo(request: Request) -> Json<Value> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let mut headers = serde_json::Map::new();
    for (name, value) in request.headers() {
        headers.insert(
            name.to_string(),
            Value::String(value.to_str().unwrap_or("").to_string()),
        );
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    Json(json!({
        "method": method,
        "path": path,
        "query": query,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

pub async fn spawn_upstream() -> Upstream {
    let app = Router::new()
        .route("/global/health", get(|| async { Json(json!({ "healthy": true })) }))
        .fallback(echo);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream {
        base_url: format!("http://{addr}"),
        handle,
    }
}

/// A fully wired serverbox app listening on an ephemeral port.
pub struct TestApp {
    pub base_url: String,
    pub provider: Arc<MockProvider>,
    pub upstream: Upstream,
    pub client: reqwest::Client,
    handle: JoinHandle<()>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Create an instance through the admin API and return its view.
    pub async fn create_instance(&self, id: &str) -> Value {
        let response = self
            .client
            .post(self.url("/admin/instances"))
            .header("x-serverbox-admin-key", ADMIN_KEY)
            .json(&json!({
                "id": id,
                "auth": { "provider": "opencode", "apiKey": "zen-key" },
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201, "create failed");
        response.json::<Value>().await.unwrap()["instance"].clone()
    }

    pub async fn admin_post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("x-serverbox-admin-key", ADMIN_KEY)
            .send()
            .await
            .unwrap()
    }

    pub async fn admin_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-serverbox-admin-key", ADMIN_KEY)
            .send()
            .await
            .unwrap()
    }
}

pub struct AppOptions {
    pub auto_resume: bool,
    pub start_delay: Duration,
    pub resume_timeout_ms: u64,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            auto_resume: true,
            start_delay: Duration::ZERO,
            resume_timeout_ms: 5_000,
        }
    }
}

pub async fn spawn_app(options: AppOptions) -> TestApp {
    let upstream = spawn_upstream().await;
    let provider = Arc::new(MockProvider::new(&upstream.base_url).with_start_delay(options.start_delay));

    let store = Arc::new(SqliteInstanceStore::open_in_memory().unwrap());
    let manager_config = ManagerConfig {
        default_timeout: Duration::from_secs(5),
        health_poll_interval: Duration::from_millis(50),
        ..ManagerConfig::default()
    };
    let manager = Arc::new(InstanceManager::new(
        store,
        provider.clone(),
        manager_config,
    ));
    let coordinator = Arc::new(ResumeCoordinator::new(
        manager.clone(),
        options.auto_resume,
        Duration::from_millis(options.resume_timeout_ms),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = Arc::new(Config {
        admin_api_key: ADMIN_KEY.to_string(),
        proxy_api_key: Some(PROXY_KEY.to_string()),
        host: "127.0.0.1".to_string(),
        port,
        auto_resume: options.auto_resume,
        resume_timeout_ms: options.resume_timeout_ms,
        request_timeout_ms: 5_000,
        request_logs: false,
        log_level: "info".to_string(),
        db_path: PathBuf::from(":memory:"),
        daytona: DaytonaConfig::default(),
    });

    let state = AppState::new(manager, coordinator, config).unwrap();
    let app = build_router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestApp {
        base_url: format!("http://127.0.0.1:{port}"),
        provider,
        upstream,
        client: reqwest::Client::new(),
        handle,
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.handle.abort();
        self.upstream.shut_down();
    }
}
