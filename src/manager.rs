//! Instance lifecycle manager
//!
//! Owns the instance state machine and is the sole writer to the metadata
//! store. Every public operation returns the post-transition record (already
//! flushed) or a typed error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use uuid::Uuid;

use crate::auth::{build_auth_record, collect_provider_env, normalize_provider_auth};
use crate::bootstrap::{bootstrap, BootstrapConfig, UPSTREAM_PORT};
use crate::daytona::{ExecOptions, ExecResult, Sandbox, SandboxProvider, SandboxSpec, SandboxState};
use crate::error::{Result, ServerboxError};
use crate::health::{fetch_health, wait_for_health};
use crate::store::InstanceStore;
use crate::types::{CreateOptions, FileBody, InstanceRecord, InstanceState};

const CREATE_MAX_RETRIES: u32 = 3;
const CREATE_BACKOFF_BASE: Duration = Duration::from_millis(500);
const CREATE_BACKOFF_CAP: Duration = Duration::from_secs(5);
const CREATE_BACKOFF_JITTER_MS: u64 = 150;

/// Tunables for the manager; defaults match production behavior.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_username: String,
    pub password_length: usize,
    /// Default budget for bootstrap + health wait on create/resume.
    pub default_timeout: Duration,
    pub health_poll_interval: Duration,
    pub sandbox_language: String,
    pub auto_stop_minutes: u32,
    pub auto_archive_minutes: u32,
    pub auto_delete_minutes: Option<i64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_username: "opencode".to_string(),
            password_length: 32,
            default_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(2),
            sandbox_language: "typescript".to_string(),
            auto_stop_minutes: 15,
            auto_archive_minutes: 7 * 24 * 60,
            auto_delete_minutes: None,
        }
    }
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<InstanceState>,
    pub labels: Option<HashMap<String, String>>,
    /// Reconcile each record with the provider before filtering.
    pub refresh: bool,
}

pub struct InstanceManager {
    store: Arc<dyn InstanceStore>,
    provider: Arc<dyn SandboxProvider>,
    http: reqwest::Client,
    config: ManagerConfig,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        provider: Arc<dyn SandboxProvider>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Provision a sandbox, bootstrap the upstream server, wait for health,
    /// and persist the record as `running`.
    ///
    /// On any failure after the sandbox exists, removal is attempted
    /// best-effort and the original cause is raised wrapped in
    /// `CREATE_FAILED`.
    pub async fn create(&self, opts: CreateOptions) -> Result<InstanceRecord> {
        let id = match opts.id.clone() {
            Some(id) => {
                if self.store.get(&id).await?.is_some() {
                    return Err(ServerboxError::InvalidConfig(format!(
                        "instance id already exists: {id}"
                    )));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let env: HashMap<String, String> = std::env::vars().collect();
        let auth = normalize_provider_auth(opts.auth.clone().map(|a| a.into_vec()), &env)?;
        let providers: Vec<String> = auth.iter().map(|entry| entry.provider.clone()).collect();
        let auth_record = build_auth_record(&auth);
        let provider_env = collect_provider_env(&auth);

        let username = opts
            .username
            .clone()
            .unwrap_or_else(|| self.config.default_username.clone());
        let password = generate_password(self.config.password_length);
        let labels = opts.labels.clone().unwrap_or_default();
        let timeout = opts
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let mut env_vars = provider_env.clone();
        env_vars.insert(
            crate::bootstrap::SERVER_USERNAME_VAR.to_string(),
            username.clone(),
        );
        env_vars.insert(
            crate::bootstrap::SERVER_PASSWORD_VAR.to_string(),
            password.clone(),
        );

        let lifecycle = opts.lifecycle.clone().unwrap_or_default();
        let spec = SandboxSpec {
            id: id.clone(),
            language: self.config.sandbox_language.clone(),
            labels: labels.clone(),
            auto_stop_minutes: Some(
                lifecycle
                    .auto_stop_minutes
                    .unwrap_or(self.config.auto_stop_minutes),
            ),
            auto_archive_minutes: Some(
                lifecycle
                    .auto_archive_minutes
                    .unwrap_or(self.config.auto_archive_minutes),
            ),
            auto_delete_minutes: lifecycle
                .auto_delete_minutes
                .or(self.config.auto_delete_minutes),
            resources: opts.resources.clone(),
            env_vars,
        };

        let sandbox = self.create_sandbox_with_retry(&spec).await?;
        tracing::info!(instance_id = %id, sandbox_id = %sandbox.id, "sandbox created");

        let bootstrap_config = BootstrapConfig {
            username: username.clone(),
            password: password.clone(),
            provider_env,
            auth_record,
            upstream_config: opts.upstream_config.clone(),
            install_upstream: true,
        };

        match self
            .finish_create(
                &id,
                &sandbox,
                &username,
                &password,
                providers,
                labels,
                &bootstrap_config,
                timeout,
            )
            .await
        {
            Ok(record) => Ok(record),
            Err(cause) => {
                tracing::warn!(instance_id = %id, error = %cause, "create failed, removing sandbox");
                if let Err(cleanup) = self.provider.remove_sandbox(&sandbox.id).await {
                    tracing::warn!(
                        sandbox_id = %sandbox.id,
                        error = %cleanup,
                        "sandbox cleanup after failed create also failed"
                    );
                }
                Err(ServerboxError::CreateFailed(Box::new(cause)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_create(
        &self,
        id: &str,
        sandbox: &Sandbox,
        username: &str,
        password: &str,
        providers: Vec<String>,
        labels: HashMap<String, String>,
        bootstrap_config: &BootstrapConfig,
        timeout: Duration,
    ) -> Result<InstanceRecord> {
        bootstrap(self.provider.as_ref(), &sandbox.id, bootstrap_config).await?;

        let link = self.provider.preview_link(&sandbox.id, UPSTREAM_PORT).await?;
        wait_for_health(
            &self.http,
            &link.url,
            username,
            password,
            link.token.as_deref(),
            timeout,
            self.config.health_poll_interval,
        )
        .await?;

        let now = Utc::now();
        let record = InstanceRecord {
            id: id.to_string(),
            sandbox_id: sandbox.id.clone(),
            state: InstanceState::Running,
            url: Some(link.url),
            preview_token: link.token,
            username: username.to_string(),
            password: password.to_string(),
            providers,
            labels,
            created_at: now,
            updated_at: now,
        };
        self.store.set(&record).await?;
        Ok(record)
    }

    /// One initial attempt plus up to [`CREATE_MAX_RETRIES`] retries.
    async fn create_sandbox_with_retry(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        let mut backoff = CREATE_BACKOFF_BASE;
        let mut retries = 0;
        loop {
            match self.provider.create_sandbox(spec).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(e) if retries < CREATE_MAX_RETRIES => {
                    let jitter = Duration::from_millis(
                        rand::thread_rng().next_u64() % (CREATE_BACKOFF_JITTER_MS + 1),
                    );
                    tracing::warn!(
                        attempt = retries + 1,
                        error = %e,
                        delay_ms = (backoff + jitter).as_millis() as u64,
                        "create_sandbox failed, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(CREATE_BACKOFF_CAP);
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load a record and reconcile it with the provider's observed state.
    pub async fn get(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.require(id).await?;
        self.sync_metadata(record).await
    }

    /// List records, optionally reconciling each with the provider first.
    /// Failed reconciliations fall back to the stored record.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<InstanceRecord>> {
        let records = self.store.list().await?;

        let records = if filter.refresh {
            let refreshed = futures::future::join_all(records.into_iter().map(|record| {
                let stored = record.clone();
                async move {
                    match self.sync_metadata(record).await {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            tracing::debug!(
                                instance_id = %stored.id,
                                error = %e,
                                "refresh failed, using stored record"
                            );
                            stored
                        }
                    }
                }
            }))
            .await;
            refreshed
        } else {
            records
        };

        Ok(records
            .into_iter()
            .filter(|record| {
                if let Some(state) = filter.state {
                    if record.state != state {
                        return false;
                    }
                }
                if let Some(labels) = &filter.labels {
                    for (key, value) in labels {
                        if record.labels.get(key) != Some(value) {
                            return false;
                        }
                    }
                }
                true
            })
            .collect())
    }

    /// Stop the backing sandbox and persist `stopped`.
    pub async fn stop(&self, id: &str) -> Result<InstanceRecord> {
        let mut record = self.require(id).await?;
        self.provider.stop_sandbox(&record.sandbox_id).await?;

        record.state = InstanceState::Stopped;
        record.url = None;
        record.preview_token = None;
        record.updated_at = Utc::now();
        self.store.set(&record).await?;
        tracing::info!(instance_id = %id, "instance stopped");
        Ok(record)
    }

    /// Start the backing sandbox, relaunch the upstream server, wait for
    /// health, and persist `running`.
    pub async fn resume(&self, id: &str, timeout: Option<Duration>) -> Result<InstanceRecord> {
        let mut record = self.require(id).await?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);

        self.provider.start_sandbox(&record.sandbox_id).await?;

        let bootstrap_config = BootstrapConfig {
            username: record.username.clone(),
            password: record.password.clone(),
            // Provider env and the auth record were baked into the sandbox at
            // create time; the resume path only relaunches the server.
            provider_env: HashMap::new(),
            auth_record: HashMap::new(),
            upstream_config: None,
            install_upstream: false,
        };
        bootstrap(self.provider.as_ref(), &record.sandbox_id, &bootstrap_config).await?;

        let link = self
            .provider
            .preview_link(&record.sandbox_id, UPSTREAM_PORT)
            .await?;
        wait_for_health(
            &self.http,
            &link.url,
            &record.username,
            &record.password,
            link.token.as_deref(),
            timeout,
            self.config.health_poll_interval,
        )
        .await?;

        record.state = InstanceState::Running;
        record.url = Some(link.url);
        record.preview_token = link.token;
        record.updated_at = Utc::now();
        self.store.set(&record).await?;
        tracing::info!(instance_id = %id, "instance resumed");
        Ok(record)
    }

    /// Archive the backing sandbox and persist `archived`.
    pub async fn archive(&self, id: &str) -> Result<InstanceRecord> {
        let mut record = self.require(id).await?;
        self.provider.archive_sandbox(&record.sandbox_id).await?;

        record.state = InstanceState::Archived;
        record.url = None;
        record.preview_token = None;
        record.updated_at = Utc::now();
        self.store.set(&record).await?;
        tracing::info!(instance_id = %id, "instance archived");
        Ok(record)
    }

    /// Remove the backing sandbox (treating not-found as success) and delete
    /// the record. A no-op on unknown ids.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(());
        };

        match self.provider.remove_sandbox(&record.sandbox_id).await {
            Ok(()) => {}
            Err(ServerboxError::SandboxNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.store.delete(id).await?;
        tracing::info!(instance_id = %id, "instance destroyed");
        Ok(())
    }

    /// Fetch the upstream health JSON for a running instance.
    pub async fn health(&self, id: &str) -> Result<serde_json::Value> {
        let record = self.require_running(id).await?;
        let Some(url) = record.url.as_deref() else {
            return Err(ServerboxError::InstanceNotRunning(id.to_string()));
        };
        fetch_health(
            &self.http,
            url,
            &record.username,
            &record.password,
            record.preview_token.as_deref(),
        )
        .await
    }

    /// Execute a shell command inside a running instance's sandbox.
    pub async fn exec(&self, id: &str, command: &str, opts: &ExecOptions) -> Result<ExecResult> {
        let record = self.require_running(id).await?;
        self.provider.exec(&record.sandbox_id, command, opts).await
    }

    /// Upload a file into a running instance's sandbox.
    pub async fn upload_file(&self, id: &str, path: &str, body: FileBody) -> Result<()> {
        let record = self.require_running(id).await?;
        self.provider
            .upload_file(&record.sandbox_id, path, &body.into_bytes())
            .await
    }

    /// Download a file from a running instance's sandbox as raw bytes.
    pub async fn download_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let record = self.require_running(id).await?;
        self.provider.download_file(&record.sandbox_id, path).await
    }

    /// Reconcile a stored record with the provider's observed state, writing
    /// back only when the projection differs.
    pub async fn sync_metadata(&self, record: InstanceRecord) -> Result<InstanceRecord> {
        let sandbox = match self.provider.find_sandbox(&record.sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(ServerboxError::SandboxNotFound(_)) => {
                let mut projected = record.clone();
                projected.state = InstanceState::Destroyed;
                projected.url = None;
                projected.preview_token = None;
                if projected.state != record.state
                    || projected.url != record.url
                    || projected.preview_token != record.preview_token
                {
                    projected.updated_at = Utc::now();
                    self.store.set(&projected).await?;
                }
                return Ok(projected);
            }
            Err(e) => return Err(e),
        };

        let mut projected = record.clone();
        projected.state = instance_state_from(sandbox.state);
        if projected.state == InstanceState::Running {
            let link = self
                .provider
                .preview_link(&record.sandbox_id, UPSTREAM_PORT)
                .await?;
            projected.url = Some(link.url);
            projected.preview_token = link.token;
        } else {
            projected.url = None;
            projected.preview_token = None;
        }

        if projected.state != record.state
            || projected.url != record.url
            || projected.preview_token != record.preview_token
        {
            projected.updated_at = Utc::now();
            self.store.set(&projected).await?;
        }
        Ok(projected)
    }

    async fn require(&self, id: &str) -> Result<InstanceRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServerboxError::InstanceNotFound(id.to_string()))
    }

    async fn require_running(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.get(id).await?;
        if record.state != InstanceState::Running || record.url.is_none() {
            return Err(ServerboxError::InstanceNotRunning(id.to_string()));
        }
        Ok(record)
    }
}

fn instance_state_from(state: SandboxState) -> InstanceState {
    match state {
        SandboxState::Provisioning => InstanceState::Provisioning,
        SandboxState::Running => InstanceState::Running,
        SandboxState::Stopped => InstanceState::Stopped,
        SandboxState::Archived => InstanceState::Archived,
        SandboxState::Destroyed => InstanceState::Destroyed,
        SandboxState::Error => InstanceState::Error,
    }
}

/// 32 chars of URL-safe base64 from OS randomness, truncated to length.
fn generate_password(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
    encoded.truncate(length);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_has_requested_length_and_charset() {
        let password = generate_password(32);
        assert_eq!(password.len(), 32);
        assert!(password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn passwords_are_unique() {
        assert_ne!(generate_password(32), generate_password(32));
    }

    #[test]
    fn sandbox_state_projection() {
        assert_eq!(
            instance_state_from(SandboxState::Running),
            InstanceState::Running
        );
        assert_eq!(
            instance_state_from(SandboxState::Destroyed),
            InstanceState::Destroyed
        );
        assert_eq!(instance_state_from(SandboxState::Error), InstanceState::Error);
    }
}
