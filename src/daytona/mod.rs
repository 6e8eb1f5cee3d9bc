//! Sandbox-provider adapter
//!
//! The rest of the system talks to Daytona through the [`SandboxProvider`]
//! trait: one canonical method set regardless of SDK dialect. The concrete
//! REST client lives in [`api`]; tests substitute their own implementations.

pub mod api;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ResourceSpec;

pub use api::DaytonaApiClient;

/// Provider-side sandbox state, normalized from the raw strings the API
/// reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopped,
    Archived,
    Destroyed,
    Error,
}

/// Normalize a raw provider state string.
pub fn normalize_state(raw: &str) -> SandboxState {
    match raw.to_ascii_lowercase().as_str() {
        "running" | "started" => SandboxState::Running,
        "stopped" => SandboxState::Stopped,
        "archived" => SandboxState::Archived,
        "destroyed" | "deleted" => SandboxState::Destroyed,
        "provisioning" | "creating" => SandboxState::Provisioning,
        _ => SandboxState::Error,
    }
}

/// A provider-managed sandbox as the core sees it.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub state: SandboxState,
}

/// Public URL (and optional bearer token) routing to a TCP port inside a
/// sandbox.
#[derive(Debug, Clone)]
pub struct PreviewLink {
    pub url: String,
    pub token: Option<String>,
}

/// Creation request for a new sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub id: String,
    pub language: String,
    pub labels: HashMap<String, String>,
    pub auto_stop_minutes: Option<u32>,
    pub auto_archive_minutes: Option<u32>,
    pub auto_delete_minutes: Option<i64>,
    pub resources: Option<ResourceSpec>,
    pub env_vars: HashMap<String, String>,
}

/// Options for shell execution inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Result of a shell execution.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Uniform capability set over the sandbox provider.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox>;

    /// Fails with `SANDBOX_NOT_FOUND` when the provider has no such sandbox.
    async fn find_sandbox(&self, sandbox_id: &str) -> Result<Sandbox>;

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>>;

    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn start_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn archive_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink>;

    async fn exec(&self, sandbox_id: &str, command: &str, opts: &ExecOptions)
        -> Result<ExecResult>;

    async fn upload_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_normalization_table() {
        assert_eq!(normalize_state("running"), SandboxState::Running);
        assert_eq!(normalize_state("started"), SandboxState::Running);
        assert_eq!(normalize_state("STARTED"), SandboxState::Running);
        assert_eq!(normalize_state("stopped"), SandboxState::Stopped);
        assert_eq!(normalize_state("archived"), SandboxState::Archived);
        assert_eq!(normalize_state("destroyed"), SandboxState::Destroyed);
        assert_eq!(normalize_state("deleted"), SandboxState::Destroyed);
        assert_eq!(normalize_state("provisioning"), SandboxState::Provisioning);
        assert_eq!(normalize_state("creating"), SandboxState::Provisioning);
        assert_eq!(normalize_state("pending_build"), SandboxState::Error);
        assert_eq!(normalize_state(""), SandboxState::Error);
    }
}
