//! Core data model: instance records, lifecycle states, and create options.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance.
///
/// `Provisioning` and `Bootstrapping` are transient and never persisted: a
/// record first becomes observable as `Running`, or nothing is stored at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Bootstrapping,
    Running,
    Stopped,
    Archived,
    Error,
    Destroyed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Bootstrapping => "bootstrapping",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Archived => "archived",
            InstanceState::Error => "error",
            InstanceState::Destroyed => "destroyed",
        }
    }

    /// Parse a persisted state string. Unknown values degrade to `Error`
    /// rather than failing the read.
    pub fn parse(s: &str) -> InstanceState {
        match s {
            "provisioning" => InstanceState::Provisioning,
            "bootstrapping" => InstanceState::Bootstrapping,
            "running" => InstanceState::Running,
            "stopped" => InstanceState::Stopped,
            "archived" => InstanceState::Archived,
            "destroyed" => InstanceState::Destroyed,
            _ => InstanceState::Error,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable metadata for one instance. Keyed by `id`.
///
/// `id`, `sandbox_id`, `username`, and `password` are set once at create and
/// never rewritten. Every transition touching `state`, `url`, or
/// `preview_token` bumps `updated_at` and is flushed to the store before the
/// caller observes success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub sandbox_id: String,
    pub state: InstanceState,
    pub url: Option<String>,
    pub preview_token: Option<String>,
    pub username: String,
    pub password: String,
    pub providers: Vec<String>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One provider-credential entry supplied at create time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAuth {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Accepts either a single auth entry or a list of them in request bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthInput {
    One(ProviderAuth),
    Many(Vec<ProviderAuth>),
}

impl AuthInput {
    pub fn into_vec(self) -> Vec<ProviderAuth> {
        match self {
            AuthInput::One(entry) => vec![entry],
            AuthInput::Many(entries) => entries,
        }
    }
}

/// Requested compute resources for the backing sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u32>,
}

/// Idle-lifecycle intervals applied to the backing sandbox, in minutes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_stop_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_archive_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete_minutes: Option<i64>,
}

/// Options accepted by `InstanceManager::create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    /// Externally supplied instance id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthInput>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub lifecycle: Option<LifecycleSpec>,
    /// Configuration document written into the upstream server's config file
    /// at bootstrap, verbatim.
    #[serde(default)]
    pub upstream_config: Option<serde_json::Value>,
    /// Health-wait budget for this create, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body accepted by file-upload operations: raw bytes or UTF-8 text.
#[derive(Debug, Clone)]
pub enum FileBody {
    Bytes(Vec<u8>),
    Text(String),
}

impl FileBody {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileBody::Bytes(bytes) => bytes,
            FileBody::Text(text) => text.into_bytes(),
        }
    }
}
