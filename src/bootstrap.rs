//! Upstream server bootstrap
//!
//! Installs and launches the `opencode` server inside a sandbox through the
//! provider's exec/upload capabilities. The resume path re-runs this with
//! `install_upstream = false`, which must be idempotent: it only tears down
//! and relaunches the serve process.

use std::collections::HashMap;

use serde_json::json;

use crate::daytona::{ExecOptions, SandboxProvider};
use crate::error::{Result, ServerboxError};

/// Port the upstream server listens on inside every sandbox.
pub const UPSTREAM_PORT: u16 = 4096;

/// Env vars the upstream server reads its Basic-auth credentials from.
pub const SERVER_USERNAME_VAR: &str = "OPENCODE_SERVER_USERNAME";
pub const SERVER_PASSWORD_VAR: &str = "OPENCODE_SERVER_PASSWORD";

const INSTALL_COMMAND: &str = "curl -fsSL https://opencode.ai/install | bash";
const AUTH_RECORD_PATH: &str = "/root/.local/share/opencode/auth.json";
const UPSTREAM_CONFIG_PATH: &str = "/root/.config/opencode/opencode.json";
const SERVE_LOG_PATH: &str = "/tmp/opencode-serve.log";

const INSTALL_TIMEOUT_MS: u64 = 180_000;
const EXEC_TIMEOUT_MS: u64 = 30_000;

/// Everything bootstrap needs to know about one instance.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub username: String,
    pub password: String,
    pub provider_env: HashMap<String, String>,
    pub auth_record: HashMap<String, String>,
    pub upstream_config: Option<serde_json::Value>,
    pub install_upstream: bool,
}

/// Install (optionally) and launch the upstream server inside `sandbox_id`.
pub async fn bootstrap(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    config: &BootstrapConfig,
) -> Result<()> {
    if config.install_upstream {
        run_checked(
            provider,
            sandbox_id,
            INSTALL_COMMAND,
            INSTALL_TIMEOUT_MS,
            "install upstream",
        )
        .await?;

        if !config.auth_record.is_empty() {
            write_auth_record(provider, sandbox_id, &config.auth_record).await?;
        }

        if let Some(upstream_config) = &config.upstream_config {
            write_config_file(provider, sandbox_id, upstream_config).await?;
        }
    }

    // Tear down any previous serve process, then launch fresh. The teardown
    // must not fail the bootstrap when nothing was running.
    run_checked(
        provider,
        sandbox_id,
        "pkill -f 'opencode serve' || true",
        EXEC_TIMEOUT_MS,
        "stop previous server",
    )
    .await?;

    let launch = launch_command(config);
    run_checked(provider, sandbox_id, &launch, EXEC_TIMEOUT_MS, "launch server").await?;

    tracing::debug!(sandbox_id, "upstream server launched");
    Ok(())
}

async fn write_auth_record(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    record: &HashMap<String, String>,
) -> Result<()> {
    let entries: serde_json::Map<String, serde_json::Value> = record
        .iter()
        .map(|(provider_name, key)| {
            (
                provider_name.clone(),
                json!({ "type": "api", "key": key }),
            )
        })
        .collect();
    let contents = serde_json::to_vec_pretty(&serde_json::Value::Object(entries))
        .map_err(|e| ServerboxError::BootstrapFailed(format!("serialize auth record: {e}")))?;

    let parent = AUTH_RECORD_PATH.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/");
    run_checked(
        provider,
        sandbox_id,
        &format!("mkdir -p {parent}"),
        EXEC_TIMEOUT_MS,
        "prepare auth directory",
    )
    .await?;

    provider
        .upload_file(sandbox_id, AUTH_RECORD_PATH, &contents)
        .await
        .map_err(|e| ServerboxError::BootstrapFailed(format!("write auth record: {e}")))
}

async fn write_config_file(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    config: &serde_json::Value,
) -> Result<()> {
    let contents = serde_json::to_vec_pretty(config)
        .map_err(|e| ServerboxError::BootstrapFailed(format!("serialize config: {e}")))?;

    let parent = UPSTREAM_CONFIG_PATH
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("/");
    run_checked(
        provider,
        sandbox_id,
        &format!("mkdir -p {parent}"),
        EXEC_TIMEOUT_MS,
        "prepare config directory",
    )
    .await?;

    provider
        .upload_file(sandbox_id, UPSTREAM_CONFIG_PATH, &contents)
        .await
        .map_err(|e| ServerboxError::BootstrapFailed(format!("write config file: {e}")))
}

/// Compose the serve launch line: exported credentials and provider env, the
/// server in the background, output captured to a log file.
fn launch_command(config: &BootstrapConfig) -> String {
    let mut exports: Vec<(String, String)> = config
        .provider_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    exports.sort();
    exports.push((SERVER_USERNAME_VAR.to_string(), config.username.clone()));
    exports.push((SERVER_PASSWORD_VAR.to_string(), config.password.clone()));

    let env_prefix: String = exports
        .iter()
        .map(|(key, value)| format!("{key}={} ", shell_quote(value)))
        .collect();

    format!(
        "nohup env {env_prefix}opencode serve --hostname 0.0.0.0 --port {UPSTREAM_PORT} \
         > {SERVE_LOG_PATH} 2>&1 &"
    )
}

async fn run_checked(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    command: &str,
    timeout_ms: u64,
    step: &str,
) -> Result<()> {
    let opts = ExecOptions {
        cwd: None,
        timeout_ms: Some(timeout_ms),
    };
    let result = provider
        .exec(sandbox_id, command, &opts)
        .await
        .map_err(|e| ServerboxError::BootstrapFailed(format!("{step}: {e}")))?;

    if result.exit_code != 0 {
        let detail = if result.stderr.is_empty() {
            result.stdout
        } else {
            result.stderr
        };
        return Err(ServerboxError::BootstrapFailed(format!(
            "{step} exited {}: {}",
            result.exit_code,
            detail.trim()
        )));
    }
    Ok(())
}

/// Single-quote a value for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
