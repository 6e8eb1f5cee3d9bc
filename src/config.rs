//! Configuration for the proxy process
//!
//! Everything comes from environment variables with secure defaults; there is
//! no config file and no CLI flags. Secrets are never serialized.

use std::env;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Result, ServerboxError};

/// Main proxy configuration, loaded from `SERVERBOX_*` / `DAYTONA_*` vars.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Admin API key, required.
    #[serde(skip_serializing)]
    pub admin_api_key: String,
    /// Proxy-route key. `None` means proxy auth is disabled. Defaults to the
    /// admin key when the variable is unset; an empty value disables it.
    #[serde(skip_serializing)]
    pub proxy_api_key: Option<String>,
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Whether proxy requests against a non-running instance trigger a resume.
    pub auto_resume: bool,
    /// Budget for one resume (coordinator join + underlying resume), ms.
    pub resume_timeout_ms: u64,
    /// Idle timeout applied to the upstream socket while forwarding, ms.
    pub request_timeout_ms: u64,
    /// Per-request debug logging on the router.
    pub request_logs: bool,
    /// Log level: one of debug|info|warn|error.
    pub log_level: String,
    /// Path of the embedded metadata store.
    pub db_path: PathBuf,
    /// Sandbox-provider connection settings.
    pub daytona: DaytonaConfig,
}

/// Daytona API connection settings.
#[derive(Debug, Clone, Serialize)]
pub struct DaytonaConfig {
    /// Required for live sandbox operations; its absence only fails at call
    /// time with `MISSING_DAYTONA_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_url: String,
    pub target: Option<String>,
}

impl Default for DaytonaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://app.daytona.io/api".to_string(),
            target: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let admin_api_key = env::var("SERVERBOX_ADMIN_API_KEY").map_err(|_| {
            ServerboxError::InvalidConfig("SERVERBOX_ADMIN_API_KEY is not set".to_string())
        })?;

        let proxy_api_key = match env::var("SERVERBOX_PROXY_API_KEY") {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => Some(admin_api_key.clone()),
        };

        let port = match env::var("SERVERBOX_PROXY_PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| {
                ServerboxError::InvalidConfig(format!(
                    "SERVERBOX_PROXY_PORT is not a valid port: {value}"
                ))
            })?,
            Err(_) => 7788,
        };

        let config = Self {
            admin_api_key,
            proxy_api_key,
            host: env::var("SERVERBOX_PROXY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            auto_resume: parse_bool_var("SERVERBOX_PROXY_AUTO_RESUME", true)?,
            resume_timeout_ms: parse_ms_var("SERVERBOX_PROXY_RESUME_TIMEOUT_MS", 60_000)?,
            request_timeout_ms: parse_ms_var("SERVERBOX_PROXY_REQUEST_TIMEOUT_MS", 60_000)?,
            request_logs: parse_bool_var("SERVERBOX_PROXY_REQUEST_LOGS", false)?,
            log_level: env::var("SERVERBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: env::var("SERVERBOX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./serverbox.db")),
            daytona: DaytonaConfig {
                api_key: env::var("DAYTONA_API_KEY").ok().filter(|k| !k.is_empty()),
                api_url: env::var("DAYTONA_API_URL")
                    .unwrap_or_else(|_| DaytonaConfig::default().api_url),
                target: env::var("DAYTONA_TARGET").ok().filter(|t| !t.is_empty()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate field values.
    pub fn validate(&self) -> Result<()> {
        if self.admin_api_key.is_empty() {
            return Err(ServerboxError::InvalidConfig(
                "SERVERBOX_ADMIN_API_KEY must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ServerboxError::InvalidConfig(
                "SERVERBOX_PROXY_PORT cannot be 0".to_string(),
            ));
        }
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ServerboxError::InvalidConfig(format!(
                "SERVERBOX_LOG_LEVEL must be one of: {}",
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }

    /// Externally-visible base URL used to build `proxyUrl` fields.
    ///
    /// A wildcard listen host is reported as loopback since `0.0.0.0` is not
    /// addressable by clients.
    pub fn proxy_base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }
}

fn parse_bool_var(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ServerboxError::InvalidConfig(format!(
                "{key} must be true or false, got: {other}"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn parse_ms_var(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value.parse::<u64>().map_err(|_| {
            ServerboxError::InvalidConfig(format!("{key} must be a millisecond count, got: {value}"))
        }),
        Err(_) => Ok(default),
    }
}
