//! Error taxonomy for the serverbox core
//!
//! Every failure surfaced by the lifecycle manager, resume coordinator,
//! provider adapter, or HTTP layer is one of these kinds. Low-level causes
//! are wrapped at the call site that classifies them; the original message
//! travels in the variant payload and is exposed through [`ServerboxError::details`].

use axum::http::StatusCode;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServerboxError>;

/// All error kinds the system can surface.
#[derive(Debug, Error)]
pub enum ServerboxError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No provider credentials supplied and no OPENCODE_ZEN_API_KEY or OPENCODE_API_KEY in the environment")]
    MissingAuth,

    #[error("DAYTONA_API_KEY is not set")]
    MissingDaytonaApiKey,

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance is not running: {0}")]
    InstanceNotRunning(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Terminal wrapper emitted only by `create`, after sandbox cleanup has
    /// been attempted.
    #[error("Instance create failed: {0}")]
    CreateFailed(#[source] Box<ServerboxError>),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Daytona API error: {0}")]
    DaytonaApi(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ServerboxError {
    /// Wire-level `code` string carried in JSON error responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServerboxError::InvalidConfig(_) => "INVALID_CONFIG",
            ServerboxError::MissingAuth => "MISSING_AUTH",
            ServerboxError::MissingDaytonaApiKey => "MISSING_DAYTONA_API_KEY",
            ServerboxError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            ServerboxError::InstanceNotRunning(_) => "INSTANCE_NOT_RUNNING",
            ServerboxError::SandboxNotFound(_) => "SANDBOX_NOT_FOUND",
            ServerboxError::CreateFailed(_) => "CREATE_FAILED",
            ServerboxError::BootstrapFailed(_) => "BOOTSTRAP_FAILED",
            ServerboxError::HealthCheckFailed(_) => "HEALTH_CHECK_FAILED",
            ServerboxError::DaytonaApi(_) => "DAYTONA_API_ERROR",
            ServerboxError::Store(_) => "STORE_ERROR",
            ServerboxError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
        }
    }

    /// HTTP status for JSON error responses.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ServerboxError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            ServerboxError::InstanceNotRunning(_) => StatusCode::CONFLICT,
            ServerboxError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The wrapped underlying cause, where one exists.
    pub fn details(&self) -> Option<String> {
        match self {
            ServerboxError::CreateFailed(source) => Some(source.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(ServerboxError::MissingAuth.code(), "MISSING_AUTH");
        assert_eq!(
            ServerboxError::InstanceNotFound("a".into()).code(),
            "INSTANCE_NOT_FOUND"
        );
        assert_eq!(
            ServerboxError::CreateFailed(Box::new(ServerboxError::HealthCheckFailed(
                "timed out".into()
            )))
            .code(),
            "CREATE_FAILED"
        );
        assert_eq!(ServerboxError::Store("disk".into()).code(), "STORE_ERROR");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ServerboxError::InstanceNotFound("a".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerboxError::InstanceNotRunning("a".into()).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServerboxError::InvalidConfig("bad".into()).http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerboxError::DaytonaApi("500".into()).http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn create_failed_preserves_cause() {
        let err = ServerboxError::CreateFailed(Box::new(ServerboxError::BootstrapFailed(
            "install script exited 1".into(),
        )));
        let details = err.details().unwrap();
        assert!(details.contains("install script exited 1"));
    }
}
