//! Typed error taxonomy for the orchestration engine.

use thiserror::Error;

/// All errors the engine's public API can return.
///
/// Library code returns this directly; the CLI binary wraps it in
/// `anyhow::Result` at its own boundary to attach operator-facing context.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("dependency cycle detected among services: {names:?}")]
    CycleDetected { names: Vec<String> },

    #[error("service '{0}' depends on unknown service '{1}'")]
    UnknownDependency(String, String),

    #[error("no free port available in range {low}-{high}")]
    NoFreePort { low: u16, high: u16 },

    #[error("service '{name}' did not become healthy within {timeout_secs}s")]
    HealthTimeout { name: String, timeout_secs: u64 },

    #[error("service '{name}' process exited during startup (status: {status})")]
    ProcessExited { name: String, status: i32 },

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("policy denied start of service '{service_id}' for user '{user_id}': {reason}")]
    PolicyDenied {
        user_id: String,
        service_id: String,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
