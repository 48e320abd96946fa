//! Classified error types for the proxy-core layer and the stages

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle failures of one proxy-core process
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("proxy core binary not found: {0:?}")]
    BinaryNotFound(PathBuf),

    #[error("proxy core config not found: {0:?}")]
    ConfigNotFound(PathBuf),

    #[error("failed to spawn proxy core: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("proxy core exited during startup ({status}): {output}")]
    ExitedEarly { status: String, output: String },

    #[error("control API not ready after {0:?}")]
    ApiNotReady(Duration),

    #[error("proxy core is not running")]
    NotRunning,
}

/// Failures talking to the proxy-core control API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("control API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("control API request timed out")]
    Timeout,

    #[error("control API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected control API response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status<S: Into<String>>(status: u16, message: S) -> Self {
        ApiError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ApiError::Timeout => true,
            ApiError::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Stage-level failures that short-circuit a stage
#[derive(Error, Debug)]
pub enum StageFailure {
    #[error("rendered config has no usable entries")]
    EmptyConfig,

    #[error("proxy core failed to start: {0}")]
    StartFailed(String),

    #[error("control API never became ready")]
    ApiNotReady,

    #[error("proxy core listed no proxies")]
    NoProxies,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageFailure {
    /// Short machine-readable reason recorded in the run stats
    pub fn reason(&self) -> &'static str {
        match self {
            StageFailure::EmptyConfig => "empty_config",
            StageFailure::StartFailed(_) => "start_failed",
            StageFailure::ApiNotReady => "api_not_ready",
            StageFailure::NoProxies => "no_proxies",
            StageFailure::Io(_) => "io_error",
        }
    }
}

impl From<SupervisorError> for StageFailure {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::ApiNotReady(_) => StageFailure::ApiNotReady,
            other => StageFailure::StartFailed(other.to_string()),
        }
    }
}
