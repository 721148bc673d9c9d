use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("elevation unavailable: {0}")]
    ElevationUnavailable(String),
    #[error("elevated session timed out after {}ms", .0.as_millis())]
    SessionTimeout(Duration),
    #[error("elevated session failed: {0}")]
    SessionFailed(String),
    #[error("embedded service error: {0}")]
    EmbeddedService(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("worker error: {0}")]
    Worker(String),
}

impl TetherError {
    /// Stable machine-readable code used in JSON error envelopes and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ElevationUnavailable(_) => "elevation_unavailable",
            Self::SessionTimeout(_) => "session_timeout",
            Self::SessionFailed(_) => "session_failed",
            Self::EmbeddedService(_) => "embedded_service_error",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
            Self::Worker(_) => "worker",
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
