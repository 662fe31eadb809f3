//! Top-level error types for relaybot.

use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Missing required environment is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Policy violations raised by the safety kernel.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("unauthorized user")]
    Unauthorized,

    #[error("rate limited, retry in {retry_after:.1?}")]
    RateLimited { retry_after: Duration },

    #[error("blocked command: {reason}")]
    BlockedCommand { reason: String },

    #[error("path outside allowed directories: {path}")]
    BlockedPath { path: String },
}

/// Agent process and protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("agent exited with code {code}")]
    Crashed { code: i32 },

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl AgentError {
    /// Crashes are retried once by the text handler; everything else surfaces.
    pub fn is_crash(&self) -> bool {
        matches!(self, AgentError::Crashed { .. })
    }
}

/// Chat transport failures, classified so callers can react to flood control.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("chat API rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("chat transport error: {0}")]
    Other(String),
}

/// Archive extraction violations. Any of these destroys the destination.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive contains unsafe path: {0}")]
    UnsafePath(String),

    #[error("archive contains non-regular-file entry: {0}")]
    SpecialEntry(String),

    #[error("archive exceeds limit: {0}")]
    LimitExceeded(String),

    #[error("unsupported archive type: {0}")]
    UnknownFormat(String),

    #[error("archive decode error: {0}")]
    Decode(String),
}

impl Error {
    /// True when the failure is our own cancellation rather than a real fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Agent(AgentError::Cancelled))
    }

    pub fn is_agent_crash(&self) -> bool {
        matches!(self, Error::Agent(e) if e.is_crash())
    }
}
