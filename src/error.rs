//! Error types shared across the crate

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for crate operations
pub type FcResult<T> = Result<T, FileChunkError>;

/// Coarse error category attached to every error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unsupported or malformed caller input
    Input,
    /// Store is full even after cleanup
    #[serde(rename = "QUOTA")]
    QuotaExceeded,
    /// Local read/write failure
    Io,
    /// Transport timeout, disconnect, or 5xx
    Network,
    /// 4xx contract reject or merge left incomplete after retries
    Server,
    /// Background executor unavailable or crashed twice
    Worker,
    /// Operation aborted by the caller
    Cancelled,
    /// Persisted chunk set does not match its metadata
    Corrupt,
    /// Missing or failed module dependency
    Dependency,
    /// Bad configuration parameter
    Config,
    /// Host lacks a required capability
    EnvironmentUnsupported,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Input => "INPUT",
            ErrorCode::QuotaExceeded => "QUOTA",
            ErrorCode::Io => "IO",
            ErrorCode::Network => "NETWORK",
            ErrorCode::Server => "SERVER",
            ErrorCode::Worker => "WORKER",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Corrupt => "CORRUPT",
            ErrorCode::Dependency => "DEPENDENCY",
            ErrorCode::Config => "CONFIG",
            ErrorCode::EnvironmentUnsupported => "ENVIRONMENT_UNSUPPORTED",
        }
    }
}

/// Crate-wide error envelope
#[derive(Debug, Error)]
#[error("{} ({}): {message}", code.as_str(), if *retryable { "retryable" } else { "fatal" })]
pub struct FileChunkError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl FileChunkError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = matches!(code, ErrorCode::Network | ErrorCode::Io);
        Self {
            code,
            message: message.into(),
            retryable,
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Input, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QuotaExceeded, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Server, message)
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Worker, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Corrupt, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Dependency, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EnvironmentUnsupported, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    /// Serializable `{code, message, retryable}` envelope handed to callbacks
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

/// The caller-facing error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<std::io::Error> for FileChunkError {
    fn from(err: std::io::Error) -> Self {
        FileChunkError::io(err.to_string()).with_cause(err)
    }
}

impl From<reqwest::Error> for FileChunkError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        FileChunkError::network(message).with_cause(err)
    }
}

impl From<serde_json::Error> for FileChunkError {
    fn from(err: serde_json::Error) -> Self {
        FileChunkError::new(ErrorCode::Input, err.to_string())
            .retryable(false)
            .with_cause(err)
    }
}
