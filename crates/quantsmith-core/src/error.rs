//! Error types for quantsmith.
//!
//! Pipeline stages mostly report failure through target outcomes rather than
//! errors; `QuantsmithError` is what crosses API boundaries (config loading,
//! tensor I/O, repository calls, renames).

use std::path::PathBuf;
use thiserror::Error;

use crate::config::PipelineDefaults;

/// Main error type for the quantsmith library.
#[derive(Debug, Error)]
pub enum QuantsmithError {
    // External tool errors
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("Command not found: {program}")]
    ToolNotFound { program: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Refusing to rename {from:?} to {to:?}: destination already exists")]
    NameCollision { from: PathBuf, to: PathBuf },

    // Input errors
    #[error("Invalid source model {path:?}: {message}")]
    InvalidSourceModel { path: PathBuf, message: String },

    #[error("Invalid tensor file {path:?}: {message}")]
    InvalidTensorFile { path: PathBuf, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Network / repository errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Repository error for {repo_id}: {message}")]
    Repository { repo_id: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for quantsmith operations.
pub type Result<T> = std::result::Result<T, QuantsmithError>;

impl From<std::io::Error> for QuantsmithError {
    fn from(err: std::io::Error) -> Self {
        QuantsmithError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for QuantsmithError {
    fn from(err: serde_json::Error) -> Self {
        QuantsmithError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for QuantsmithError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QuantsmithError::request_timeout()
        } else {
            QuantsmithError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl QuantsmithError {
    /// Create an IO error with a short description of what was being done.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        QuantsmithError::Io {
            message: format!("{context}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Timeout of a repository HTTP request, which always runs under the
    /// client-wide limit.
    pub fn request_timeout() -> Self {
        QuantsmithError::Timeout(PipelineDefaults::HTTP_TIMEOUT)
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        QuantsmithError::Config {
            message: message.into(),
        }
    }

    /// Whether this error is transient. Callers decide whether to retry;
    /// the pipeline itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuantsmithError::Network { .. } | QuantsmithError::Timeout(_)
        )
    }

    /// Whether this error came from a cooperative stop request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QuantsmithError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuantsmithError::ExternalTool {
            tool: "llama-quantize".into(),
            message: "exited with status: 1".into(),
        };
        assert_eq!(err.to_string(), "llama-quantize failed: exited with status: 1");
    }

    #[test]
    fn test_io_helper_keeps_path() {
        let err = QuantsmithError::io(
            "opening source",
            "/models/a.safetensors",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        match err {
            QuantsmithError::Io { path, message, .. } => {
                assert_eq!(path, Some(PathBuf::from("/models/a.safetensors")));
                assert!(message.starts_with("opening source"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_timeout_reports_client_limit() {
        let err = QuantsmithError::request_timeout();
        match &err {
            QuantsmithError::Timeout(after) => assert_eq!(*after, PipelineDefaults::HTTP_TIMEOUT),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Request timeout after 30s");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(QuantsmithError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!QuantsmithError::Cancelled.is_retryable());
        assert!(QuantsmithError::Cancelled.is_cancelled());
    }
}
