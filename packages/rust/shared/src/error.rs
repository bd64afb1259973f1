//! Error types for ContactForge.
//!
//! Library crates use [`ContactForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ContactForge operations.
#[derive(Debug, thiserror::Error)]
pub enum ContactForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a source or verification provider.
    #[error("network error: {0}")]
    Network(String),

    /// Provider payload or HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Job Record Store / Audit Log error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Job Queue transport error.
    #[error("queue error: {0}")]
    Queue(String),

    /// The job targets a region on the restriction list.
    #[error("compliance error: region '{region}' is restricted")]
    Compliance { region: String },

    /// The job was cancelled by an external actor.
    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: String },

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition conflicts with the record's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ContactForgeError>;

impl ContactForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a job failing with this error should go back through queue backoff.
    ///
    /// Compliance, cancellation and bad-input failures cannot change between
    /// attempts, so they end the job immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Compliance { .. }
                | Self::Cancelled { .. }
                | Self::Validation { .. }
                | Self::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ContactForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ContactForgeError::Compliance {
            region: "KP".into(),
        };
        assert!(err.to_string().contains("'KP' is restricted"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ContactForgeError::Storage("disk full".into()).is_retryable());
        assert!(ContactForgeError::Queue("connection reset".into()).is_retryable());
        assert!(ContactForgeError::Network("timeout".into()).is_retryable());
        assert!(!ContactForgeError::Compliance { region: "IR".into() }.is_retryable());
        assert!(!ContactForgeError::Cancelled { job_id: "j1".into() }.is_retryable());
        assert!(!ContactForgeError::validation("empty name").is_retryable());
    }
}
