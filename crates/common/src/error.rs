//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every stage of the
//! deployment pipeline. Each variant carries enough context (repository,
//! file, quantization tag or log excerpt) to act on without digging into
//! internals.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for nim-deploy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for nim-deploy operations
#[derive(Error, Debug)]
pub enum Error {
    /// The registry rejected the credential
    #[error("Authentication failed for {repo}: {message}")]
    Auth { repo: String, message: String },

    /// Repository, file or local model does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network blip or server-side hiccup, safe to retry
    #[error("Transient error during {context}: {message}")]
    Transient { context: String, message: String },

    /// No weight file matches the requested quantization tag
    #[error(
        "No weight files in {repo} match quantization '{tag}' (available: {})",
        display_tags(.available)
    )]
    NoMatchingQuantization {
        repo: String,
        tag: String,
        available: Vec<String>,
    },

    /// Permission, space or other local filesystem failure
    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The container exited during its startup grace period
    #[error(
        "Container {container} exited during startup ({}); last log lines:\n{}",
        display_exit(.exit_code),
        .logs.join("\n")
    )]
    ContainerCrash {
        container: String,
        exit_code: Option<i64>,
        logs: Vec<String>,
    },

    /// The container stopped running while the readiness probe was waiting
    #[error(
        "Container {container} stopped while waiting for readiness ({}); last log lines:\n{}",
        display_exit(.exit_code),
        .logs.join("\n")
    )]
    ContainerDied {
        container: String,
        exit_code: Option<i64>,
        logs: Vec<String>,
    },

    /// The inference server never reported ready
    #[error(
        "{url} did not report ready within {:?}; check the logs of container {container}",
        .timeout
    )]
    ProbeTimeout {
        url: String,
        container: String,
        timeout: Duration,
    },

    /// The operation was cancelled by the user
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// External service error (registry or container runtime)
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        "none".to_string()
    } else {
        tags.join(", ")
    }
}

fn display_exit(code: &Option<i64>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "exit code unknown".to_string(),
    }
}

impl Error {
    /// Wraps an I/O error with the path it occurred on
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Builds a transient error for a named operation
    pub fn transient(context: impl Into<String>, message: impl ToString) -> Self {
        Error::Transient {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if the operation may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Returns true if the error is an authentication error
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if the error is a user cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Returns true if the error belongs to the model resolution stage
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Error::Auth { .. }
                | Error::NotFound(_)
                | Error::Transient { .. }
                | Error::NoMatchingQuantization { .. }
                | Error::Filesystem { .. }
        )
    }
}
