//! Error types for the e2e utilities.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving the cluster under test
#[derive(Error, Debug, Clone)]
pub enum E2eError {
    // Command errors
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed {
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    // Manifest errors
    #[error("Failed to render template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("JSON path '{path}': {reason}")]
    JsonPath { path: String, reason: String },

    #[error("Failed to parse JSON: {reason}")]
    Json { reason: String },

    #[error("Failed to parse YAML: {reason}")]
    Yaml { reason: String },

    // Waiting and assertions
    #[error("Timed out after {timeout:?} waiting for {what}")]
    WaitTimeout { what: String, timeout: Duration },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Skipped: {0}")]
    Skipped(String),

    // Configuration errors
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Invalid kubeconfig '{path}': {reason}")]
    Kubeconfig { path: String, reason: String },

    #[error("IO error: {reason}")]
    Io { reason: String },
}

impl E2eError {
    /// Build an assertion failure from anything printable.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// True when a CLI call failed because the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => {
                stderr.contains("not found")
                    || stderr.contains("NotFound")
                    || stdout.contains("not found")
            }
            _ => false,
        }
    }

    /// Combined stdout and stderr of a failed command, or the display text.
    #[must_use]
    pub fn output(&self) -> String {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => {
                [stdout.trim(), stderr.trim()]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for E2eError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for E2eError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for E2eError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for e2e operations
pub type E2eResult<T> = Result<T, E2eError>;
