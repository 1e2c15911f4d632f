//! Error types for jailrun

use std::time::Duration;

use thiserror::Error;

use crate::sandbox::AttemptFailure;

/// Result type alias using jailrun's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a submission is rejected before anything is spawned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Empty or whitespace-only source
    #[error("Script must be a non-empty string")]
    Empty,

    /// Source larger than the configured ceiling
    #[error("Script too large: {size} bytes (max {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    /// No top-level `def main():`
    #[error("Script must contain a main() function taking no arguments")]
    MissingEntryPoint,
}

/// Main error type for jailrun
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Submission rejected by the validator
    #[error("Invalid script: {0}")]
    Validation(#[from] ValidationError),

    /// The isolation mechanism could not be started under a profile
    #[error("Sandbox could not be started: {0}")]
    SpawnFailed(String),

    /// Wall-clock deadline elapsed; the process tree was killed
    #[error("Script execution timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    /// Killed by an in-sandbox ceiling (CPU time, wall clock) before reporting
    #[error("Script exceeded its resource limits: {0}")]
    ResourceExhausted(String),

    /// Output did not follow the result/error sentinel contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Every isolation profile failed
    #[error("All isolation profiles failed: {}", format_failures(.0))]
    Exhausted(Vec<AttemptFailure>),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Check if error is a client error (user's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if the orchestrator may try the next profile after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SpawnFailed(_) | Error::Protocol(_))
    }

    /// Stable, machine-readable tag for this error class
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::SpawnFailed(_) => "spawn_failed",
            Error::TimedOut(_) => "timed_out",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Protocol(_) => "protocol",
            Error::Exhausted(_) => "sandbox_unavailable",
            Error::Json(_) | Error::Io(_) | Error::Internal(_) => "internal",
        }
    }
}
