//! Common execution types

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::Error;

/// Terminal value of a submission that ran to a protocol-conformant end
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    /// `main()` returned a JSON-encodable value
    Success { result: Value, stdout: String },
    /// The script failed on its own terms inside the sandbox
    RuntimeError {
        #[serde(rename = "error")]
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        stdout: String,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Incidental standard output
    pub fn stdout(&self) -> &str {
        match self {
            ExecutionOutcome::Success { stdout, .. } => stdout,
            ExecutionOutcome::RuntimeError { stdout, .. } => stdout,
        }
    }
}

/// Why one profile did not produce the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    /// Profile name
    pub profile: String,
    /// Error class (`spawn_failed`, `protocol`)
    pub kind: String,
    /// Human-readable reason
    pub reason: String,
}

impl AttemptFailure {
    pub fn new(profile: impl Into<String>, error: Error) -> Self {
        AttemptFailure {
            profile: profile.into(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }

    /// The mechanism never got to run the script
    pub fn is_spawn_failure(&self) -> bool {
        self.kind == "spawn_failed"
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.profile, self.reason)
    }
}

/// Result of a whole submission
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    /// Decoded outcome
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    /// Profile that produced the outcome
    pub profile: String,
    /// Profiles that failed before it, in catalog order
    pub failures: Vec<AttemptFailure>,
    /// Wall-clock time across all attempts
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Streams and exit status of a process that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,
    /// Stdout exceeded the capture cap and its middle was dropped
    pub truncated: bool,
}

impl CapturedOutput {
    /// Describe the kill if an in-sandbox ceiling ended the process
    ///
    /// Covers direct children killed by `SIGXCPU`/`SIGKILL` and nsjail's
    /// `128 + signal` exit encoding of the same.
    pub fn resource_kill(&self) -> Option<String> {
        let signal = self
            .signal
            .or_else(|| self.exit_code.filter(|c| *c > 128).map(|c| c - 128))?;
        match signal {
            libc::SIGXCPU => Some("CPU time limit exceeded (SIGXCPU)".to_string()),
            libc::SIGKILL => Some("killed by the sandbox (SIGKILL)".to_string()),
            _ => None,
        }
    }

    /// Last non-empty stderr line, for failure reasons
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Terminal state of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Process exited (any status) and both streams were drained
    Completed(CapturedOutput),
    /// Deadline elapsed; the process group was killed and output discarded
    TimedOut,
    /// The isolation mechanism could not run under this profile
    SpawnFailed(String),
}

/// One run of one profile against one wrapped program
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub deadline: Duration,
    pub elapsed: Duration,
    pub status: AttemptStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_serializes_like_the_http_contract() {
        let ok = ExecutionOutcome::Success {
            result: json!({"a": 1}),
            stdout: "hi\n".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"result": {"a": 1}, "stdout": "hi\n"})
        );

        let err = ExecutionOutcome::RuntimeError {
            message: "boom".to_string(),
            error_type: None,
            stdout: String::new(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"error": "boom", "stdout": ""})
        );
    }

    #[test]
    fn test_resource_kill_detection() {
        let direct = CapturedOutput {
            signal: Some(libc::SIGXCPU),
            ..Default::default()
        };
        assert!(direct.resource_kill().unwrap().contains("SIGXCPU"));

        let jailed = CapturedOutput {
            exit_code: Some(128 + libc::SIGKILL),
            ..Default::default()
        };
        assert!(jailed.resource_kill().is_some());

        let plain = CapturedOutput {
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(plain.resource_kill().is_none());
    }

    #[test]
    fn test_stderr_tail() {
        let out = CapturedOutput {
            stderr: "[I] starting\n[E] clone(): Operation not permitted\n\n".to_string(),
            ..Default::default()
        };
        assert_eq!(out.stderr_tail(), "[E] clone(): Operation not permitted");
    }
}
