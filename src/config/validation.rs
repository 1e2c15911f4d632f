//! Configuration validation
//!
//! Validates configuration and reports issues.

use std::time::Duration;

use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// Turn errors into a single `Error::Config`
    pub fn into_result(self) -> crate::error::Result<Vec<ValidationIssue>> {
        if self.valid {
            return Ok(self.warnings);
        }
        let message = self
            .errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(crate::error::Error::Config(message))
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_limits(config, result);
    result = validate_timeouts(config, result);
    result = validate_fallback(config, result);

    result
}

fn validate_limits(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;

    if sandbox.max_script_bytes == 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.max_script_bytes",
            "Script size limit must be greater than zero",
        ));
    }

    if sandbox.limits.address_space_bytes == 0 || sandbox.limits.cpu_secs == 0 {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.limits",
                "Address-space and CPU ceilings are mandatory and must be non-zero",
            )
            .with_suggestion("Set sandbox.limits.address_space_bytes and sandbox.limits.cpu_secs"),
        );
    }

    result
}

fn validate_timeouts(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;
    let in_sandbox = Duration::from_secs(sandbox.time_limit_secs.max(sandbox.limits.cpu_secs));

    // The sandbox's own ceilings have to fire before the host-side deadline
    if sandbox.attempt_timeout <= in_sandbox {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.attempt_timeout",
                format!(
                    "Attempt timeout ({:?}) must be longer than the in-sandbox limit ({:?})",
                    sandbox.attempt_timeout, in_sandbox
                ),
            )
            .with_suggestion("Raise sandbox.attempt_timeout or lower sandbox.time_limit_secs"),
        );
    }

    if sandbox.submission_timeout < sandbox.attempt_timeout {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.submission_timeout",
                format!(
                    "Submission timeout ({:?}) must be at least the attempt timeout ({:?})",
                    sandbox.submission_timeout, sandbox.attempt_timeout
                ),
            )
            .with_suggestion("Raise sandbox.submission_timeout"),
        );
    }

    // The orchestrator has to give up before the HTTP layer does
    if config.server.request_timeout <= sandbox.submission_timeout {
        result = result.with_error(
            ValidationIssue::new(
                "server.request_timeout",
                format!(
                    "Request timeout ({:?}) must be longer than the submission timeout ({:?})",
                    config.server.request_timeout, sandbox.submission_timeout
                ),
            )
            .with_suggestion("Raise server.request_timeout"),
        );
    }

    result
}

fn validate_fallback(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.sandbox.allow_direct_fallback {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.allow_direct_fallback",
                "Direct fallback runs scripts without namespace isolation when nsjail is unusable",
            )
            .with_suggestion("Set sandbox.allow_direct_fallback = false on hosts with working nsjail"),
        );
    }

    result
}
