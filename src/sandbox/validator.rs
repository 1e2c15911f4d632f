//! Submission validation
//!
//! Runs before any process or file is created.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::ValidationError;

/// A script that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSubmission {
    source: String,
}

impl ScriptSubmission {
    /// Validate raw source against the size ceiling and entry-point rule
    pub fn new(source: impl Into<String>, max_bytes: usize) -> Result<Self, ValidationError> {
        let source = source.into();
        validate_script(&source, max_bytes)?;
        Ok(ScriptSubmission { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.source.len()
    }
}

fn entry_point_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Top-level `def main():`, optionally annotated; async defs are not callable as-is
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^def[ \t]+main[ \t]*\([ \t]*\)[ \t]*(->[^:\n]*)?:").expect("valid regex")
    })
}

/// Check a script without taking ownership
pub fn validate_script(source: &str, max_bytes: usize) -> Result<(), ValidationError> {
    if source.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    if source.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            size: source.len(),
            limit: max_bytes,
        });
    }

    if !entry_point_pattern().is_match(source) {
        return Err(ValidationError::MissingEntryPoint);
    }

    Ok(())
}
