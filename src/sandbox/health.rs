//! Environment probe for the health endpoint

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;

/// What the host offers for running submissions
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy` or `degraded`
    pub status: &'static str,
    /// Submissions can run under at least one profile
    pub available: bool,
    /// Resolved nsjail binary, if present
    pub nsjail: Option<PathBuf>,
    /// Resolved interpreter, if present
    pub interpreter: Option<PathBuf>,
    pub work_dir_writable: bool,
    pub timestamp: DateTime<Utc>,
}

fn probe_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".jr-probe-{}", uuid::Uuid::new_v4()));
    let writable = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    writable
}

/// Check the isolation mechanism, the interpreter and the work directory
pub fn probe(config: &SandboxConfig) -> HealthReport {
    let nsjail = which::which(&config.nsjail_path).ok();
    let interpreter = which::which(&config.interpreter).ok();
    let work_dir_writable = probe_writable(&config.work_dir);

    let mechanism = nsjail.is_some() || config.allow_direct_fallback;
    let available = mechanism && interpreter.is_some() && work_dir_writable;

    HealthReport {
        status: if available { "healthy" } else { "degraded" },
        available,
        nsjail,
        interpreter,
        work_dir_writable,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_nsjail_without_direct_is_unavailable() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            nsjail_path: PathBuf::from("/nonexistent/nsjail"),
            interpreter: PathBuf::from("sh"),
            work_dir: dir.path().join("work"),
            allow_direct_fallback: false,
            ..SandboxConfig::default()
        };
        let report = probe(&config);
        assert!(report.nsjail.is_none());
        assert!(report.work_dir_writable);
        assert!(!report.available);
        assert_eq!(report.status, "degraded");
    }

    #[test]
    fn test_direct_fallback_counts_as_mechanism() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            nsjail_path: PathBuf::from("/nonexistent/nsjail"),
            interpreter: PathBuf::from("sh"),
            work_dir: dir.path().to_path_buf(),
            allow_direct_fallback: true,
            ..SandboxConfig::default()
        };
        let report = probe(&config);
        assert!(report.available);
        // The probe file does not linger
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_work_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        assert!(!probe_writable(&file.join("sub")));
    }
}
