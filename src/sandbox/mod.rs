//! Sandbox module - one-shot execution of untrusted Python
//!
//! A submission flows through:
//! - Validation: size ceiling and `def main():` entry point, before any spawn
//! - Wrapping: the script becomes a program that reports through [`protocol`]
//! - Orchestration: the [`profile`] catalog is tried strongest first, each
//!   attempt in its own workspace, until one yields a decodable outcome

mod descriptor;
mod executor;
mod health;
mod launcher;
mod orchestrator;
pub mod profile;
pub mod protocol;
mod validator;
mod workspace;
mod wrapper;

pub use descriptor::render_nsjail_config;
pub use executor::{
    AttemptFailure, AttemptStatus, CapturedOutput, Execution, ExecutionAttempt, ExecutionOutcome,
};
pub use health::HealthReport;
pub use launcher::{Launcher, ProcessLauncher};
pub use orchestrator::FallbackOrchestrator;
pub use profile::{catalog, IsolationProfile};
pub use validator::{validate_script, ScriptSubmission};
pub use workspace::{sweep_stale, Workspace};
pub use wrapper::{wrap, WrappedProgram};

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::error::Result;

/// Entry point for running submissions
pub struct Sandbox {
    config: SandboxConfig,
    orchestrator: FallbackOrchestrator,
}

impl Sandbox {
    /// Sandbox backed by real processes
    pub fn new(config: SandboxConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(&config));
        Self::with_launcher(config, launcher)
    }

    /// Sandbox with a custom launcher
    pub fn with_launcher(config: SandboxConfig, launcher: Arc<dyn Launcher>) -> Self {
        let removed = sweep_stale(&config.work_dir);
        if removed > 0 {
            info!("Removed {} stale workspace(s) from {}", removed, config.work_dir.display());
        }

        let orchestrator = FallbackOrchestrator::new(catalog(&config), launcher, &config);
        Sandbox {
            config,
            orchestrator,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The catalog this sandbox walks, strongest first
    pub fn profiles(&self) -> &[IsolationProfile] {
        self.orchestrator.profiles()
    }

    /// Validate, wrap and run one script
    pub async fn execute(&self, script: &str) -> Result<Execution> {
        let submission = ScriptSubmission::new(script, self.config.max_script_bytes)?;
        debug!("Accepted script of {} bytes", submission.size());

        let program = wrap(&submission);
        let execution = self.orchestrator.run(&program).await?;

        info!(
            profile = %execution.profile,
            success = execution.outcome.is_success(),
            elapsed = ?execution.elapsed,
            "Execution finished"
        );
        Ok(execution)
    }

    /// Probe the host environment
    pub fn health(&self) -> HealthReport {
        health::probe(&self.config)
    }
}

/// Create a process-backed sandbox from configuration
pub fn create_sandbox(config: &SandboxConfig) -> Arc<Sandbox> {
    Arc::new(Sandbox::new(config.clone()))
}
