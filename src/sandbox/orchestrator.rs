//! Fallback orchestrator
//!
//! Walks the profile catalog strongest first. Failures of the isolation
//! mechanism move on to the next profile; failures of the script do not.
//! Every attempt gets a fresh workspace that is gone before the next
//! attempt starts.
//!
//! A submission has one time budget shared by all of its attempts. The
//! unisolated `direct` profile is only reached when no earlier profile got
//! as far as running the script.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::sandbox::executor::{AttemptFailure, AttemptStatus, Execution, ExecutionOutcome};
use crate::sandbox::launcher::Launcher;
use crate::sandbox::profile::{IsolationProfile, Mechanism};
use crate::sandbox::protocol;
use crate::sandbox::workspace::Workspace;
use crate::sandbox::wrapper::WrappedProgram;

pub struct FallbackOrchestrator {
    profiles: Vec<IsolationProfile>,
    launcher: Arc<dyn Launcher>,
    work_dir: PathBuf,
    attempt_timeout: Duration,
    submission_timeout: Duration,
    max_output_bytes: usize,
}

impl FallbackOrchestrator {
    pub fn new(
        profiles: Vec<IsolationProfile>,
        launcher: Arc<dyn Launcher>,
        config: &SandboxConfig,
    ) -> Self {
        FallbackOrchestrator {
            profiles,
            launcher,
            work_dir: config.work_dir.clone(),
            attempt_timeout: config.attempt_timeout,
            submission_timeout: config.submission_timeout,
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn profiles(&self) -> &[IsolationProfile] {
        &self.profiles
    }

    /// Run `program` under the first profile that yields a decodable outcome
    pub async fn run(&self, program: &WrappedProgram) -> Result<Execution> {
        let start = Instant::now();
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for profile in &self.profiles {
            if profile.mechanism == Mechanism::Direct
                && !failures.iter().all(AttemptFailure::is_spawn_failure)
            {
                warn!(
                    "Not falling back to {}: an isolated profile already ran the script",
                    profile.name
                );
                break;
            }

            let remaining = self.submission_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                warn!(
                    "Submission budget of {:?} spent before profile {}",
                    self.submission_timeout, profile.name
                );
                return Err(Error::TimedOut(self.submission_timeout));
            }
            let deadline = remaining.min(self.attempt_timeout);

            let span = info_span!("attempt", profile = profile.name, rank = profile.rank);
            match self.attempt(program, profile, deadline).instrument(span).await {
                Ok(outcome) => {
                    if !failures.is_empty() {
                        info!(
                            "Executed under profile {} after {} failed profile(s)",
                            profile.name,
                            failures.len()
                        );
                    }
                    return Ok(Execution {
                        outcome,
                        profile: profile.name.to_string(),
                        failures,
                        elapsed: start.elapsed(),
                    });
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Profile {} failed, falling back: {}", profile.name, e);
                    failures.push(AttemptFailure::new(profile.name, e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Exhausted(failures))
    }

    async fn attempt(
        &self,
        program: &WrappedProgram,
        profile: &IsolationProfile,
        deadline: Duration,
    ) -> Result<ExecutionOutcome> {
        // Workspace errors are host problems, not profile problems
        let mut workspace = Workspace::create(&self.work_dir)?;

        debug!("Launching with {}", self.launcher.name());
        let attempt = self
            .launcher
            .launch(program, profile, &mut workspace, deadline)
            .await;
        workspace.close();

        match attempt.status {
            AttemptStatus::SpawnFailed(reason) => Err(Error::SpawnFailed(reason)),
            AttemptStatus::TimedOut => Err(Error::TimedOut(attempt.deadline)),
            AttemptStatus::Completed(captured) => match protocol::decode(&captured.stdout) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    if let Some(kill) = captured.resource_kill() {
                        return Err(Error::ResourceExhausted(kill));
                    }
                    if captured.truncated {
                        return Err(Error::ResourceExhausted(format!(
                            "output exceeded {} bytes",
                            self.max_output_bytes
                        )));
                    }
                    let tail = captured.stderr_tail();
                    if tail.is_empty() {
                        Err(e)
                    } else {
                        Err(Error::Protocol(format!("{} (stderr: {})", e, tail)))
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::executor::{CapturedOutput, ExecutionAttempt};
    use crate::sandbox::profile::catalog;
    use crate::sandbox::validator::ScriptSubmission;
    use crate::sandbox::wrapper::wrap;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scripted launcher: one status per profile name, counting spawns
    struct FakeLauncher {
        script: Box<dyn Fn(&str) -> AttemptStatus + Send + Sync>,
        runtime: Duration,
        calls: Mutex<Vec<String>>,
        deadlines: Mutex<Vec<Duration>>,
        workspaces: Mutex<Vec<PathBuf>>,
    }

    impl FakeLauncher {
        fn new(script: impl Fn(&str) -> AttemptStatus + Send + Sync + 'static) -> Arc<Self> {
            Self::slow(Duration::ZERO, script)
        }

        /// Every attempt takes `runtime`, or times out if that exceeds its deadline
        fn slow(
            runtime: Duration,
            script: impl Fn(&str) -> AttemptStatus + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(FakeLauncher {
                script: Box::new(script),
                runtime,
                calls: Mutex::new(Vec::new()),
                deadlines: Mutex::new(Vec::new()),
                workspaces: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        fn name(&self) -> &str {
            "fake"
        }

        async fn launch(
            &self,
            _program: &WrappedProgram,
            profile: &IsolationProfile,
            workspace: &mut Workspace,
            deadline: Duration,
        ) -> ExecutionAttempt {
            workspace.write_file("program.py", "x").unwrap();
            self.calls.lock().unwrap().push(profile.name.to_string());
            self.deadlines.lock().unwrap().push(deadline);
            self.workspaces
                .lock()
                .unwrap()
                .push(workspace.path().to_path_buf());

            let started_at = Utc::now();
            if self.runtime > deadline {
                tokio::time::sleep(deadline).await;
                return ExecutionAttempt {
                    profile: profile.name.to_string(),
                    started_at,
                    deadline,
                    elapsed: deadline,
                    status: AttemptStatus::TimedOut,
                };
            }
            tokio::time::sleep(self.runtime).await;
            ExecutionAttempt {
                profile: profile.name.to_string(),
                started_at,
                deadline,
                elapsed: self.runtime,
                status: (self.script)(profile.name),
            }
        }
    }

    fn completed(stdout: String) -> AttemptStatus {
        AttemptStatus::Completed(CapturedOutput {
            stdout,
            exit_code: Some(0),
            ..Default::default()
        })
    }

    fn program() -> WrappedProgram {
        wrap(&ScriptSubmission::new("def main():\n    return 1\n", 100_000).unwrap())
    }

    fn orchestrator(launcher: Arc<FakeLauncher>, work_dir: &std::path::Path) -> FallbackOrchestrator {
        let config = SandboxConfig {
            work_dir: work_dir.to_path_buf(),
            ..SandboxConfig::default()
        };
        FallbackOrchestrator::new(catalog(&config), launcher, &config)
    }

    fn budgeted(
        launcher: Arc<FakeLauncher>,
        work_dir: &std::path::Path,
        attempt: Duration,
        submission: Duration,
    ) -> FallbackOrchestrator {
        let config = SandboxConfig {
            work_dir: work_dir.to_path_buf(),
            attempt_timeout: attempt,
            submission_timeout: submission,
            ..SandboxConfig::default()
        };
        FallbackOrchestrator::new(catalog(&config), launcher, &config)
    }

    #[tokio::test]
    async fn test_last_profile_after_spawn_failures() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| {
            if name == "direct" {
                completed(format!("hi\n{}", protocol::encode_result(&json!({"a": 1}))))
            } else {
                AttemptStatus::SpawnFailed(format!("{} refused", name))
            }
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        let execution = orch.run(&program()).await.unwrap();
        assert_eq!(execution.profile, "direct");
        assert_eq!(execution.failures.len(), 5);
        assert_eq!(execution.failures[0].profile, "strict");
        assert_eq!(
            execution.outcome,
            ExecutionOutcome::Success {
                result: json!({"a": 1}),
                stdout: "hi\n".to_string()
            }
        );
        assert_eq!(launcher.calls().len(), 6);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_does_not_fall_back() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|_| AttemptStatus::TimedOut);
        let orch = orchestrator(launcher.clone(), dir.path());

        let err = orch.run(&program()).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
        assert_eq!(launcher.calls(), vec!["strict".to_string()]);
    }

    #[tokio::test]
    async fn test_runtime_error_does_not_fall_back() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|_| {
            completed(protocol::encode_error("ZeroDivisionError", "division by zero"))
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        let execution = orch.run(&program()).await.unwrap();
        assert_eq!(execution.profile, "strict");
        assert!(!execution.outcome.is_success());
        assert_eq!(launcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_violation_falls_back() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| match name {
            "strict" => completed("garbage without sentinels".to_string()),
            _ => completed(protocol::encode_result(&json!(2))),
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        let execution = orch.run(&program()).await.unwrap();
        assert_eq!(execution.profile, "no-userns");
        assert_eq!(execution.failures.len(), 1);
        assert_eq!(execution.failures[0].kind, "protocol");
    }

    #[tokio::test]
    async fn test_resource_kill_is_terminal() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|_| {
            AttemptStatus::Completed(CapturedOutput {
                exit_code: Some(128 + libc::SIGKILL),
                ..Default::default()
            })
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        let err = orch.run(&program()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(launcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_profile_in_order() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| AttemptStatus::SpawnFailed(format!("{} refused", name)));
        let orch = orchestrator(launcher.clone(), dir.path());

        let err = orch.run(&program()).await.unwrap_err();
        let Error::Exhausted(failures) = err else {
            panic!("expected exhaustion");
        };
        let names: Vec<_> = failures.iter().map(|f| f.profile.as_str()).collect();
        let expected: Vec<_> = orch.profiles().iter().map(|p| p.name).collect();
        assert_eq!(names, expected);
        assert!(failures.iter().all(|f| f.kind == "spawn_failed"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_a_fresh_workspace() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| match name {
            "strict" => AttemptStatus::SpawnFailed("no userns".to_string()),
            _ => completed(protocol::encode_result(&json!(null))),
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        orch.run(&program()).await.unwrap();
        let workspaces = launcher.workspaces.lock().unwrap().clone();
        assert_eq!(workspaces.len(), 2);
        assert_ne!(workspaces[0], workspaces[1]);
        assert!(workspaces.iter().all(|w| !w.exists()));
    }

    #[tokio::test]
    async fn test_direct_not_reached_after_script_ran() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| match name {
            "direct" => completed(protocol::encode_result(&json!("escaped"))),
            // os._exit(1) under every jail: no sentinels at all
            _ => AttemptStatus::Completed(CapturedOutput {
                exit_code: Some(1),
                ..Default::default()
            }),
        });
        let orch = orchestrator(launcher.clone(), dir.path());
        assert_eq!(orch.profiles().last().unwrap().name, "direct");

        let err = orch.run(&program()).await.unwrap_err();
        let Error::Exhausted(failures) = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(failures.len(), 5);
        assert!(failures.iter().all(|f| f.kind == "protocol"));
        assert!(!launcher.calls().iter().any(|name| name == "direct"));
    }

    #[tokio::test]
    async fn test_direct_not_reached_after_mixed_failures() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(|name| match name {
            "no-pidns" => completed("garbage".to_string()),
            "direct" => completed(protocol::encode_result(&json!(1))),
            _ => AttemptStatus::SpawnFailed(format!("{} refused", name)),
        });
        let orch = orchestrator(launcher.clone(), dir.path());

        let err = orch.run(&program()).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted(_)));
        assert_eq!(launcher.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_submission_budget_spans_attempts() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::slow(Duration::from_millis(150), |_| {
            completed("garbage".to_string())
        });
        let orch = budgeted(
            launcher.clone(),
            dir.path(),
            Duration::from_millis(300),
            Duration::from_millis(400),
        );

        let start = Instant::now();
        let err = orch.run(&program()).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_millis(1500));

        // Later attempts only get what is left of the budget
        let deadlines = launcher.deadlines.lock().unwrap().clone();
        assert!(deadlines.len() < orch.profiles().len());
        assert_eq!(deadlines[0], Duration::from_millis(300));
        assert!(deadlines.last().unwrap() < &Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_spent_budget_stops_before_next_profile() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::slow(Duration::from_millis(100), |name| {
            AttemptStatus::SpawnFailed(format!("{} refused", name))
        });
        let orch = budgeted(
            launcher.clone(),
            dir.path(),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        let err = orch.run(&program()).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(d) if d == Duration::from_millis(100)));
        assert_eq!(launcher.calls(), vec!["strict".to_string()]);
    }
}
