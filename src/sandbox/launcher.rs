//! Sandbox launcher
//!
//! Spawns one process tree per attempt, waits for it under a deadline, and
//! reports the attempt's terminal state. The child always leads its own
//! process group so a timeout or a cancelled attempt is reclaimed with a
//! single `killpg`. Descendants that leave the group are found through the
//! output pipes they still hold.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::sandbox::descriptor::render_nsjail_config;
use crate::sandbox::executor::{AttemptStatus, CapturedOutput, ExecutionAttempt};
use crate::sandbox::profile::{
    EnvPolicy, FilesystemExposure, InvocationMode, IsolationProfile, Mechanism, ResourceLimits,
    SANDBOX_DIR,
};
use crate::sandbox::workspace::Workspace;
use crate::sandbox::wrapper::WrappedProgram;

/// Largest single argv element the kernel accepts (MAX_ARG_STRLEN, incl. NUL)
const MAX_ARG_LEN: usize = 32 * 4096;

/// nsjail's exit status when it fails before running the child
const NSJAIL_SETUP_FAILURE: i32 = 255;

pub const PROGRAM_FILE: &str = "program.py";
pub const DESCRIPTOR_FILE: &str = "profile.cfg";

/// Runs one wrapped program under one profile
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher name, for logs
    fn name(&self) -> &str;

    /// Run one attempt; artifacts go into `workspace`, owned by the caller
    async fn launch(
        &self,
        program: &WrappedProgram,
        profile: &IsolationProfile,
        workspace: &mut Workspace,
        deadline: Duration,
    ) -> ExecutionAttempt;
}

/// Launcher backed by real processes (nsjail or the bare interpreter)
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    nsjail_path: PathBuf,
    interpreter: PathBuf,
    max_output_bytes: usize,
}

impl ProcessLauncher {
    pub fn new(config: &SandboxConfig) -> Self {
        ProcessLauncher {
            nsjail_path: config.nsjail_path.clone(),
            interpreter: config.interpreter.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Build the command for this profile, writing whatever files it needs
    fn prepare(
        &self,
        program: &WrappedProgram,
        profile: &IsolationProfile,
        workspace: &mut Workspace,
    ) -> Result<Command, String> {
        let interpreter = which::which(&self.interpreter).map_err(|e| {
            format!("interpreter {} not found: {}", self.interpreter.display(), e)
        })?;

        let mut args: Vec<OsString> = vec!["-I".into(), "-B".into()];
        match profile.invocation {
            InvocationMode::File => {
                let host_path = workspace
                    .write_file(PROGRAM_FILE, program.as_str())
                    .map_err(|e| e.to_string())?;
                let path = match profile.filesystem {
                    FilesystemExposure::Restricted(_) => Path::new(SANDBOX_DIR).join(PROGRAM_FILE),
                    FilesystemExposure::Host => host_path,
                };
                args.push(path.into_os_string());
            }
            InvocationMode::Inline => {
                if program.as_str().len() >= MAX_ARG_LEN {
                    return Err(format!(
                        "program is {} bytes, too large for inline invocation (max {})",
                        program.as_str().len(),
                        MAX_ARG_LEN - 1
                    ));
                }
                args.push("-c".into());
                args.push(program.as_str().into());
            }
        }

        let mut command = match profile.mechanism {
            Mechanism::Nsjail => {
                let nsjail = which::which(&self.nsjail_path).map_err(|e| {
                    format!("nsjail not found at {}: {}", self.nsjail_path.display(), e)
                })?;
                let rendered = render_nsjail_config(profile, workspace.path());
                let descriptor = workspace
                    .write_file(DESCRIPTOR_FILE, &rendered)
                    .map_err(|e| e.to_string())?;

                let mut command = Command::new(nsjail);
                command
                    .arg("--config")
                    .arg(descriptor)
                    .arg("--")
                    .arg(interpreter)
                    .args(args);
                command
            }
            Mechanism::Direct => {
                let mut command = Command::new(interpreter);
                command.args(args).current_dir(workspace.path());
                if let EnvPolicy::AllowList(vars) = &profile.env {
                    command.env_clear();
                    command.envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                }
                let limits = profile.limits.clone();
                // SAFETY: only async-signal-safe setrlimit calls run in the child
                unsafe {
                    command.pre_exec(move || apply_rlimits(&limits));
                }
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        Ok(command)
    }
}

macro_rules! set_limit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $soft as libc::rlim_t,
            rlim_max: $hard as libc::rlim_t,
        };
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    set_limit!(libc::RLIMIT_AS, limits.address_space_bytes, limits.address_space_bytes);
    // SIGXCPU at the soft limit, SIGKILL a second later
    set_limit!(libc::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1);
    if let Some(n) = limits.open_files {
        set_limit!(libc::RLIMIT_NOFILE, n, n);
    }
    if let Some(n) = limits.processes {
        set_limit!(libc::RLIMIT_NPROC, n, n);
    }
    if let Some(n) = limits.file_size_bytes {
        set_limit!(libc::RLIMIT_FSIZE, n, n);
    }
    set_limit!(libc::RLIMIT_CORE, 0, 0);
    Ok(())
}

/// Kills the attempt's process group when dropped
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        ProcessGroupGuard {
            pgid: pid.map(|p| p as i32),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // ESRCH just means the group is already gone
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Captured stream: the first `cap` bytes plus the last `cap` bytes
#[derive(Debug, Default)]
struct Drained {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    truncated: bool,
}

impl Drained {
    fn into_string(self) -> String {
        let mut bytes = self.head;
        bytes.extend(self.tail);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Read a pipe to EOF without ever blocking the writer
async fn drain<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Drained {
    let mut out = Drained::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Error reading sandbox output: {}", e);
                break;
            }
        };
        let chunk = &buf[..n];
        let room = cap.saturating_sub(out.head.len());
        let (head, rest) = chunk.split_at(room.min(chunk.len()));
        out.head.extend_from_slice(head);
        out.tail.extend(rest);
        if out.tail.len() > cap {
            let excess = out.tail.len() - cap;
            out.tail.drain(..excess);
            out.truncated = true;
        }
    }
    out
}

/// Inode of the pipe behind one of our descriptors
fn pipe_inode(fd: RawFd) -> Option<u64> {
    std::fs::metadata(format!("/proc/self/fd/{}", fd))
        .ok()
        .map(|m| m.ino())
}

/// SIGKILL every other process still holding one of `pipes` open.
///
/// A descendant that called `setsid` has left the attempt's process group,
/// but it still inherits the output pipes, which is how we find it.
fn kill_pipe_holders(pipes: &[u64]) -> usize {
    if pipes.is_empty() {
        return 0;
    }
    let targets: Vec<String> = pipes.iter().map(|ino| format!("pipe:[{}]", ino)).collect();
    let own = std::process::id();
    let Ok(procs) = std::fs::read_dir("/proc") else {
        return 0;
    };

    let mut killed = 0;
    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Our own children are either reaped already or belong to another
        // attempt that has not exec'd yet
        if pid == own || parent_pid(pid) == Some(own) {
            continue;
        }
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .map(|link| targets.iter().any(|t| link.as_os_str() == t.as_str()))
                .unwrap_or(false)
        });
        if holds {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            killed += 1;
        }
    }
    killed
}

fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces; fields resume after its closing paren
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

async fn reclaim_escaped(pipes: Vec<u64>) {
    match tokio::task::spawn_blocking(move || kill_pipe_holders(&pipes)).await {
        Ok(0) => {}
        Ok(n) => debug!(count = n, "Killed processes that escaped the process group"),
        Err(e) => warn!("Failed to scan for escaped processes: {}", e),
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn name(&self) -> &str {
        "process"
    }

    async fn launch(
        &self,
        program: &WrappedProgram,
        profile: &IsolationProfile,
        workspace: &mut Workspace,
        deadline: Duration,
    ) -> ExecutionAttempt {
        let started_at = Utc::now();
        let start = Instant::now();
        let finish = |status: AttemptStatus| ExecutionAttempt {
            profile: profile.name.to_string(),
            started_at,
            deadline,
            elapsed: start.elapsed(),
            status,
        };

        let mut command = match self.prepare(program, profile, workspace) {
            Ok(command) => command,
            Err(reason) => return finish(AttemptStatus::SpawnFailed(reason)),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return finish(AttemptStatus::SpawnFailed(format!(
                    "failed to spawn process: {}",
                    e
                )))
            }
        };
        let mut group = ProcessGroupGuard::new(child.id());
        debug!(pid = ?child.id(), profile = profile.name, "Spawned sandbox process");

        let pipes: Vec<u64> = [
            child.stdout.as_ref().map(|s| s.as_raw_fd()),
            child.stderr.as_ref().map(|s| s.as_raw_fd()),
        ]
        .into_iter()
        .flatten()
        .filter_map(pipe_inode)
        .collect();

        let stdout = child.stdout.take().map(|s| tokio::spawn(drain(s, self.max_output_bytes)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s, self.max_output_bytes)));
        let readers: Vec<AbortHandle> = [&stdout, &stderr]
            .into_iter()
            .flatten()
            .map(|h| h.abort_handle())
            .collect();
        let abort_readers = || readers.iter().for_each(AbortHandle::abort);

        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                group.kill();
                abort_readers();
                return finish(AttemptStatus::SpawnFailed(format!(
                    "failed to wait for process: {}",
                    e
                )));
            }
            Err(_) => {
                warn!("Attempt under profile {} timed out after {:?}", profile.name, deadline);
                group.kill();
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap timed-out process: {}", e);
                }
                abort_readers();
                reclaim_escaped(pipes).await;
                return finish(AttemptStatus::TimedOut);
            }
        };

        // Reclaim anything the script left running in the background,
        // including descendants that moved to another session
        group.kill();
        reclaim_escaped(pipes.clone()).await;

        let collect = |handle: Option<tokio::task::JoinHandle<Drained>>| async move {
            match handle {
                Some(handle) => handle.await.unwrap_or_default(),
                None => Drained::default(),
            }
        };
        let remaining = deadline.saturating_sub(start.elapsed());
        let collected = tokio::time::timeout(remaining, async {
            tokio::join!(collect(stdout), collect(stderr))
        })
        .await;
        let (stdout, stderr) = match collected {
            Ok(streams) => streams,
            Err(_) => {
                warn!(
                    "Output of profile {} still open at the deadline, abandoning it",
                    profile.name
                );
                abort_readers();
                reclaim_escaped(pipes).await;
                return finish(AttemptStatus::TimedOut);
            }
        };
        let truncated = stdout.truncated;

        let captured = CapturedOutput {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code: status.code(),
            signal: status.signal(),
            truncated,
        };
        debug!(
            profile = profile.name,
            exit_code = ?captured.exit_code,
            signal = ?captured.signal,
            "Sandbox process exited"
        );

        if profile.mechanism == Mechanism::Nsjail
            && captured.exit_code == Some(NSJAIL_SETUP_FAILURE)
            && captured.stdout.trim().is_empty()
        {
            return finish(AttemptStatus::SpawnFailed(format!(
                "nsjail rejected profile: {}",
                captured.stderr_tail()
            )));
        }

        finish(AttemptStatus::Completed(captured))
    }
}
