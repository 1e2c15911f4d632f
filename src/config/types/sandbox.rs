//! Sandbox configuration types
//!
//! Interpreter and isolation tool locations, resource ceilings and timeouts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Path or name of the nsjail binary
    #[serde(default = "default_nsjail")]
    pub nsjail_path: PathBuf,
    /// Interpreter used to run the wrapped program
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,
    /// Parent directory for per-attempt workspaces
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Maximum accepted script size in bytes
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
    /// Host-side wall-clock deadline for one attempt
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Wall-clock budget shared by every attempt of one submission
    #[serde(default = "default_submission_timeout", with = "humantime_serde")]
    pub submission_timeout: Duration,
    /// In-sandbox wall-clock ceiling enforced by nsjail
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,
    /// Resource ceilings applied inside the sandbox
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Maximum captured bytes per output stream
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    /// Append the namespace-free `direct` profile to the catalog
    #[serde(default = "default_true")]
    pub allow_direct_fallback: bool,
    /// Hostname inside the UTS namespace
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            nsjail_path: default_nsjail(),
            interpreter: default_interpreter(),
            work_dir: default_work_dir(),
            max_script_bytes: default_max_script_bytes(),
            attempt_timeout: default_attempt_timeout(),
            submission_timeout: default_submission_timeout(),
            time_limit_secs: default_time_limit(),
            limits: LimitsConfig::default(),
            max_output_bytes: default_max_output(),
            allow_direct_fallback: true,
            hostname: default_hostname(),
        }
    }
}

fn default_nsjail() -> PathBuf {
    PathBuf::from("nsjail")
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("python3")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("jailrun")
}

fn default_max_script_bytes() -> usize {
    100_000
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(35)
}

fn default_submission_timeout() -> Duration {
    Duration::from_secs(38)
}

fn default_time_limit() -> u64 {
    30
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

fn default_true() -> bool {
    true
}

fn default_hostname() -> String {
    "jailrun".to_string()
}

/// Resource ceilings (rlimits)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// RLIMIT_AS in bytes
    #[serde(default = "default_address_space")]
    pub address_space_bytes: u64,
    /// RLIMIT_CPU in seconds
    #[serde(default = "default_cpu")]
    pub cpu_secs: u64,
    /// RLIMIT_NOFILE
    #[serde(default = "default_open_files")]
    pub open_files: u64,
    /// RLIMIT_NPROC
    #[serde(default = "default_processes")]
    pub processes: u64,
    /// RLIMIT_FSIZE in bytes
    #[serde(default = "default_file_size")]
    pub file_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            address_space_bytes: default_address_space(),
            cpu_secs: default_cpu(),
            open_files: default_open_files(),
            processes: default_processes(),
            file_size_bytes: default_file_size(),
        }
    }
}

fn default_address_space() -> u64 {
    128 * 1024 * 1024 // 128MB
}

fn default_cpu() -> u64 {
    10
}

fn default_open_files() -> u64 {
    32
}

fn default_processes() -> u64 {
    32
}

fn default_file_size() -> u64 {
    16 * 1024 * 1024
}
