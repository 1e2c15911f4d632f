//! Isolation profile catalog
//!
//! A static table of containment strategies, strongest first. Each entry
//! gives up one or more isolation primitives that constrained or virtualised
//! hosts commonly refuse (user, mount and pid namespaces first). The hard
//! ceilings, address space and CPU time, are identical in every entry.
//! Nothing here probes the host; an unusable profile shows up as a failed
//! attempt in the launcher.

use serde::Serialize;
use std::path::PathBuf;

use crate::config::{LimitsConfig, SandboxConfig};

/// Linux namespaces a profile may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Namespaces {
    pub pid: bool,
    pub mount: bool,
    pub ipc: bool,
    pub uts: bool,
    pub user: bool,
    pub net: bool,
}

impl Namespaces {
    pub const ALL: Namespaces = Namespaces {
        pid: true,
        mount: true,
        ipc: true,
        uts: true,
        user: true,
        net: true,
    };

    pub const NONE: Namespaces = Namespaces {
        pid: false,
        mount: false,
        ipc: false,
        uts: false,
        user: false,
        net: false,
    };

    fn flags(&self) -> [bool; 6] {
        [self.pid, self.mount, self.ipc, self.uts, self.user, self.net]
    }

    /// Every namespace enabled here is also enabled in `other`
    pub fn is_subset_of(&self, other: &Namespaces) -> bool {
        self.flags()
            .iter()
            .zip(other.flags().iter())
            .all(|(mine, theirs)| !mine || *theirs)
    }

    pub fn count(&self) -> usize {
        self.flags().iter().filter(|f| **f).count()
    }
}

/// Resource ceilings; `None` means not enforced by this profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    /// Hard ceiling, identical across the catalog
    pub address_space_bytes: u64,
    /// Hard ceiling, identical across the catalog
    pub cpu_secs: u64,
    pub open_files: Option<u64>,
    pub processes: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(limits: &LimitsConfig) -> Self {
        ResourceLimits {
            address_space_bytes: limits.address_space_bytes,
            cpu_secs: limits.cpu_secs,
            open_files: Some(limits.open_files),
            processes: Some(limits.processes),
            file_size_bytes: Some(limits.file_size_bytes),
        }
    }
}

/// `next` is at least as loose as `prev`, and whether it is strictly looser
fn optional_ceiling(prev: Option<u64>, next: Option<u64>) -> Option<bool> {
    match (prev, next) {
        (None, None) => Some(false),
        (Some(_), None) => Some(true),
        (None, Some(_)) => None,
        (Some(p), Some(n)) if n >= p => Some(n > p),
        _ => None,
    }
}

/// One host path exposed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mount {
    /// Bind mount of a host path
    Bind {
        src: PathBuf,
        dst: PathBuf,
        writable: bool,
        /// Skip silently when the source does not exist on this host
        optional: bool,
    },
    /// The attempt's workspace, read-only at `dst`
    Workspace { dst: PathBuf },
    /// Fresh tmpfs
    Tmpfs { dst: PathBuf, size_bytes: u64 },
    /// procfs for the new pid namespace
    Proc,
}

/// What of the host filesystem the sandboxed process can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemExposure {
    /// A fresh root containing only these mounts
    Restricted(Vec<Mount>),
    /// The host filesystem as-is (no mount namespace)
    Host,
}

impl FilesystemExposure {
    pub fn label(&self) -> &'static str {
        match self {
            FilesystemExposure::Restricted(_) => "restricted",
            FilesystemExposure::Host => "host",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FilesystemExposure::Restricted(_) => 1,
            FilesystemExposure::Host => 0,
        }
    }
}

/// Environment passed to the interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPolicy {
    InheritAll,
    /// Start empty and set exactly these variables
    AllowList(Vec<(String, String)>),
}

impl EnvPolicy {
    fn rank(&self) -> u8 {
        match self {
            EnvPolicy::AllowList(_) => 1,
            EnvPolicy::InheritAll => 0,
        }
    }
}

/// How the wrapped program reaches the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// `interpreter <path>`; the file lives in the attempt workspace
    File,
    /// `interpreter -c <program>`
    Inline,
}

/// Process that establishes the isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    Nsjail,
    /// Interpreter spawned directly; rlimits applied in the child
    Direct,
}

/// One containment strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationProfile {
    pub name: &'static str,
    /// Position in the catalog, 0 = strongest
    pub rank: usize,
    pub mechanism: Mechanism,
    pub namespaces: Namespaces,
    pub limits: ResourceLimits,
    pub filesystem: FilesystemExposure,
    pub env: EnvPolicy,
    pub invocation: InvocationMode,
    /// In-sandbox wall-clock limit enforced by the mechanism, if it has one
    pub time_limit_secs: Option<u64>,
    pub hostname: String,
}

/// Where the workspace is mounted for file invocation
pub const SANDBOX_DIR: &str = "/sandbox";

impl IsolationProfile {
    /// `self` may directly follow `prev` in a catalog: it never adds a
    /// constraint, relaxes at least one, and keeps the hard ceilings.
    pub fn relaxes(&self, prev: &IsolationProfile) -> bool {
        if self.limits.address_space_bytes != prev.limits.address_space_bytes
            || self.limits.cpu_secs != prev.limits.cpu_secs
        {
            return false;
        }
        if !self.namespaces.is_subset_of(&prev.namespaces)
            || self.filesystem.rank() > prev.filesystem.rank()
            || self.env.rank() > prev.env.rank()
        {
            return false;
        }

        let mut strictly = self.namespaces.count() < prev.namespaces.count()
            || self.filesystem.rank() < prev.filesystem.rank()
            || self.env.rank() < prev.env.rank()
            || (self.mechanism == Mechanism::Direct && prev.mechanism == Mechanism::Nsjail);

        for (p, n) in [
            (prev.limits.open_files, self.limits.open_files),
            (prev.limits.processes, self.limits.processes),
            (prev.limits.file_size_bytes, self.limits.file_size_bytes),
            (prev.time_limit_secs, self.time_limit_secs),
        ] {
            match optional_ceiling(p, n) {
                Some(relaxed) => strictly |= relaxed,
                None => return false,
            }
        }

        strictly
    }
}

fn system_mounts() -> Vec<Mount> {
    let ro = |path: &str, optional: bool| Mount::Bind {
        src: PathBuf::from(path),
        dst: PathBuf::from(path),
        writable: false,
        optional,
    };

    vec![
        ro("/lib", false),
        ro("/lib64", true),
        ro("/usr/lib", false),
        ro("/usr/local/lib", true),
        ro("/bin", false),
        ro("/usr/bin", false),
        ro("/usr/local/bin", true),
        ro("/etc/alternatives", true),
        ro("/dev/null", false),
        ro("/dev/zero", false),
        ro("/dev/urandom", false),
        Mount::Proc,
        Mount::Tmpfs {
            dst: PathBuf::from("/tmp"),
            size_bytes: 16 * 1024 * 1024,
        },
        Mount::Workspace {
            dst: PathBuf::from(SANDBOX_DIR),
        },
    ]
}

fn default_env() -> EnvPolicy {
    EnvPolicy::AllowList(vec![
        (
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin".to_string(),
        ),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("HOME".to_string(), "/tmp".to_string()),
    ])
}

/// Build the ordered catalog for this configuration
pub fn catalog(config: &SandboxConfig) -> Vec<IsolationProfile> {
    let limits = ResourceLimits::from(&config.limits);
    let time_limit = Some(config.time_limit_secs);

    let base = |name: &'static str, namespaces: Namespaces| IsolationProfile {
        name,
        rank: 0,
        mechanism: Mechanism::Nsjail,
        namespaces,
        limits: limits.clone(),
        filesystem: FilesystemExposure::Restricted(system_mounts()),
        env: default_env(),
        invocation: InvocationMode::File,
        time_limit_secs: time_limit,
        hostname: config.hostname.clone(),
    };

    let no_mount = |name: &'static str, namespaces: Namespaces| IsolationProfile {
        filesystem: FilesystemExposure::Host,
        invocation: InvocationMode::Inline,
        ..base(name, namespaces)
    };

    let mut profiles = vec![
        base("strict", Namespaces::ALL),
        base(
            "no-userns",
            Namespaces {
                user: false,
                ..Namespaces::ALL
            },
        ),
        no_mount(
            "no-mountns",
            Namespaces {
                user: false,
                mount: false,
                ..Namespaces::ALL
            },
        ),
        no_mount(
            "no-pidns",
            Namespaces {
                user: false,
                mount: false,
                pid: false,
                ..Namespaces::ALL
            },
        ),
        no_mount("bare-nsjail", Namespaces::NONE),
    ];

    if config.allow_direct_fallback {
        profiles.push(IsolationProfile {
            mechanism: Mechanism::Direct,
            limits: ResourceLimits {
                // RLIMIT_NPROC counts every process of the host uid
                processes: None,
                ..limits.clone()
            },
            time_limit_secs: None,
            ..no_mount("direct", Namespaces::NONE)
        });
    }

    for (rank, profile) in profiles.iter_mut().enumerate() {
        profile.rank = rank;
    }
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_non_empty_and_ranked() {
        let profiles = catalog(&SandboxConfig::default());
        assert_eq!(profiles.len(), 6);
        assert_eq!(profiles[0].name, "strict");
        assert_eq!(profiles[0].namespaces, Namespaces::ALL);
        for (i, p) in profiles.iter().enumerate() {
            assert_eq!(p.rank, i);
        }
    }

    #[test]
    fn test_each_profile_relaxes_its_predecessor() {
        let profiles = catalog(&SandboxConfig::default());
        for pair in profiles.windows(2) {
            assert!(
                pair[1].relaxes(&pair[0]),
                "{} does not relax {}",
                pair[1].name,
                pair[0].name
            );
            assert!(!pair[0].relaxes(&pair[1]));
        }
    }

    #[test]
    fn test_hard_ceilings_are_uniform() {
        let config = SandboxConfig::default();
        for p in catalog(&config) {
            assert_eq!(p.limits.address_space_bytes, config.limits.address_space_bytes);
            assert_eq!(p.limits.cpu_secs, config.limits.cpu_secs);
        }
    }

    #[test]
    fn test_direct_profile_is_optional() {
        let config = SandboxConfig {
            allow_direct_fallback: false,
            ..SandboxConfig::default()
        };
        let profiles = catalog(&config);
        assert_eq!(profiles.len(), 5);
        assert!(profiles.iter().all(|p| p.mechanism == Mechanism::Nsjail));
    }

    #[test]
    fn test_restricted_profiles_use_file_invocation() {
        for p in catalog(&SandboxConfig::default()) {
            match p.filesystem {
                FilesystemExposure::Restricted(_) => {
                    assert!(p.namespaces.mount);
                    assert_eq!(p.invocation, InvocationMode::File);
                }
                FilesystemExposure::Host => {
                    assert!(!p.namespaces.mount);
                    assert_eq!(p.invocation, InvocationMode::Inline);
                }
            }
        }
    }

    #[test]
    fn test_tightening_is_not_a_relaxation() {
        let profiles = catalog(&SandboxConfig::default());
        let mut tighter = profiles[1].clone();
        tighter.limits.open_files = Some(1);
        assert!(!tighter.relaxes(&profiles[0]));

        let mut changed_hard = profiles[1].clone();
        changed_hard.limits.cpu_secs += 1;
        assert!(!changed_hard.relaxes(&profiles[0]));

        assert!(!profiles[0].clone().relaxes(&profiles[0]));
    }
}
