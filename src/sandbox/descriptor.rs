//! Per-attempt profile descriptor
//!
//! Renders an [`IsolationProfile`] as an nsjail configuration file
//! (protobuf text format).

use std::fmt::Write;
use std::path::Path;

use super::profile::{EnvPolicy, FilesystemExposure, IsolationProfile, Mount};

const MIB: u64 = 1024 * 1024;

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

fn mebibytes(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).max(1)
}

fn write_rlimit(out: &mut String, field: &str, value: Option<u64>) {
    match value {
        Some(v) => {
            let _ = writeln!(out, "{}: {}", field, v);
        }
        // Leave the inherited soft limit in place
        None => {
            let _ = writeln!(out, "{}_type: SOFT", field);
        }
    }
}

fn write_mount(out: &mut String, mount: &Mount, workspace: &Path) {
    out.push_str("mount {\n");
    match mount {
        Mount::Bind {
            src,
            dst,
            writable,
            optional,
        } => {
            let _ = writeln!(out, "  src: {}", quote_path(src));
            let _ = writeln!(out, "  dst: {}", quote_path(dst));
            out.push_str("  is_bind: true\n");
            let _ = writeln!(out, "  rw: {}", writable);
            if *optional {
                out.push_str("  mandatory: false\n");
            }
        }
        Mount::Workspace { dst } => {
            let _ = writeln!(out, "  src: {}", quote_path(workspace));
            let _ = writeln!(out, "  dst: {}", quote_path(dst));
            out.push_str("  is_bind: true\n  rw: false\n");
        }
        Mount::Tmpfs { dst, size_bytes } => {
            let _ = writeln!(out, "  dst: {}", quote_path(dst));
            out.push_str("  fstype: \"tmpfs\"\n  rw: true\n");
            let _ = writeln!(out, "  options: {}", quote(&format!("size={}", size_bytes)));
        }
        Mount::Proc => {
            out.push_str("  dst: \"/proc\"\n  fstype: \"proc\"\n");
        }
    }
    out.push_str("}\n");
}

/// Render the nsjail configuration for one attempt
pub fn render_nsjail_config(profile: &IsolationProfile, workspace: &Path) -> String {
    let mut out = String::new();
    let ns = &profile.namespaces;

    let _ = writeln!(out, "name: {}", quote(&format!("jailrun-{}", profile.name)));
    out.push_str("mode: ONCE\n");
    out.push_str("log_level: ERROR\n");
    let _ = writeln!(out, "hostname: {}", quote(&profile.hostname));
    if let Some(secs) = profile.time_limit_secs {
        let _ = writeln!(out, "time_limit: {}", secs);
    }

    let _ = writeln!(out, "rlimit_as: {}", mebibytes(profile.limits.address_space_bytes));
    let _ = writeln!(out, "rlimit_cpu: {}", profile.limits.cpu_secs);
    write_rlimit(&mut out, "rlimit_nofile", profile.limits.open_files);
    write_rlimit(&mut out, "rlimit_nproc", profile.limits.processes);
    write_rlimit(
        &mut out,
        "rlimit_fsize",
        profile.limits.file_size_bytes.map(mebibytes),
    );

    let _ = writeln!(out, "clone_newpid: {}", ns.pid);
    let _ = writeln!(out, "clone_newns: {}", ns.mount);
    let _ = writeln!(out, "clone_newipc: {}", ns.ipc);
    let _ = writeln!(out, "clone_newuts: {}", ns.uts);
    let _ = writeln!(out, "clone_newuser: {}", ns.user);
    let _ = writeln!(out, "clone_newnet: {}", ns.net);
    out.push_str("clone_newcgroup: false\n");

    if ns.user {
        out.push_str("uidmap {\n  inside_id: \"1000\"\n}\n");
        out.push_str("gidmap {\n  inside_id: \"1000\"\n}\n");
    }

    match &profile.env {
        EnvPolicy::InheritAll => out.push_str("keep_env: true\n"),
        EnvPolicy::AllowList(vars) => {
            out.push_str("keep_env: false\n");
            for (key, value) in vars {
                let _ = writeln!(out, "envar: {}", quote(&format!("{}={}", key, value)));
            }
        }
    }

    match &profile.filesystem {
        FilesystemExposure::Restricted(mounts) => {
            out.push_str("cwd: \"/tmp\"\n");
            for mount in mounts {
                write_mount(&mut out, mount, workspace);
            }
        }
        FilesystemExposure::Host => {
            let _ = writeln!(out, "cwd: {}", quote_path(workspace));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::profile::catalog;

    #[test]
    fn test_strict_descriptor_contents() {
        let profiles = catalog(&SandboxConfig::default());
        let text = render_nsjail_config(&profiles[0], Path::new("/tmp/jailrun/jr-1-abc"));

        assert!(text.contains("mode: ONCE\n"));
        assert!(text.contains("time_limit: 30\n"));
        assert!(text.contains("rlimit_as: 128\n"));
        assert!(text.contains("rlimit_cpu: 10\n"));
        assert!(text.contains("rlimit_nofile: 32\n"));
        assert!(text.contains("clone_newuser: true\n"));
        assert!(text.contains("clone_newnet: true\n"));
        assert!(text.contains("keep_env: false\n"));
        assert!(text.contains("envar: \"PYTHONIOENCODING=utf-8\"\n"));
        assert!(text.contains("src: \"/tmp/jailrun/jr-1-abc\"\n  dst: \"/sandbox\""));
        assert!(text.contains("fstype: \"proc\""));
    }

    #[test]
    fn test_host_profiles_have_no_mounts() {
        let profiles = catalog(&SandboxConfig::default());
        let bare = profiles.iter().find(|p| p.name == "bare-nsjail").unwrap();
        let text = render_nsjail_config(bare, Path::new("/work/x"));

        assert!(!text.contains("mount {"));
        assert!(text.contains("clone_newpid: false\n"));
        assert!(text.contains("cwd: \"/work/x\"\n"));
        assert!(!text.contains("uidmap"));
    }

    #[test]
    fn test_unset_ceiling_keeps_soft_limit() {
        let mut profile = catalog(&SandboxConfig::default()).remove(0);
        profile.limits.processes = None;
        let text = render_nsjail_config(&profile, Path::new("/w"));
        assert!(text.contains("rlimit_nproc_type: SOFT\n"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(mebibytes(1), 1);
        assert_eq!(mebibytes(MIB + 1), 2);
    }
}
