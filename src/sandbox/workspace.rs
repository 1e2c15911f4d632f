//! Attempt-scoped workspaces
//!
//! Every attempt writes its artifacts (wrapped program, profile descriptor)
//! into its own directory `<work_dir>/jr-<pid>-<uuid>`. The directory is
//! removed when the [`Workspace`] is dropped, whichever way the attempt
//! ends. Removal failures are logged and never surface to the caller.
//! Directories orphaned by a host process that died mid-attempt are
//! collected by [`sweep_stale`].

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const PREFIX: &str = "jr-";

/// A private directory that lives exactly as long as one attempt
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// Create a uniquely named directory under `base`
    pub fn create(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create work directory {}: {}", base.display(), e),
            ))
        })?;

        let dir = base.join(format!("{}{}-{}", PREFIX, std::process::id(), Uuid::new_v4()));
        // Readable by the unprivileged in-sandbox uid
        fs::DirBuilder::new().mode(0o755).create(&dir).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create workspace {}: {}", dir.display(), e),
            ))
        })?;

        debug!("Created workspace {}", dir.display());
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write a named file inside the workspace and return its path
    pub fn write_file(&mut self, name: &str, contents: &str) -> Result<PathBuf> {
        if name.contains('/') || name == ".." || name == "." {
            return Err(Error::Internal(format!("Invalid workspace file name: {}", name)));
        }

        let path = self.dir.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {}: {}", path.display(), e),
                ))
            })?;
        file.write_all(contents.as_bytes())?;
        Ok(path)
    }

    /// Remove the workspace now instead of at drop
    pub fn close(self) {
        // Drop does the work
    }

    fn cleanup(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed workspace {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.dir.display(), e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn owner_pid(name: &str) -> Option<i32> {
    name.strip_prefix(PREFIX)?.split('-').next()?.parse().ok()
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 only checks for existence; EPERM still means alive
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Remove workspaces whose owning process is gone; returns how many
pub fn sweep_stale(base: &Path) -> usize {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Failed to scan work directory {}: {}", base.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(owner_pid) else {
            continue;
        };
        if pid == std::process::id() as i32 || process_alive(pid) {
            continue;
        }

        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!("Removed stale workspace {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale workspace {}: {}", path.display(), e),
        }
    }
    removed
}
