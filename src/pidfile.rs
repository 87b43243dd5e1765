//! The manager's PID file.
//!
//! The file holds the manager's PID in decimal followed by a newline. It is
//! written to a temporary file in the same directory and renamed into place,
//! so readers never see a partial write.

use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{Pid, getpid};
use tracing::{debug, warn};

use crate::error::{HerdError, Result};

/// A PID file written by this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: Pid,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// Fails with [`HerdError::PidConflict`] if the file names another live
    /// process. A file naming this process (a re-executed manager) or a dead
    /// one is overwritten.
    pub fn acquire(path: &Path) -> Result<Self> {
        let pid = getpid();
        if let Some(owner) = read_live_pid(path)
            && owner != pid
        {
            return Err(HerdError::PidConflict {
                pid: owner.as_raw(),
                path: path.to_path_buf(),
            });
        }
        write_atomic(path, pid)?;
        debug!(path = %path.display(), %pid, "wrote pid file");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file if it still names this process.
    pub fn release(self) {
        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
                }
            }
            _ => debug!(path = %self.path.display(), "pid file no longer ours, leaving it"),
        }
    }
}

/// The PID recorded in `path`, if the file exists and holds a positive number.
pub fn read_pid(path: &Path) -> Option<Pid> {
    let text = fs::read_to_string(path).ok()?;
    let raw: i32 = text.trim().parse().ok()?;
    (raw > 0).then(|| Pid::from_raw(raw))
}

/// The PID recorded in `path`, if that process is still alive.
///
/// A process we may not signal (`EPERM`) still exists and counts as alive.
pub fn read_live_pid(path: &Path) -> Option<Pid> {
    let pid = read_pid(path)?;
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Some(pid),
        Err(_) => None,
    }
}

fn write_atomic(path: &Path, pid: Pid) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".jobherd-pid")
        .tempfile_in(dir)?;
    writeln!(tmp, "{}", pid)?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))?;
    tmp.persist(path).map_err(|e| HerdError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid_and_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        let pid_file = PidFile::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", getpid()));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(pid_file.path(), path);
    }

    #[test]
    fn test_acquire_conflicts_with_live_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        // PID 1 always exists.
        fs::write(&path, "1\n").unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, HerdError::PidConflict { pid: 1, .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[test]
    fn test_acquire_accepts_own_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        fs::write(&path, format!("{}\n", getpid())).unwrap();
        assert!(PidFile::acquire(&path).is_ok());
    }

    #[test]
    fn test_acquire_replaces_stale_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        let mut child = Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{}\n", dead)).unwrap();

        PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(getpid()));
    }

    #[test]
    fn test_garbage_is_not_a_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert_eq!(read_pid(&path), None);
        fs::write(&path, "0\n").unwrap();
        assert_eq!(read_pid(&path), None);
        assert_eq!(read_live_pid(&dir.path().join("missing.pid")), None);
    }

    #[test]
    fn test_release_only_removes_own_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        let pid_file = PidFile::acquire(&path).unwrap();
        pid_file.release();
        assert!(!path.exists());

        let pid_file = PidFile::acquire(&path).unwrap();
        fs::write(&path, "1\n").unwrap();
        pid_file.release();
        assert!(path.exists());
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobherd.pid");
        PidFile::acquire(&path).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
