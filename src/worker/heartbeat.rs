//! Per-worker liveness marker backed by an unlinked temporary file.
//!
//! The worker flips the file's permission bits between `0o000` and `0o001`.
//! Every `fchmod` bumps the inode change time, which the manager reads with
//! `fstat` on its own descriptor for the same file. No bytes are ever written
//! and no message is exchanged. The file is unlinked at creation, so it
//! disappears with the last process holding it.

use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt, fchown};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::unistd::{Gid, Uid};

use crate::error::Result;

/// Mode of a heartbeat that has never been toggled.
pub const NEVER_STARTED_MODE: u32 = 0o600;

/// Handle to a worker's heartbeat file.
#[derive(Debug)]
pub struct Heartbeat {
    file: File,
    mark: u32,
}

impl Heartbeat {
    /// Create a fresh, unlinked heartbeat file in the never-started state.
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile()?;
        file.set_permissions(Permissions::from_mode(NEVER_STARTED_MODE))?;
        Ok(Self { file, mark: 0 })
    }

    /// Flip the permission bits, updating the file's change time.
    pub fn toggle(&mut self) -> io::Result<()> {
        self.mark ^= 1;
        self.file.set_permissions(Permissions::from_mode(self.mark))
    }

    /// Give the file to the identity the worker is about to become.
    ///
    /// Only the owner may `fchmod`, so this has to happen before privileges
    /// are dropped.
    pub fn chown(&self, uid: Uid, gid: Gid) -> io::Result<()> {
        fchown(&self.file, Some(uid.as_raw()), Some(gid.as_raw()))
    }

    /// When the heartbeat last changed, or `None` if it has never been toggled.
    pub fn last_beat(&self) -> io::Result<Option<SystemTime>> {
        let meta = self.file.metadata()?;
        if meta.mode() & 0o7777 == NEVER_STARTED_MODE {
            return Ok(None);
        }
        let secs = u64::try_from(meta.ctime()).unwrap_or(0);
        let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
        Ok(Some(UNIX_EPOCH + Duration::new(secs, nanos)))
    }

    /// How long the heartbeat has been silent as of `now`.
    ///
    /// `None` for a never-started heartbeat. A change time in the future
    /// (wall clock stepped backwards) counts as zero.
    pub fn silent_for(&self, now: SystemTime) -> io::Result<Option<Duration>> {
        Ok(self
            .last_beat()?
            .map(|beat| now.duration_since(beat).unwrap_or(Duration::ZERO)))
    }
}
