//! Forked worker processes and the channels that connect them to the manager.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────┐
//!                       │     Manager      │
//!                       │  (master loop)   │
//!                       └────────┬─────────┘
//!          ready pipe ▲          │          ▼ job pipe
//!               ┌─────┴──────────┼──────────┴─────┐
//!               │                │                │
//!         ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!         │ worker 0  │    │ worker 1  │    │ worker N  │
//!         │ heartbeat │    │ heartbeat │    │ heartbeat │
//!         └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! - **Process isolation**: workers are `fork`ed, so a crash takes down one job
//! - **One job in flight**: a worker only gets a job after reporting ready
//! - **Liveness**: an unlinked heartbeat file's ctime is the cross-process clock

pub mod heartbeat;
pub mod ipc;
pub mod pool;
pub mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod watchdog;
pub mod worker_main;

use std::ffi::CString;

use nix::unistd::{Gid, Group, User, getgid, getuid, initgroups, setgid, setuid};

use crate::error::{HerdError, Result};
use heartbeat::Heartbeat;

/// A worker slot as seen by hooks, in both the manager and the worker process.
#[derive(Debug)]
pub struct Worker {
    nr: usize,
    heartbeat: Heartbeat,
    switched: bool,
}

impl Worker {
    /// Create the bookkeeping for worker ordinal `nr`, with a fresh heartbeat.
    pub fn new(nr: usize) -> Result<Self> {
        Ok(Self {
            nr,
            heartbeat: Heartbeat::new()?,
            switched: false,
        })
    }

    /// Ordinal slot of this worker within `[0, worker_processes)`.
    pub fn nr(&self) -> usize {
        self.nr
    }

    /// Whether the process identity has already been switched.
    pub fn switched(&self) -> bool {
        self.switched
    }

    /// The worker's heartbeat.
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub(crate) fn heartbeat_mut(&mut self) -> &mut Heartbeat {
        &mut self.heartbeat
    }

    /// Drop privileges to `user` (and `group`, defaulting to the user's
    /// primary group). Only meaningful inside the worker process.
    ///
    /// The heartbeat file changes owner first so the worker can keep
    /// toggling it.
    pub fn switch_user(&mut self, user: &str, group: Option<&str>) -> Result<()> {
        let (uid_entry, gid) = resolve_user(user, group)?;
        if uid_entry.uid != getuid() || gid != getgid() {
            let name = CString::new(user)
                .map_err(|_| HerdError::UnknownUser(format!("invalid user name: {:?}", user)))?;
            self.heartbeat.chown(uid_entry.uid, gid)?;
            initgroups(&name, gid)?;
            setgid(gid)?;
            setuid(uid_entry.uid)?;
        }
        self.switched = true;
        Ok(())
    }
}

/// Look up a user and the group it should run as.
pub fn resolve_user(user: &str, group: Option<&str>) -> Result<(User, Gid)> {
    let entry = User::from_name(user)?
        .ok_or_else(|| HerdError::UnknownUser(format!("user={}", user)))?;
    let gid = match group {
        Some(name) => {
            Group::from_name(name)?
                .ok_or_else(|| HerdError::UnknownUser(format!("group={}", name)))?
                .gid
        }
        None => entry.gid,
    };
    Ok((entry, gid))
}
