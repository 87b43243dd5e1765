//! Stale worker detection.
//!
//! A worker toggles its heartbeat around every wait and every job. One whose
//! heartbeat has been silent for longer than the timeout is hung (or stuck in
//! a job that overran) and gets killed outright by the manager.

use std::time::{Duration, SystemTime};

use nix::unistd::Pid;
use tracing::warn;

use super::pool::WorkerPool;

/// A worker whose heartbeat went silent for too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleWorker {
    /// Process ID.
    pub pid: Pid,
    /// Ordinal slot.
    pub nr: usize,
    /// How long the heartbeat has been silent.
    pub silent_for: Duration,
}

/// Find workers whose heartbeat is older than `timeout` as of `now`.
///
/// Workers that never toggled their heartbeat are exempt.
pub fn find_stale(pool: &WorkerPool, timeout: Duration, now: SystemTime) -> Vec<StaleWorker> {
    let mut stale = Vec::new();
    for record in pool.iter() {
        let silent_for = match record.worker().heartbeat().silent_for(now) {
            Ok(Some(silent_for)) => silent_for,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker = record.nr(), pid = %record.pid(), error = %e, "cannot stat heartbeat");
                continue;
            }
        };
        if silent_for > timeout {
            stale.push(StaleWorker {
                pid: record.pid(),
                nr: record.nr(),
                silent_for,
            });
        }
    }
    stale
}
