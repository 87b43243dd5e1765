//! Registry of live workers, keyed by process ID.
//!
//! The pool only does bookkeeping and signal delivery. The manager decides
//! when to spawn, reap, or retire workers.

use std::collections::HashMap;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::proc::WorkerRecord;
use super::signals::{TerminationReason, analyze_wait_status};

/// What it takes to bring the pool to the desired size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile<K> {
    /// Live count already matches.
    Steady,
    /// Spawn workers for these ordinals.
    Spawn(Vec<usize>),
    /// Gracefully retire these workers.
    Retire(Vec<K>),
}

/// Plan how to converge `live` workers (key, ordinal) on `desired`.
///
/// Too few workers: every ordinal in `[0, desired)` without a live holder is
/// spawned. Too many: every worker whose ordinal is `>= desired` is retired.
pub fn plan_reconcile<K: Copy>(live: &[(K, usize)], desired: usize) -> Reconcile<K> {
    if live.len() == desired {
        return Reconcile::Steady;
    }
    if live.len() < desired {
        let missing = (0..desired)
            .filter(|nr| !live.iter().any(|(_, held)| held == nr))
            .collect();
        return Reconcile::Spawn(missing);
    }
    let excess = live
        .iter()
        .filter(|(_, nr)| *nr >= desired)
        .map(|(key, _)| *key)
        .collect();
    Reconcile::Retire(excess)
}

/// A child collected by [`WorkerPool::reap_all`].
#[derive(Debug)]
pub struct Reaped {
    /// Process ID of the child.
    pub pid: Pid,
    /// Ordinal, if the child was a registered worker.
    pub nr: Option<usize>,
    /// Why it went away.
    pub reason: TerminationReason,
}

/// The manager's registry of live workers.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<Pid, WorkerRecord>,
    ready_seq: u64,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Register a freshly forked worker.
    pub fn insert(&mut self, record: WorkerRecord) {
        self.workers.insert(record.pid(), record);
    }

    /// Drop a worker's record, closing its pipes and heartbeat.
    pub fn remove(&mut self, pid: Pid) -> Option<WorkerRecord> {
        self.workers.remove(&pid)
    }

    /// Look up a worker.
    pub fn get(&self, pid: Pid) -> Option<&WorkerRecord> {
        self.workers.get(&pid)
    }

    /// Iterate over live workers.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// `(pid, ordinal)` for every live worker.
    pub fn ordinals(&self) -> Vec<(Pid, usize)> {
        self.workers.values().map(|w| (w.pid(), w.nr())).collect()
    }

    /// Whether any worker is waiting for a job.
    pub fn has_ready(&self) -> bool {
        self.workers.values().any(WorkerRecord::is_ready)
    }

    /// Record readiness reports from `pid`.
    pub fn collect_ready(&mut self, pid: Pid) {
        self.ready_seq += 1;
        let seq = self.ready_seq;
        if let Some(record) = self.workers.get_mut(&pid) {
            match record.collect_ready(seq) {
                Ok(true) => {}
                Ok(false) => debug!(worker = record.nr(), %pid, "ready pipe closed"),
                Err(e) => warn!(worker = record.nr(), %pid, error = %e, "failed to read ready pipe"),
            }
        }
    }

    /// The worker that has been waiting for a job the longest.
    pub fn longest_ready(&mut self) -> Option<&mut WorkerRecord> {
        self.workers
            .values_mut()
            .filter(|w| w.is_ready())
            .min_by_key(|w| (w.ready_since(), w.nr()))
    }

    /// Deliver `signal` to one worker, forgetting it if it is already gone.
    pub fn kill_worker(&mut self, pid: Pid, signal: Signal) {
        let Some(record) = self.workers.get(&pid) else {
            return;
        };
        match record.signal(signal) {
            Ok(true) => {}
            Ok(false) => {
                self.workers.remove(&pid);
            }
            Err(e) => warn!(%pid, signal = signal.as_str(), error = %e, "failed to signal worker"),
        }
    }

    /// Deliver `signal` to every worker.
    pub fn kill_each_worker(&mut self, signal: Signal) {
        let pids: Vec<Pid> = self.workers.keys().copied().collect();
        for pid in pids {
            self.kill_worker(pid, signal);
        }
    }

    /// Collect every exited child without blocking.
    pub fn reap_all(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    let nr = self.workers.remove(&pid).map(|record| record.nr());
                    reaped.push(Reaped {
                        pid,
                        nr,
                        reason: analyze_wait_status(status),
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        reaped
    }

    /// Block until `pid` exits and drop its record.
    pub fn reap_blocking(&mut self, pid: Pid) -> Option<Reaped> {
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    let nr = self.workers.remove(&pid).map(|record| record.nr());
                    return Some(Reaped {
                        pid,
                        nr,
                        reason: analyze_wait_status(status),
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.workers.remove(&pid);
                    return None;
                }
            }
        }
    }

    /// Drop every record without signalling anyone.
    ///
    /// Used in a freshly forked worker, which inherited copies of the other
    /// workers' descriptors and must close them.
    pub fn forget_inherited(&mut self) {
        self.workers.clear();
    }
}
